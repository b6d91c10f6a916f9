//! Vendor derivatives of the two dominant wire protocols.
//!
//! Most "new" LLM APIs are OpenAI Chat Completions with a different host
//! and key; a few speak Anthropic Messages. This module owns the table of
//! known derivatives and builds correctly-identified models for them,
//! including the `*-openai` compatibility aliases that make provider-option
//! lookup work under both names.

use crate::config::ProviderConfig;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::provider::anthropic_messages::AnthropicMessagesModel;
use crate::provider::openai_chat::OpenAiChatModel;
use crate::provider::openai_responses::OpenAiResponsesModel;

/// One known OpenAI-compatible vendor.
#[derive(Debug, Clone, Copy)]
pub struct CompatVendor {
    pub id: &'static str,
    pub base_url: &'static str,
    pub api_key_env: &'static str,
}

/// Vendors speaking the Chat Completions wire protocol.
pub const OPENAI_COMPATIBLE: &[CompatVendor] = &[
    CompatVendor {
        id: "deepseek",
        base_url: "https://api.deepseek.com",
        api_key_env: "DEEPSEEK_API_KEY",
    },
    CompatVendor {
        id: "xai",
        base_url: "https://api.x.ai",
        api_key_env: "XAI_API_KEY",
    },
    CompatVendor {
        id: "groq",
        base_url: "https://api.groq.com/openai",
        api_key_env: "GROQ_API_KEY",
    },
    CompatVendor {
        id: "openrouter",
        base_url: "https://openrouter.ai/api",
        api_key_env: "OPENROUTER_API_KEY",
    },
    CompatVendor {
        id: "minimax-openai",
        base_url: "https://api.minimaxi.com",
        api_key_env: "MINIMAX_API_KEY",
    },
];

fn lookup(vendor_id: &str) -> Option<&'static CompatVendor> {
    OPENAI_COMPATIBLE.iter().find(|v| v.id == vendor_id)
}

/// Builds a Chat Completions model for a known OpenAI-compatible vendor.
///
/// `vendor_id` may be the canonical id (`deepseek`) or its `*-openai` alias
/// (`deepseek-openai`); either way per-call provider options are honored
/// under both ids.
pub fn openai_compatible(
    vendor_id: &str,
    transport: DynHttpTransport,
    mut config: ProviderConfig,
) -> Result<OpenAiChatModel, LLMError> {
    let base_id = vendor_id.strip_suffix("-openai").unwrap_or(vendor_id);
    let vendor = lookup(vendor_id)
        .or_else(|| lookup(base_id))
        .ok_or_else(|| {
            LLMError::invalid_request(format!("unknown OpenAI-compatible vendor `{vendor_id}`"))
        })?;
    if config.base_url.is_none() {
        config.base_url = Some(vendor.base_url.to_string());
    }
    let alias = (vendor_id != base_id).then(|| base_id.to_string());
    Ok(OpenAiChatModel::with_identity(
        transport,
        config,
        vendor_id.to_string(),
        alias,
        vendor.api_key_env,
    ))
}

/// Builds the Responses-protocol variant xAI exposes (`xai.responses`).
pub fn xai_responses(
    transport: DynHttpTransport,
    mut config: ProviderConfig,
) -> OpenAiResponsesModel {
    if config.base_url.is_none() {
        config.base_url = Some("https://api.x.ai".to_string());
    }
    OpenAiResponsesModel::with_identity(transport, config, "xai.responses", "XAI_API_KEY")
}

/// Builds the Anthropic-compatible MiniMax model; base URLs go through the
/// same `/v1/` normalization as Anthropic proper.
pub fn minimax(transport: DynHttpTransport, mut config: ProviderConfig) -> AnthropicMessagesModel {
    if config.base_url.is_none() {
        config.base_url = Some("https://api.minimaxi.com".to_string());
    }
    AnthropicMessagesModel::with_identity(transport, config, "minimax", "MINIMAX_API_KEY")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::http::{
        HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport,
    };
    use crate::provider::LanguageModel;

    struct NoopTransport;

    #[async_trait]
    impl HttpTransport for NoopTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            Err(LLMError::connection("noop"))
        }

        async fn send_stream(
            &self,
            _request: HttpRequest,
        ) -> Result<HttpStreamResponse, LLMError> {
            Err(LLMError::connection("noop"))
        }
    }

    fn transport() -> DynHttpTransport {
        Arc::new(NoopTransport)
    }

    #[test]
    fn known_vendors_resolve_with_default_base_urls() {
        let model =
            openai_compatible("deepseek", transport(), ProviderConfig::new()).expect("vendor");
        assert_eq!(model.provider_id(), "deepseek");
        assert!(model.endpoint().starts_with("https://api.deepseek.com"));
    }

    #[test]
    fn openai_alias_resolves_to_base_vendor_table_entry() {
        let model = openai_compatible("deepseek-openai", transport(), ProviderConfig::new())
            .expect("vendor");
        assert_eq!(model.provider_id(), "deepseek-openai");
    }

    #[test]
    fn unknown_vendor_is_rejected() {
        let err = openai_compatible("nonexistent", transport(), ProviderConfig::new())
            .expect_err("should fail");
        assert!(matches!(err, LLMError::InvalidRequest { .. }));
    }

    #[test]
    fn config_base_url_wins_over_vendor_default() {
        let model = openai_compatible(
            "groq",
            transport(),
            ProviderConfig::new().with_base_url("http://proxy.local"),
        )
        .expect("vendor");
        assert!(model.endpoint().starts_with("http://proxy.local"));
    }
}
