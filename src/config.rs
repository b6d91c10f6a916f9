use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 描述一个可调用后端的配置。
///
/// Provider-specific knobs never get their own fields: they all live in the
/// [`extensions`](ProviderConfig::extensions) map and are read back through
/// the typed accessor [`ProviderConfig::extension`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key; resolved from the provider's environment variable when unset.
    pub api_key: Option<String>,
    /// Base URL override for proxies and compatible gateways.
    pub base_url: Option<String>,
    /// Default model identifier used when a call does not name one.
    pub model: Option<String>,
    /// Overall request timeout; transports split this across send/receive.
    pub timeout: Option<Duration>,
    /// Sole carrier of provider-specific settings (headers, MCP servers,
    /// web-search config, proxy/TLS options, thinking budget, ...).
    #[serde(default)]
    pub extensions: HashMap<String, Value>,
}

impl ProviderConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stores a provider-specific extension value.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsunagi_llm::config::{ProviderConfig, ext};
    ///
    /// let config = ProviderConfig::new().with_extension(ext::THINKING_BUDGET, 2048);
    /// assert_eq!(config.extension::<u32>(ext::THINKING_BUDGET), Some(2048));
    /// ```
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Retrieves a typed extension value.
    ///
    /// Returns `None` when the key is absent or the stored value does not
    /// deserialize into `T`, so callers never observe panics on a mismatched
    /// shape.
    pub fn extension<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.extensions
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Resolves the API key, falling back to `env_var` when unset.
    pub fn resolve_api_key(&self, env_var: &str) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(env_var).ok().filter(|v| !v.is_empty()))
    }
}

/// Well-known extension keys.
///
/// Providers only look at the keys they understand; unknown keys are ignored,
/// which keeps one config shareable across backends.
pub mod ext {
    /// HTTP proxy URL applied to the transport.
    pub const HTTP_PROXY: &str = "http_proxy";
    /// Connect timeout in milliseconds; the send/receive budget comes from
    /// `ProviderConfig::timeout`.
    pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";
    /// Disable TLS certificate verification (unsupported on browser-like
    /// hosts; warned only).
    pub const BYPASS_SSL_VERIFICATION: &str = "bypass_ssl_verification";
    /// PEM-encoded custom CA certificate.
    pub const SSL_CERTIFICATE: &str = "ssl_certificate";
    /// Extra headers merged into every request.
    pub const EXTRA_HEADERS: &str = "extra_headers";
    /// Web-search tool configuration (see `WebSearchConfig`).
    pub const WEB_SEARCH: &str = "web_search";
    /// Anthropic extended-thinking token budget.
    pub const THINKING_BUDGET: &str = "thinking_budget";
    /// Anthropic MCP server descriptors forwarded verbatim.
    pub const MCP_SERVERS: &str = "mcp_servers";
    /// Anthropic container identifier.
    pub const CONTAINER: &str = "container";
    /// `user_id` merged into request metadata.
    pub const USER_ID: &str = "user_id";
    /// Native rerank endpoint; absent means the embedding fallback is used.
    pub const RERANK_ENDPOINT: &str = "rerank_endpoint";
    /// Anthropic `anthropic-version` header override.
    pub const ANTHROPIC_VERSION: &str = "anthropic_version";
    /// Static request metadata merged under the provider's metadata field.
    pub const METADATA: &str = "metadata";
}

/// Configuration for provider-built web search tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub allowed_domains: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_domains: Option<Vec<String>>,
    #[serde(default)]
    pub user_location: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// extension<T> 在键缺失或类型不匹配时都返回 None
    #[test]
    fn extension_accessor_is_null_safe() {
        let config = ProviderConfig::new()
            .with_extension(ext::HTTP_PROXY, "http://127.0.0.1:7890")
            .with_extension(ext::THINKING_BUDGET, 1024);

        assert_eq!(
            config.extension::<String>(ext::HTTP_PROXY).as_deref(),
            Some("http://127.0.0.1:7890")
        );
        assert_eq!(config.extension::<u32>(ext::THINKING_BUDGET), Some(1024));
        // key miss
        assert_eq!(config.extension::<String>("missing"), None);
        // type mismatch
        assert_eq!(config.extension::<Vec<String>>(ext::THINKING_BUDGET), None);
    }

    #[test]
    fn web_search_config_roundtrips_through_extension() {
        let config = ProviderConfig::new().with_extension(
            ext::WEB_SEARCH,
            json!({"max_uses": 3, "allowed_domains": ["example.com"]}),
        );
        let ws: WebSearchConfig = config.extension(ext::WEB_SEARCH).expect("web search");
        assert_eq!(ws.max_uses, Some(3));
        assert_eq!(ws.allowed_domains.as_deref(), Some(&["example.com".to_string()][..]));
    }
}
