//! Process-wide provider registry and `"provider:model"` resolution.
//!
//! Registration is rare (bootstrap or hot-registration) and reads dominate,
//! so entries sit behind a read-biased `RwLock`. Default registration is
//! idempotent; `register_replace` exists for explicit overrides and `clear`
//! for tests.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;

use crate::capability::{Capability, CapabilitySet};
use crate::config::ProviderConfig;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::http::reqwest::ReqwestTransport;
use crate::provider::anthropic_messages::AnthropicMessagesModel;
use crate::provider::compat;
use crate::provider::google_gemini::GoogleGeminiModel;
use crate::provider::ollama::OllamaModel;
use crate::provider::openai_chat::OpenAiChatModel;
use crate::provider::openai_responses::OpenAiResponsesModel;
use crate::provider::{
    DynEmbeddingModel, DynImageModel, DynLanguageModel,
};

/// Produces capability-implementing model instances from a config.
///
/// A factory only implements the constructors its provider supports; the
/// defaults report [`LLMError::UnsupportedCapability`].
pub trait ProviderFactory: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    fn language_model(&self, config: &ProviderConfig) -> Result<DynLanguageModel, LLMError>;

    fn embedding_model(&self, _config: &ProviderConfig) -> Result<DynEmbeddingModel, LLMError> {
        Err(LLMError::UnsupportedCapability {
            capability: "embedding",
        })
    }

    fn image_model(&self, _config: &ProviderConfig) -> Result<DynImageModel, LLMError> {
        Err(LLMError::UnsupportedCapability {
            capability: "image_generation",
        })
    }
}

pub type DynProviderFactory = Arc<dyn ProviderFactory>;

struct Registration {
    factory: DynProviderFactory,
    capabilities: CapabilitySet,
    metadata: HashMap<String, Value>,
}

/// Registry mapping provider ids to factories.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static ProviderRegistry {
        static GLOBAL: OnceLock<ProviderRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ProviderRegistry::new)
    }

    /// Registers a factory; returns `false` when the id already exists
    /// (registration is idempotent by default).
    pub fn register(&self, factory: DynProviderFactory) -> bool {
        self.register_with_metadata(factory, HashMap::new())
    }

    /// Registers a factory with arbitrary metadata attached.
    pub fn register_with_metadata(
        &self,
        factory: DynProviderFactory,
        metadata: HashMap<String, Value>,
    ) -> bool {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let id = factory.id().to_string();
        if entries.contains_key(&id) {
            return false;
        }
        let capabilities = factory.capabilities();
        entries.insert(
            id,
            Registration {
                factory,
                capabilities,
                metadata,
            },
        );
        true
    }

    /// Registers a factory, replacing any existing registration.
    pub fn register_replace(&self, factory: DynProviderFactory) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let capabilities = factory.capabilities();
        entries.insert(
            factory.id().to_string(),
            Registration {
                factory,
                capabilities,
                metadata: HashMap::new(),
            },
        );
    }

    pub fn unregister(&self, provider_id: &str) -> bool {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(provider_id)
            .is_some()
    }

    /// Removes every registration; intended for tests.
    pub fn clear(&self) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .clear();
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(provider_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, provider_id: &str) -> Option<DynProviderFactory> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(provider_id)
            .map(|r| r.factory.clone())
    }

    pub fn metadata(&self, provider_id: &str) -> Option<HashMap<String, Value>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(provider_id)
            .map(|r| r.metadata.clone())
    }

    pub fn has_capability(&self, provider_id: &str, capability: Capability) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(provider_id)
            .is_some_and(|r| r.capabilities.contains(capability))
    }

    pub fn find_providers_with_capability(&self, capability: Capability) -> Vec<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, r)| r.capabilities.contains(capability))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn find_providers_with_all_capabilities(&self, required: &[Capability]) -> Vec<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, r)| r.capabilities.contains_all(required))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Picks the provider scoring highest on
    /// `|required| + |preferred ∩ capabilities|`; every required capability
    /// must be present. Ties break lexicographically for determinism.
    pub fn find_best_provider(
        &self,
        required: &[Capability],
        preferred: &[Capability],
    ) -> Option<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .iter()
            .filter(|(_, r)| r.capabilities.contains_all(required))
            .map(|(id, r)| {
                let score = required.len() + r.capabilities.overlap(preferred);
                (id.clone(), score)
            })
            .max_by(|(id_a, score_a), (id_b, score_b)| {
                score_a.cmp(score_b).then_with(|| id_b.cmp(id_a))
            })
            .map(|(id, _)| id)
    }

    /// Registers every built-in provider factory. Idempotent: already
    /// registered ids are left untouched.
    pub fn register_defaults(&self) {
        for factory in builtin_factories() {
            self.register(factory);
        }
    }
}

/// Constructor table entry for the built-in factories.
struct BuiltinFactory {
    id: &'static str,
    capabilities: &'static [Capability],
    language: fn(DynHttpTransport, ProviderConfig) -> Result<DynLanguageModel, LLMError>,
    embedding: Option<fn(DynHttpTransport, ProviderConfig) -> Result<DynEmbeddingModel, LLMError>>,
    image: Option<fn(DynHttpTransport, ProviderConfig) -> Result<DynImageModel, LLMError>>,
}

impl BuiltinFactory {
    fn transport(&self, config: &ProviderConfig) -> Result<DynHttpTransport, LLMError> {
        Ok(Arc::new(ReqwestTransport::from_config(config)?))
    }
}

impl ProviderFactory for BuiltinFactory {
    fn id(&self) -> &str {
        self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(self.capabilities)
    }

    fn language_model(&self, config: &ProviderConfig) -> Result<DynLanguageModel, LLMError> {
        (self.language)(self.transport(config)?, config.clone())
    }

    fn embedding_model(&self, config: &ProviderConfig) -> Result<DynEmbeddingModel, LLMError> {
        match self.embedding {
            Some(ctor) => ctor(self.transport(config)?, config.clone()),
            None => Err(LLMError::UnsupportedCapability {
                capability: "embedding",
            }),
        }
    }

    fn image_model(&self, config: &ProviderConfig) -> Result<DynImageModel, LLMError> {
        match self.image {
            Some(ctor) => ctor(self.transport(config)?, config.clone()),
            None => Err(LLMError::UnsupportedCapability {
                capability: "image_generation",
            }),
        }
    }
}

const CHAT_STACK: &[Capability] = &[
    Capability::Chat,
    Capability::Streaming,
    Capability::ToolCalling,
];

fn builtin_factories() -> Vec<DynProviderFactory> {
    fn openai_chat(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(OpenAiChatModel::new(transport, config)))
    }
    fn openai_responses(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(OpenAiResponsesModel::new(transport, config)))
    }
    fn anthropic(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(AnthropicMessagesModel::new(transport, config)))
    }
    fn google(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(GoogleGeminiModel::new(transport, config)))
    }
    fn ollama(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(OllamaModel::new(transport, config)))
    }
    fn xai_responses(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(compat::xai_responses(transport, config)))
    }
    fn minimax(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynLanguageModel, LLMError> {
        Ok(Arc::new(compat::minimax(transport, config)))
    }
    fn openai_embedding(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynEmbeddingModel, LLMError> {
        Ok(Arc::new(crate::embedding::OpenAiEmbeddingModel::new(
            transport, config,
        )))
    }
    fn ollama_embedding(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynEmbeddingModel, LLMError> {
        Ok(Arc::new(crate::embedding::OllamaEmbeddingModel::new(
            transport, config,
        )))
    }
    fn openai_image(
        transport: DynHttpTransport,
        config: ProviderConfig,
    ) -> Result<DynImageModel, LLMError> {
        Ok(Arc::new(crate::image::OpenAiImageModel::new(
            transport, config,
        )))
    }

    let mut factories: Vec<DynProviderFactory> = vec![
        Arc::new(BuiltinFactory {
            id: "openai",
            capabilities: &[
                Capability::Chat,
                Capability::Streaming,
                Capability::ToolCalling,
                Capability::Reasoning,
                Capability::Vision,
                Capability::Embedding,
                Capability::ImageGeneration,
                Capability::OpenAiResponses,
                Capability::ModelListing,
                Capability::FileManagement,
            ],
            language: openai_chat,
            embedding: Some(openai_embedding),
            image: Some(openai_image),
        }),
        Arc::new(BuiltinFactory {
            id: "openai.responses",
            capabilities: &[
                Capability::Chat,
                Capability::Streaming,
                Capability::ToolCalling,
                Capability::Reasoning,
                Capability::Vision,
                Capability::OpenAiResponses,
                Capability::ImageGeneration,
                Capability::LiveSearch,
            ],
            language: openai_responses,
            embedding: None,
            image: None,
        }),
        Arc::new(BuiltinFactory {
            id: "anthropic",
            capabilities: &[
                Capability::Chat,
                Capability::Streaming,
                Capability::ToolCalling,
                Capability::Reasoning,
                Capability::Vision,
                Capability::LiveSearch,
            ],
            language: anthropic,
            embedding: None,
            image: None,
        }),
        Arc::new(BuiltinFactory {
            id: "google",
            capabilities: &[
                Capability::Chat,
                Capability::Streaming,
                Capability::ToolCalling,
                Capability::Reasoning,
                Capability::Vision,
            ],
            language: google,
            embedding: None,
            image: None,
        }),
        Arc::new(BuiltinFactory {
            id: "ollama",
            capabilities: &[
                Capability::Chat,
                Capability::Streaming,
                Capability::ToolCalling,
                Capability::Vision,
                Capability::Embedding,
                Capability::ModelListing,
            ],
            language: ollama,
            embedding: Some(ollama_embedding),
            image: None,
        }),
        Arc::new(BuiltinFactory {
            id: "xai.responses",
            capabilities: &[
                Capability::Chat,
                Capability::Streaming,
                Capability::ToolCalling,
                Capability::Reasoning,
                Capability::LiveSearch,
                Capability::OpenAiResponses,
            ],
            language: xai_responses,
            embedding: None,
            image: None,
        }),
        Arc::new(BuiltinFactory {
            id: "minimax",
            capabilities: CHAT_STACK,
            language: minimax,
            embedding: None,
            image: None,
        }),
    ];

    // Audio-only provider: registered for capability queries; chat calls
    // surface as unsupported.
    factories.push(Arc::new(AudioOnlyFactory { id: "elevenlabs" }));

    // OpenAI-compatible derivatives share one constructor parameterized by
    // vendor id; each also answers to its `*-openai` alias.
    for vendor in ["deepseek", "xai", "groq", "openrouter", "minimax-openai"] {
        factories.push(Arc::new(CompatChatFactory { vendor }));
        if !vendor.ends_with("-openai") {
            factories.push(Arc::new(CompatChatFactory {
                vendor: match vendor {
                    "deepseek" => "deepseek-openai",
                    "xai" => "xai-openai",
                    "groq" => "groq-openai",
                    "openrouter" => "openrouter-openai",
                    other => other,
                },
            }));
        }
    }
    factories
}

struct AudioOnlyFactory {
    id: &'static str,
}

impl ProviderFactory for AudioOnlyFactory {
    fn id(&self) -> &str {
        self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::AudioInput, Capability::AudioOutput])
    }

    fn language_model(&self, _config: &ProviderConfig) -> Result<DynLanguageModel, LLMError> {
        Err(LLMError::UnsupportedCapability { capability: "chat" })
    }
}

struct CompatChatFactory {
    vendor: &'static str,
}

impl ProviderFactory for CompatChatFactory {
    fn id(&self) -> &str {
        self.vendor
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut caps = CapabilitySet::of(CHAT_STACK);
        if self.vendor.starts_with("deepseek") || self.vendor.starts_with("xai") {
            caps = caps.with(Capability::Reasoning);
        }
        if self.vendor.starts_with("xai") {
            caps = caps.with(Capability::LiveSearch);
        }
        caps
    }

    fn language_model(&self, config: &ProviderConfig) -> Result<DynLanguageModel, LLMError> {
        let transport: DynHttpTransport = Arc::new(ReqwestTransport::from_config(config)?);
        Ok(Arc::new(compat::openai_compatible(
            self.vendor,
            transport,
            config.clone(),
        )?))
    }
}

const DEFAULT_SEPARATOR: char = ':';

/// Resolves combined `"provider:model"` identifiers against a registry.
pub struct RegistryClient {
    registry: &'static ProviderRegistry,
    separator: char,
    configs: HashMap<String, ProviderConfig>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    /// Client over the global registry with defaults registered.
    pub fn new() -> Self {
        let registry = ProviderRegistry::global();
        registry.register_defaults();
        Self {
            registry,
            separator: DEFAULT_SEPARATOR,
            configs: HashMap::new(),
        }
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Supplies a per-provider config (API key, base URL, extensions).
    pub fn with_config(mut self, provider_id: impl Into<String>, config: ProviderConfig) -> Self {
        self.configs.insert(provider_id.into(), config);
        self
    }

    /// Splits `"provider:model"`; a missing separator is an error.
    pub fn parse<'a>(&self, combined: &'a str) -> Result<(&'a str, &'a str), LLMError> {
        combined
            .split_once(self.separator)
            .filter(|(provider, model)| !provider.is_empty() && !model.is_empty())
            .ok_or_else(|| {
                LLMError::invalid_request(format!(
                    "expected `provider{}model`, got `{combined}`",
                    self.separator
                ))
            })
    }

    fn factory_and_config(
        &self,
        combined: &str,
    ) -> Result<(DynProviderFactory, ProviderConfig), LLMError> {
        let (provider_id, model_id) = self.parse(combined)?;
        let factory = self.registry.get(provider_id).ok_or_else(|| {
            LLMError::invalid_request(format!("unknown provider `{provider_id}`"))
        })?;
        let mut config = self.configs.get(provider_id).cloned().unwrap_or_default();
        config.model = Some(model_id.to_string());
        Ok((factory, config))
    }

    /// Resolves a combined id to a language model.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsunagi_llm::registry::RegistryClient;
    ///
    /// let client = RegistryClient::new();
    /// let model = client.language_model("openai:gpt-4o").expect("resolves");
    /// assert_eq!(model.provider_id(), "openai");
    /// ```
    pub fn language_model(&self, combined: &str) -> Result<DynLanguageModel, LLMError> {
        let (factory, config) = self.factory_and_config(combined)?;
        factory.language_model(&config)
    }

    /// Resolves a combined id to an embedding model.
    pub fn text_embedding_model(&self, combined: &str) -> Result<DynEmbeddingModel, LLMError> {
        let (factory, config) = self.factory_and_config(combined)?;
        factory.embedding_model(&config)
    }

    /// Resolves a combined id to an image model.
    pub fn image_model(&self, combined: &str) -> Result<DynImageModel, LLMError> {
        let (factory, config) = self.factory_and_config(combined)?;
        factory.image_model(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestFactory {
        id: &'static str,
        caps: Vec<Capability>,
    }

    impl ProviderFactory for TestFactory {
        fn id(&self) -> &str {
            self.id
        }

        fn capabilities(&self) -> CapabilitySet {
            self.caps.iter().copied().collect()
        }

        fn language_model(&self, _config: &ProviderConfig) -> Result<DynLanguageModel, LLMError> {
            Err(LLMError::other("test factory"))
        }
    }

    fn registry_with(entries: Vec<TestFactory>) -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        for factory in entries {
            registry.register(Arc::new(factory));
        }
        registry
    }

    #[test]
    fn registration_is_idempotent_and_replace_is_explicit() {
        let registry = registry_with(vec![TestFactory {
            id: "p1",
            caps: vec![Capability::Chat],
        }]);
        assert!(!registry.register(Arc::new(TestFactory {
            id: "p1",
            caps: vec![Capability::Embedding],
        })));
        // idempotent register kept the original capability set
        assert!(registry.has_capability("p1", Capability::Chat));
        assert!(!registry.has_capability("p1", Capability::Embedding));

        registry.register_replace(Arc::new(TestFactory {
            id: "p1",
            caps: vec![Capability::Embedding],
        }));
        assert!(registry.has_capability("p1", Capability::Embedding));
    }

    #[test]
    fn capability_queries_filter_and_score() {
        let registry = registry_with(vec![
            TestFactory {
                id: "chat-only",
                caps: vec![Capability::Chat],
            },
            TestFactory {
                id: "full",
                caps: vec![
                    Capability::Chat,
                    Capability::Streaming,
                    Capability::ToolCalling,
                    Capability::Vision,
                ],
            },
            TestFactory {
                id: "tools",
                caps: vec![Capability::Chat, Capability::ToolCalling],
            },
        ]);

        assert_eq!(
            registry.find_providers_with_capability(Capability::ToolCalling),
            vec!["full".to_string(), "tools".to_string()]
        );
        assert_eq!(
            registry
                .find_providers_with_all_capabilities(&[Capability::Chat, Capability::Streaming]),
            vec!["full".to_string()]
        );
        assert_eq!(
            registry.find_best_provider(
                &[Capability::Chat],
                &[Capability::Vision, Capability::Streaming]
            ),
            Some("full".to_string())
        );
        assert_eq!(
            registry.find_best_provider(&[Capability::Embedding], &[]),
            None
        );
    }

    #[test]
    fn unregister_and_clear_remove_entries() {
        let registry = registry_with(vec![TestFactory {
            id: "p1",
            caps: vec![Capability::Chat],
        }]);
        assert!(registry.unregister("p1"));
        assert!(!registry.unregister("p1"));
        registry.register(Arc::new(TestFactory {
            id: "p2",
            caps: vec![],
        }));
        registry.clear();
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn client_parses_combined_ids_with_custom_separator() {
        let client = RegistryClient::new().with_separator('/');
        assert_eq!(client.parse("openai/gpt-4o").unwrap(), ("openai", "gpt-4o"));
        assert!(client.parse("no-separator").is_err());
        assert!(client.parse(":model").is_err());
    }

    #[test]
    fn default_registration_covers_canonical_providers() {
        let client = RegistryClient::new();
        for id in [
            "openai",
            "anthropic",
            "google",
            "ollama",
            "deepseek",
            "xai",
            "groq",
            "openrouter",
            "minimax",
            "xai.responses",
            "deepseek-openai",
        ] {
            assert!(
                client.registry.contains(id),
                "missing default provider {id}"
            );
        }
    }

    #[test]
    fn resolved_models_carry_the_model_id_from_the_combined_id() {
        let client = RegistryClient::new()
            .with_config("ollama", ProviderConfig::new());
        let model = client.language_model("ollama:llama3.2").expect("model");
        assert_eq!(model.provider_id(), "ollama");
    }
}
