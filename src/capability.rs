use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Feature a provider may declare support for.
///
/// Capabilities are declarative: the registry uses them to answer queries,
/// but requests are still forwarded best-effort and mismatches surface as
/// provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Streaming,
    ToolCalling,
    Reasoning,
    Vision,
    Embedding,
    ModelListing,
    FileManagement,
    ImageGeneration,
    AudioInput,
    AudioOutput,
    LiveSearch,
    OpenAiResponses,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Chat => "chat",
            Capability::Streaming => "streaming",
            Capability::ToolCalling => "tool_calling",
            Capability::Reasoning => "reasoning",
            Capability::Vision => "vision",
            Capability::Embedding => "embedding",
            Capability::ModelListing => "model_listing",
            Capability::FileManagement => "file_management",
            Capability::ImageGeneration => "image_generation",
            Capability::AudioInput => "audio_input",
            Capability::AudioOutput => "audio_output",
            Capability::LiveSearch => "live_search",
            Capability::OpenAiResponses => "openai_responses",
        };
        f.write_str(name)
    }
}

/// Set of capabilities declared by a provider registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from a slice of capabilities.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsunagi_llm::capability::{Capability, CapabilitySet};
    ///
    /// let caps = CapabilitySet::of(&[Capability::Chat, Capability::Streaming]);
    /// assert!(caps.contains(Capability::Chat));
    /// assert!(!caps.contains(Capability::Embedding));
    /// ```
    pub fn of(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().copied().collect())
    }

    /// Adds a capability, returning the modified set (builder style).
    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Returns `true` when every capability in `required` is present.
    pub fn contains_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.0.contains(c))
    }

    /// Returns `true` when at least one capability in `any` is present.
    pub fn contains_any(&self, any: &[Capability]) -> bool {
        any.iter().any(|c| self.0.contains(c))
    }

    /// Number of capabilities from `others` that this set also declares.
    pub fn overlap(&self, others: &[Capability]) -> usize {
        others.iter().filter(|c| self.0.contains(c)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
