//! Agent self-description.

use serde::{Deserialize, Serialize};

/// What an agent knows about itself. Consumed by the registry listing,
/// the LLM classifier's candidate list, and handoff reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cognition {
    pub name: String,
    pub role: String,
    pub description: String,
    /// Capabilities the agent advertises (e.g. "schedule_management").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Requests this agent handles well.
    #[serde(default)]
    pub good_at: Vec<String>,
    /// Requests this agent should not receive.
    #[serde(default)]
    pub not_suited: Vec<String>,
}

impl Cognition {
    pub fn new(name: impl Into<String>, role: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            description: description.into(),
            capabilities: Vec::new(),
            good_at: Vec::new(),
            not_suited: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}
