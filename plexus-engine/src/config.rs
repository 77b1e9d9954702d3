//! Engine configuration

use serde::{Deserialize, Deserializer, Serialize};

/// Default bound on nested cascading activations
pub const DEFAULT_MAX_ACTIVATION_DEPTH: usize = 32;

/// Tunables for [`crate::Engine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum length of an activation chain (a plugin whose activation hook
    /// calls into an inactive plugin, whose hook calls into another, ...)
    ///
    /// Never below 1, whether set through the builder or deserialized.
    #[serde(deserialize_with = "at_least_one")]
    pub max_activation_depth: usize,
}

fn at_least_one<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(usize::deserialize(deserializer)?.max(1))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_activation_depth: DEFAULT_MAX_ACTIVATION_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the activation chain bound (at least 1)
    pub fn max_activation_depth(mut self, depth: usize) -> Self {
        self.max_activation_depth = depth.max(1);
        self
    }
}
