//! Engine errors
//!
//! Every variant is terminal for the operation that produced it; the engine
//! never retries. Failures coming from the permission authority or from a
//! plugin hook are wrapped transparently so callers see them unchanged.
//!
//! | Variant | Code |
//! |---------|------|
//! | [`EngineError::AlreadyRegistered`] | `ALREADY_REGISTERED` |
//! | [`EngineError::NotRegistered`] | `NOT_REGISTERED` |
//! | [`EngineError::PermissionDenied`] | `PERMISSION_DENIED` |
//! | [`EngineError::NotActivatable`] | `NOT_ACTIVATABLE` |
//! | [`EngineError::MethodNotExposed`] | `METHOD_NOT_EXPOSED` |
//! | [`EngineError::Deactivated`] | `DEACTIVATED` |
//! | [`EngineError::ActivationCycle`] | `ACTIVATION_CYCLE` |
//! | [`EngineError::ActivationDepthExceeded`] | `ACTIVATION_DEPTH_EXCEEDED` |
//! | [`EngineError::InternalConsistency`] | `INTERNAL_CONSISTENCY` |
//! | [`EngineError::Authority`] | `AUTHORITY` |
//! | [`EngineError::Plugin`] | `PLUGIN` |

use std::fmt;

use plexus_api::PluginError;
use thiserror::Error;

/// Errors raised by a permission authority
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("no profile registered for '{0}'")]
    UnknownProfile(String),

    #[error("permission authority unavailable: {0}")]
    Unavailable(String),
}

/// Capability a plugin can invoke through its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Call,
    On,
    Once,
    Off,
    Emit,
    App,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::On => "on",
            Self::Once => "once",
            Self::Off => "off",
            Self::Emit => "emit",
            Self::App => "app",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine error
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("plugin '{0}' is not registered")]
    NotRegistered(String),

    #[error("'{caller}' is not allowed to call '{target}.{method}'")]
    PermissionDenied {
        caller: String,
        target: String,
        method: String,
    },

    #[error("'{caller}' is not allowed to activate '{target}'")]
    NotActivatable { caller: String, target: String },

    #[error(
        "method '{method}' is not exposed by '{target}' (exposed: [{}])",
        .exposed.join(", ")
    )]
    MethodNotExposed {
        target: String,
        method: String,
        exposed: Vec<String>,
    },

    #[error("cannot use '{operation}' from '{plugin}': plugin is deactivated")]
    Deactivated { plugin: String, operation: Operation },

    #[error("activation cycle detected: {}", .chain.join(" -> "))]
    ActivationCycle { chain: Vec<String> },

    #[error("activation chain exceeds {limit} plugins: {}", .chain.join(" -> "))]
    ActivationDepthExceeded { limit: usize, chain: Vec<String> },

    #[error("listener '{listener}' is subscribed to '{emitter}/{event}' without a callback")]
    InternalConsistency {
        listener: String,
        emitter: String,
        event: String,
    },

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl EngineError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRegistered(_) => "ALREADY_REGISTERED",
            Self::NotRegistered(_) => "NOT_REGISTERED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::NotActivatable { .. } => "NOT_ACTIVATABLE",
            Self::MethodNotExposed { .. } => "METHOD_NOT_EXPOSED",
            Self::Deactivated { .. } => "DEACTIVATED",
            Self::ActivationCycle { .. } => "ACTIVATION_CYCLE",
            Self::ActivationDepthExceeded { .. } => "ACTIVATION_DEPTH_EXCEEDED",
            Self::InternalConsistency { .. } => "INTERNAL_CONSISTENCY",
            Self::Authority(_) => "AUTHORITY",
            Self::Plugin(_) => "PLUGIN",
        }
    }

    /// Registry corruption; the event tables can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalConsistency { .. })
    }

    pub(crate) fn deactivated(plugin: impl Into<String>, operation: Operation) -> Self {
        Self::Deactivated {
            plugin: plugin.into(),
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_not_exposed_lists_methods() {
        let err = EngineError::MethodNotExposed {
            target: "calc".into(),
            method: "div".into(),
            exposed: vec!["add".into(), "sub".into()],
        };
        assert_eq!(
            err.to_string(),
            "method 'div' is not exposed by 'calc' (exposed: [add, sub])"
        );
        assert_eq!(err.code(), "METHOD_NOT_EXPOSED");
    }

    #[test]
    fn test_deactivated_names_operation() {
        let err = EngineError::deactivated("clock", Operation::Emit);
        assert!(err.to_string().contains("'emit'"));
        assert!(err.to_string().contains("'clock'"));
    }

    #[test]
    fn test_plugin_errors_are_transparent() {
        let err = EngineError::from(PluginError::user("boom"));
        assert_eq!(err.to_string(), PluginError::user("boom").to_string());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_cycle_formats_chain() {
        let err = EngineError::ActivationCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "activation cycle detected: a -> b -> a");
    }
}
