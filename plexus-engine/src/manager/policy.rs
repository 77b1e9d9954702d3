//! Permission policies for the reference manager
//!
//! A [`PermissionPolicy`] turns a call or activation request into a
//! [`PermissionDecision`]. The manager asks the policy, records the outcome
//! in its audit sink and answers the engine with a plain boolean.

use plexus_api::Profile;

use super::grants::Grants;

/// A plugin asking to call `to.method`
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub from: &'a Profile,
    pub to: &'a Profile,
    pub method: &'a str,
}

/// A plugin asking for `to` to be activated on its behalf
#[derive(Debug, Clone, Copy)]
pub struct ActivationContext<'a> {
    pub from: &'a Profile,
    pub to: &'a Profile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    /// Refuse with a human-readable reason
    Deny(String),
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Denial reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}

/// Decides which calls and activations the manager allows
///
/// # Example
///
/// ```rust
/// use plexus_engine::manager::{
///     ActivationContext, CallContext, PermissionDecision, PermissionPolicy,
/// };
///
/// /// Only plugins prefixed with `core.` may wake others up
/// struct CoreActivates;
///
/// impl PermissionPolicy for CoreActivates {
///     fn check_call(&self, _ctx: &CallContext<'_>) -> PermissionDecision {
///         PermissionDecision::Allow
///     }
///
///     fn check_activation(&self, ctx: &ActivationContext<'_>) -> PermissionDecision {
///         if ctx.from.name.starts_with("core.") {
///             PermissionDecision::Allow
///         } else {
///             PermissionDecision::Deny(format!("{} is not a core plugin", ctx.from.name))
///         }
///     }
/// }
/// ```
pub trait PermissionPolicy: Send + Sync {
    fn check_call(&self, ctx: &CallContext<'_>) -> PermissionDecision;

    fn check_activation(&self, ctx: &ActivationContext<'_>) -> PermissionDecision;
}

// ============================================================================
// Implementations
// ============================================================================

/// Allows every call and activation
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPolicy;

impl PermissionPolicy for DefaultPolicy {
    fn check_call(&self, _ctx: &CallContext<'_>) -> PermissionDecision {
        PermissionDecision::Allow
    }

    fn check_activation(&self, _ctx: &ActivationContext<'_>) -> PermissionDecision {
        PermissionDecision::Allow
    }
}

/// Allows only what a [`Grants`] set lists
///
/// Calls addressed to the manager itself are always allowed so plugins can
/// inspect profiles and liveness.
#[derive(Debug, Clone)]
pub struct StrictPolicy {
    grants: Grants,
    manager: String,
}

impl StrictPolicy {
    pub fn new(grants: Grants) -> Self {
        Self {
            grants,
            manager: plexus_api::MANAGER_NAME.to_string(),
        }
    }

    /// Name of the manager whose methods stay callable
    pub fn manager_name(mut self, name: impl Into<String>) -> Self {
        self.manager = name.into();
        self
    }

    pub fn grants(&self) -> &Grants {
        &self.grants
    }
}

impl PermissionPolicy for StrictPolicy {
    fn check_call(&self, ctx: &CallContext<'_>) -> PermissionDecision {
        if ctx.to.name == self.manager
            || self
                .grants
                .permits_call(&ctx.from.name, &ctx.to.name, ctx.method)
        {
            PermissionDecision::Allow
        } else {
            PermissionDecision::Deny(format!(
                "no grant for {} -> {}.{}",
                ctx.from.name, ctx.to.name, ctx.method
            ))
        }
    }

    fn check_activation(&self, ctx: &ActivationContext<'_>) -> PermissionDecision {
        if self.grants.permits_activation(&ctx.from.name, &ctx.to.name) {
            PermissionDecision::Allow
        } else {
            PermissionDecision::Deny(format!(
                "{} may not activate {}",
                ctx.from.name, ctx.to.name
            ))
        }
    }
}

/// Refuses everything except calls to the manager
#[derive(Debug, Clone)]
pub struct DenyAllPolicy {
    manager: String,
}

impl Default for DenyAllPolicy {
    fn default() -> Self {
        Self {
            manager: plexus_api::MANAGER_NAME.to_string(),
        }
    }
}

impl DenyAllPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PermissionPolicy for DenyAllPolicy {
    fn check_call(&self, ctx: &CallContext<'_>) -> PermissionDecision {
        if ctx.to.name == self.manager {
            PermissionDecision::Allow
        } else {
            PermissionDecision::Deny("all calls are denied".into())
        }
    }

    fn check_activation(&self, _ctx: &ActivationContext<'_>) -> PermissionDecision {
        PermissionDecision::Deny("all activations are denied".into())
    }
}
