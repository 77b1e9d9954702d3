//! Permission authority contract
//!
//! The authority owns every plugin's profile and liveness flag. The engine
//! never caches either: it asks again before each decision.

use async_trait::async_trait;
use plexus_api::{Profile, MANAGER_NAME};

use crate::error::AuthorityError;

/// Source of truth for profiles, liveness and permission decisions
///
/// Implementations are usually also registered as the reserved `manager`
/// plugin (see [`crate::Engine::bootstrap`]).
#[async_trait]
pub trait PermissionAuthority: Send + Sync {
    /// Reserved plugin name lifecycle events are broadcast under
    fn authority_name(&self) -> &str {
        MANAGER_NAME
    }

    /// Record (or replace) a profile
    async fn add_profile(&self, profile: Profile) -> Result<(), AuthorityError>;

    /// Current profile of `name`
    async fn get_profile(&self, name: &str) -> Result<Profile, AuthorityError>;

    /// Whether `name` is currently active
    async fn is_active(&self, name: &str) -> Result<bool, AuthorityError>;

    /// Whether `from` may call `to.method`
    async fn can_call(
        &self,
        from: &Profile,
        to: &Profile,
        method: &str,
    ) -> Result<bool, AuthorityError>;

    /// Whether `from` may cause `to` to be activated
    async fn can_activate(&self, from: &Profile, to: &Profile) -> Result<bool, AuthorityError>;

    /// Flip the liveness flag of `name`
    async fn toggle_active(&self, name: &str) -> Result<(), AuthorityError>;
}
