//! Reference permission authority
//!
//! [`PluginManager`] keeps profiles and liveness flags in memory and
//! delegates permission decisions to a [`PermissionPolicy`]. It is also a
//! [`Plugin`] so other plugins can query it through `call_method`:
//!
//! | Method | Arguments | Result |
//! |--------|-----------|--------|
//! | `getProfile` | `[name]` | profile object |
//! | `getProfiles` | `[]` | profiles sorted by name |
//! | `isActive` | `[name]` | boolean |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use plexus_engine::manager::{Grants, ManagerPresets};
//! use plexus_engine::Engine;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let grants = Grants::new().allow_call("ui", "clock").allow_activation("ui", "clock");
//! let manager = Arc::new(ManagerPresets::strict(grants));
//! let engine = Engine::bootstrap(manager).await.unwrap();
//! assert!(engine.is_active("manager").await.unwrap());
//! # });
//! ```

mod grants;
mod policy;
mod presets;

pub use grants::{ActivationGrant, CallGrant, Grants, GrantsError, GRANTS_VERSION};
pub use policy::{
    ActivationContext, CallContext, DefaultPolicy, DenyAllPolicy, PermissionDecision,
    PermissionPolicy, StrictPolicy,
};
pub use presets::{ManagerPresets, PluginManagerBuilder};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use plexus_api::{PluginError, Profile, Request, Value};

use crate::audit::{AuditEvent, AuditSink};
use crate::authority::PermissionAuthority;
use crate::error::AuthorityError;
use crate::plugin::Plugin;

pub const GET_PROFILE: &str = "getProfile";
pub const GET_PROFILES: &str = "getProfiles";
pub const IS_ACTIVE: &str = "isActive";

/// In-memory permission authority
pub struct PluginManager {
    name: String,
    profiles: RwLock<HashMap<String, Profile>>,
    active: RwLock<HashSet<String>>,
    policy: Arc<dyn PermissionPolicy>,
    audit: Arc<dyn AuditSink>,
}

impl PluginManager {
    pub(crate) fn new(
        name: String,
        policy: Arc<dyn PermissionPolicy>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            name,
            profiles: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            policy,
            audit,
        }
    }

    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the profile of an already known plugin
    ///
    /// Snapshots built before the update keep the old method list, but any
    /// call made through them is checked against the new one.
    pub fn update_profile(&self, profile: Profile) -> Result<(), AuthorityError> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        match profiles.get_mut(&profile.name) {
            Some(existing) => {
                tracing::info!(plugin = %profile.name, methods = ?profile.methods, "Profile updated");
                self.record(AuditEvent::profile_added(&profile.name, &profile.methods));
                *existing = profile;
                Ok(())
            }
            None => Err(AuthorityError::UnknownProfile(profile.name)),
        }
    }

    /// Known profiles sorted by name
    pub fn profiles(&self) -> Vec<Profile> {
        let mut profiles: Vec<Profile> = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    /// Active plugin names, sorted
    pub fn active_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Result<Profile, AuthorityError> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AuthorityError::UnknownProfile(name.to_string()))
    }

    fn active(&self, name: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("name", &self.name)
            .field("active", &self.active_plugins())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PermissionAuthority for PluginManager {
    fn authority_name(&self) -> &str {
        &self.name
    }

    async fn add_profile(&self, profile: Profile) -> Result<(), AuthorityError> {
        self.record(AuditEvent::profile_added(&profile.name, &profile.methods));
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.name.clone(), profile);
        Ok(())
    }

    async fn get_profile(&self, name: &str) -> Result<Profile, AuthorityError> {
        self.lookup(name)
    }

    async fn is_active(&self, name: &str) -> Result<bool, AuthorityError> {
        Ok(self.active(name))
    }

    async fn can_call(
        &self,
        from: &Profile,
        to: &Profile,
        method: &str,
    ) -> Result<bool, AuthorityError> {
        let decision = self.policy.check_call(&CallContext { from, to, method });
        tracing::debug!(
            from = %from.name,
            to = %to.name,
            method = %method,
            allowed = decision.is_allowed(),
            "Call permission checked"
        );
        self.record(AuditEvent::call(
            &from.name,
            &to.name,
            method,
            decision.reason().map(str::to_string),
        ));
        Ok(decision.is_allowed())
    }

    async fn can_activate(&self, from: &Profile, to: &Profile) -> Result<bool, AuthorityError> {
        let decision = self.policy.check_activation(&ActivationContext { from, to });
        self.record(AuditEvent::activation(
            &from.name,
            &to.name,
            decision.reason().map(str::to_string),
        ));
        Ok(decision.is_allowed())
    }

    async fn toggle_active(&self, name: &str) -> Result<(), AuthorityError> {
        let now_active = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            if !active.remove(name) {
                active.insert(name.to_string());
                true
            } else {
                false
            }
        };
        self.record(AuditEvent::toggled(name, now_active));
        Ok(())
    }
}

fn name_arg(method: &str, payload: &[Value]) -> Result<String, PluginError> {
    payload
        .first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PluginError::user(format!("{method} expects a plugin name")))
}

#[async_trait]
impl Plugin for PluginManager {
    fn profile(&self) -> Profile {
        Profile::new(self.name.clone())
            .methods([GET_PROFILE, GET_PROFILES, IS_ACTIVE])
            .description("Profiles, liveness and permissions")
    }

    async fn add_request(
        &self,
        _request: Request,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, PluginError> {
        match method {
            GET_PROFILE => {
                let name = name_arg(method, &payload)?;
                let profile = self
                    .lookup(&name)
                    .map_err(|e| PluginError::user(e.to_string()))?;
                serde_json::to_value(profile).map_err(|e| PluginError::system(e.to_string()))
            }
            GET_PROFILES => serde_json::to_value(self.profiles())
                .map_err(|e| PluginError::system(e.to_string())),
            IS_ACTIVE => {
                let name = name_arg(method, &payload)?;
                Ok(Value::Bool(self.active(&name)))
            }
            other => Err(PluginError::user(format!("unknown method: {other}"))),
        }
    }
}
