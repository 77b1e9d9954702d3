//! Ready-made manager configurations

use std::path::Path;
use std::sync::Arc;

use plexus_api::MANAGER_NAME;

use super::grants::{Grants, GrantsError};
use super::policy::{DefaultPolicy, DenyAllPolicy, PermissionPolicy, StrictPolicy};
use super::PluginManager;
use crate::audit::{AuditSink, MemoryAuditSink, NullAuditSink};

/// Builder for [`PluginManager`]
///
/// Without a policy the manager allows everything, unless grants were given,
/// in which case a [`StrictPolicy`] over those grants is used. Without an
/// audit sink events are discarded.
#[derive(Default)]
pub struct PluginManagerBuilder {
    name: Option<String>,
    policy: Option<Arc<dyn PermissionPolicy>>,
    audit: Option<Arc<dyn AuditSink>>,
    grants: Option<Grants>,
}

impl PluginManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserved plugin name (defaults to `manager`)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn policy(mut self, policy: impl PermissionPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Enforce `grants` with a [`StrictPolicy`]
    pub fn grants(mut self, grants: Grants) -> Self {
        self.grants = Some(grants);
        self
    }

    pub fn build(self) -> PluginManager {
        let name = self.name.unwrap_or_else(|| MANAGER_NAME.to_string());
        let policy: Arc<dyn PermissionPolicy> = match (self.policy, self.grants) {
            (Some(policy), _) => policy,
            (None, Some(grants)) => Arc::new(StrictPolicy::new(grants).manager_name(name.clone())),
            (None, None) => Arc::new(DefaultPolicy),
        };
        let audit = self.audit.unwrap_or_else(|| Arc::new(NullAuditSink));
        PluginManager::new(name, policy, audit)
    }
}

/// Common manager setups
pub struct ManagerPresets;

impl ManagerPresets {
    /// Everything allowed, nothing audited
    pub fn permissive() -> PluginManager {
        PluginManagerBuilder::new().build()
    }

    /// Only what `grants` lists
    pub fn strict(grants: Grants) -> PluginManager {
        PluginManagerBuilder::new().grants(grants).build()
    }

    /// Nothing allowed except calls to the manager
    pub fn locked_down() -> PluginManager {
        PluginManagerBuilder::new().policy(DenyAllPolicy::new()).build()
    }

    /// Everything allowed, events kept in memory
    pub fn testing() -> PluginManager {
        PluginManagerBuilder::new()
            .audit(Arc::new(MemoryAuditSink::new()))
            .build()
    }

    /// Strict manager over the grant file at `path`
    pub fn from_grant_file(path: impl AsRef<Path>) -> Result<PluginManager, GrantsError> {
        let grants = Grants::load(path)?;
        tracing::info!(
            calls = grants.calls.len(),
            activations = grants.activations.len(),
            "Loaded grants"
        );
        Ok(Self::strict(grants))
    }
}
