//! Per-caller view of the registry
//!
//! An [`AppSnapshot`] is built for one caller when it is activated and lists
//! every registered plugin (the caller included) with the profile it had at
//! that moment. The profiles are only used to discover methods; every call
//! made through the snapshot goes through [`crate::Engine::call_method`] and
//! is checked against the authority's current state.

use std::fmt;

use plexus_api::{Profile, Value};

use crate::context::Binding;
use crate::error::{EngineError, Operation};

/// Every registered plugin as seen by one caller
#[derive(Debug)]
pub struct AppSnapshot {
    caller: String,
    plugins: Vec<PluginApi>,
}

impl AppSnapshot {
    pub(crate) fn new(caller: &str, plugins: Vec<PluginApi>) -> Self {
        Self {
            caller: caller.to_string(),
            plugins,
        }
    }

    /// Plugin the snapshot was built for
    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn get(&self, name: &str) -> Option<&PluginApi> {
        self.plugins.iter().find(|api| api.name() == name)
    }

    /// Plugin names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(PluginApi::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginApi> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// One target plugin, bound to the snapshot's caller
#[derive(Clone)]
pub struct PluginApi {
    caller: Binding,
    profile: Profile,
}

impl PluginApi {
    pub(crate) fn new(caller: Binding, profile: Profile) -> Self {
        Self { caller, profile }
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Profile captured when the snapshot was built
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn methods(&self) -> &[String] {
        &self.profile.methods
    }

    /// Bound method, if the captured profile exposes `method`
    pub fn method(&self, method: &str) -> Option<BoundMethod> {
        self.profile.exposes(method).then(|| BoundMethod {
            api: self.clone(),
            method: method.to_string(),
        })
    }

    /// Call `method` on this plugin as the snapshot's caller
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        let engine = self.caller.engine(Operation::Call)?;
        engine
            .call_method(self.caller.name(), self.name(), method, args)
            .await
    }

    /// Subscribe the caller to `event` emitted by this plugin
    pub fn on<F>(&self, event: &str, callback: F) -> Result<bool, EngineError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let engine = self.caller.engine(Operation::On)?;
        Ok(engine.add_listener(self.caller.name(), self.name(), event, callback))
    }

    pub fn once<F>(&self, event: &str, callback: F) -> Result<bool, EngineError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let engine = self.caller.engine(Operation::Once)?;
        Ok(engine.listen_once(self.caller.name(), self.name(), event, callback))
    }

    pub fn off(&self, event: &str) -> Result<bool, EngineError> {
        let engine = self.caller.engine(Operation::Off)?;
        Ok(engine.remove_listener(self.caller.name(), self.name(), event))
    }
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi")
            .field("caller", &self.caller.name())
            .field("profile", &self.profile)
            .finish()
    }
}

/// A method of a [`PluginApi`], ready to call
#[derive(Debug, Clone)]
pub struct BoundMethod {
    api: PluginApi,
    method: String,
}

impl BoundMethod {
    pub fn name(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        self.api.name()
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, EngineError> {
        self.api.call(&self.method, args).await
    }
}
