//! Capabilities handed to active plugins
//!
//! Each registered plugin owns one [`CapabilitySlot`]. Activation installs
//! it, deactivation withdraws it, and every [`PluginContext`] or snapshot
//! entry bound to that plugin checks the slot before doing anything. A
//! withdrawn slot turns every capability into an
//! [`EngineError::Deactivated`] naming the blocked operation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use plexus_api::Value;

use crate::engine::{Engine, Shared};
use crate::error::{EngineError, Operation};
use crate::snapshot::AppSnapshot;

#[derive(Default)]
struct SlotState {
    installed: bool,
    app: Option<Arc<AppSnapshot>>,
}

/// Install/withdraw switch shared by everything bound to one plugin
#[derive(Default)]
pub(crate) struct CapabilitySlot {
    state: Mutex<SlotState>,
}

impl CapabilitySlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn install(&self, app: Arc<AppSnapshot>) {
        let mut state = self.lock();
        state.installed = true;
        state.app = Some(app);
    }

    pub(crate) fn withdraw(&self) {
        let mut state = self.lock();
        state.installed = false;
        state.app = None;
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.lock().installed
    }

    pub(crate) fn app(&self) -> Option<Arc<AppSnapshot>> {
        self.lock().app.clone()
    }

    /// Replace the cached snapshot; ignored once withdrawn
    pub(crate) fn replace_app(&self, app: Arc<AppSnapshot>) -> bool {
        let mut state = self.lock();
        if state.installed {
            state.app = Some(app);
        }
        state.installed
    }
}

/// A plugin name bound to its slot and to the engine
#[derive(Clone)]
pub(crate) struct Binding {
    name: String,
    engine: Weak<Shared>,
    slot: Arc<CapabilitySlot>,
}

impl Binding {
    pub(crate) fn new(name: &str, engine: Weak<Shared>, slot: Arc<CapabilitySlot>) -> Self {
        Self {
            name: name.to_string(),
            engine,
            slot,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_live(&self) -> bool {
        self.slot.is_installed() && self.engine.strong_count() > 0
    }

    /// Engine handle, provided the bound plugin is still active
    pub(crate) fn engine(&self, operation: Operation) -> Result<Engine, EngineError> {
        if !self.slot.is_installed() {
            return Err(EngineError::deactivated(&self.name, operation));
        }
        self.engine
            .upgrade()
            .map(Engine::from_shared)
            .ok_or_else(|| EngineError::deactivated(&self.name, operation))
    }
}

/// Capability bundle passed to [`crate::Plugin::activate`]
///
/// Cheap to clone; plugins usually keep one around for the lifetime of the
/// activation.
#[derive(Clone)]
pub struct PluginContext {
    binding: Binding,
}

impl PluginContext {
    pub(crate) fn new(binding: Binding) -> Self {
        Self { binding }
    }

    /// Name of the plugin this context belongs to
    pub fn name(&self) -> &str {
        self.binding.name()
    }

    /// Whether capabilities are currently installed
    pub fn is_live(&self) -> bool {
        self.binding.is_live()
    }

    /// Call `target.method(args)` as this plugin
    pub async fn call(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        let engine = self.binding.engine(Operation::Call)?;
        engine
            .call_method(self.binding.name(), target, method, args)
            .await
    }

    /// Subscribe to `event` emitted by `emitter`
    ///
    /// Returns `false` when a callback was already registered for the same
    /// emitter and event; the existing one is kept.
    pub fn on<F>(&self, emitter: &str, event: &str, callback: F) -> Result<bool, EngineError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let engine = self.binding.engine(Operation::On)?;
        Ok(engine.add_listener(self.binding.name(), emitter, event, callback))
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, emitter: &str, event: &str, callback: F) -> Result<bool, EngineError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let engine = self.binding.engine(Operation::Once)?;
        Ok(engine.listen_once(self.binding.name(), emitter, event, callback))
    }

    /// Unsubscribe from `event` emitted by `emitter`
    pub fn off(&self, emitter: &str, event: &str) -> Result<bool, EngineError> {
        let engine = self.binding.engine(Operation::Off)?;
        Ok(engine.remove_listener(self.binding.name(), emitter, event))
    }

    /// Broadcast `event` from this plugin; returns how many listeners ran
    pub fn emit(&self, event: &str, payload: Vec<Value>) -> Result<usize, EngineError> {
        let engine = self.binding.engine(Operation::Emit)?;
        engine.broadcast(self.binding.name(), event, payload)
    }

    /// Snapshot captured when this plugin was activated
    pub fn app(&self) -> Result<Arc<AppSnapshot>, EngineError> {
        self.binding.engine(Operation::App)?;
        self.binding
            .slot
            .app()
            .ok_or_else(|| EngineError::deactivated(self.binding.name(), Operation::App))
    }

    /// Rebuild the snapshot from the current registry and cache it
    pub async fn refresh_app(&self) -> Result<Arc<AppSnapshot>, EngineError> {
        let engine = self.binding.engine(Operation::App)?;
        let app = engine.build_app(self.binding.name()).await?;
        if !self.binding.slot.replace_app(Arc::clone(&app)) {
            return Err(EngineError::deactivated(
                self.binding.name(),
                Operation::App,
            ));
        }
        Ok(app)
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.binding.name)
            .field("live", &self.is_live())
            .finish()
    }
}
