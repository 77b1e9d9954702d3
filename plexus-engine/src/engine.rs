//! Plugin orchestration engine
//!
//! The engine owns the plugin registry and the event tables and holds a
//! handle to the permission authority. It never caches profiles or liveness:
//! every decision re-queries the authority.
//!
//! # Activation
//!
//! ```text
//! activate_plugin(name)
//!   ├─ cycle / depth check against the task-local activation chain
//!   ├─ wait-for check against activations in flight on other tasks
//!   ├─ per-name lifecycle guard (concurrent activations collapse here)
//!   ├─ authority.is_active(name)?  → no-op
//!   ├─ allocate callback table, build snapshot, install capabilities
//!   ├─ plugin.activate(ctx)        (inside the extended chain)
//!   ├─ authority.toggle_active(name)
//!   └─ broadcast <authority>/activated [name]
//! ```
//!
//! Any failure before `toggle_active` succeeds rolls the installation back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plexus_api::{Profile, Request, Value};

use crate::authority::PermissionAuthority;
use crate::config::EngineConfig;
use crate::context::{Binding, CapabilitySlot, PluginContext};
use crate::error::EngineError;
use crate::events::{EventCallback, EventRegistry};
use crate::plugin::Plugin;
use crate::snapshot::{AppSnapshot, PluginApi};

/// Lifecycle event broadcast after a plugin was activated
pub const ACTIVATED_EVENT: &str = "activated";

/// Lifecycle event broadcast after a plugin was deactivated
pub const DEACTIVATED_EVENT: &str = "deactivated";

tokio::task_local! {
    static ACTIVATION_CHAIN: Vec<String>;
}

type RegistrationHook = Arc<dyn Fn(&Profile) + Send + Sync>;
type LifecycleHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default, Clone)]
struct Hooks {
    on_registration: Option<RegistrationHook>,
    on_activated: Option<LifecycleHook>,
    on_deactivated: Option<LifecycleHook>,
}

#[derive(Clone)]
struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    slot: Arc<CapabilitySlot>,
    /// Serializes activate/deactivate of this plugin
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct EngineState {
    plugins: HashMap<String, PluginEntry>,
    /// Registration order
    order: Vec<String>,
    events: EventRegistry,
    /// Plugin whose lifecycle guard is held by an activation -> the
    /// activation chain of the holding task, ending with that plugin
    holders: HashMap<String, Vec<String>>,
    /// Innermost plugin of a task's activation chain -> plugin whose
    /// lifecycle guard that task is waiting for
    waits: HashMap<String, String>,
}

impl EngineState {
    /// Follow wait-for edges from `wanted` back to a guard held by `held`
    ///
    /// Returns the closed path when the task holding `held` would wait on
    /// itself through other tasks' activations.
    fn wait_cycle(&self, held: &[String], wanted: &str) -> Option<Vec<String>> {
        let mut path = held.to_vec();
        path.push(wanted.to_string());

        let mut target = wanted;
        for _ in 0..=self.holders.len() {
            let innermost = self.holders.get(target)?.last()?;
            let next = self.waits.get(innermost)?;
            path.push(next.clone());
            if held.contains(next) {
                return Some(path);
            }
            target = next.as_str();
        }
        None
    }
}

#[derive(Clone, Copy)]
enum Tracked {
    Holder,
    Wait,
}

/// Drops an activation bookkeeping entry when the activation ends
struct InFlight<'a> {
    engine: &'a Engine,
    table: Tracked,
    name: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.state();
        match self.table {
            Tracked::Holder => {
                state.holders.remove(&self.name);
            }
            Tracked::Wait => {
                state.waits.remove(&self.name);
            }
        }
    }
}

pub(crate) struct Shared {
    config: EngineConfig,
    authority: Arc<dyn PermissionAuthority>,
    state: Mutex<EngineState>,
    hooks: Mutex<Hooks>,
}

/// Plugin runtime handle
///
/// Cloning is cheap and every clone drives the same registry.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Create an engine backed by `authority`
    ///
    /// The authority is not registered as a plugin; use [`Engine::bootstrap`]
    /// when it should also be reachable through `call_method`.
    pub fn new(authority: Arc<dyn PermissionAuthority>) -> Self {
        Self::with_config(authority, EngineConfig::default())
    }

    pub fn with_config(authority: Arc<dyn PermissionAuthority>, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                authority,
                state: Mutex::new(EngineState::default()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Create an engine whose authority is also its first plugin
    ///
    /// The manager is registered and activated before anything else.
    pub async fn bootstrap<M>(manager: Arc<M>) -> Result<Self, EngineError>
    where
        M: PermissionAuthority + Plugin + 'static,
    {
        Self::bootstrap_with_config(manager, EngineConfig::default()).await
    }

    pub async fn bootstrap_with_config<M>(
        manager: Arc<M>,
        config: EngineConfig,
    ) -> Result<Self, EngineError>
    where
        M: PermissionAuthority + Plugin + 'static,
    {
        let authority: Arc<dyn PermissionAuthority> = manager.clone();
        let engine = Self::with_config(authority, config);
        let name = manager.profile().name;
        engine.register(manager).await?;
        engine.activate_plugin(&name).await?;
        Ok(engine)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn authority(&self) -> Arc<dyn PermissionAuthority> {
        Arc::clone(&self.shared.authority)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> Hooks {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn entry(&self, name: &str) -> Result<PluginEntry, EngineError> {
        self.state()
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotRegistered(name.to_string()))
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Observe every successful registration
    pub fn on_registration<F>(&self, hook: F)
    where
        F: Fn(&Profile) + Send + Sync + 'static,
    {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_registration = Some(Arc::new(hook));
    }

    /// Observe every completed activation
    pub fn on_activated<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_activated = Some(Arc::new(hook));
    }

    /// Observe every completed deactivation
    pub fn on_deactivated<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_deactivated = Some(Arc::new(hook));
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register a plugin without activating it
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        let profile = plugin.profile();
        let name = profile.name.clone();

        {
            let mut state = self.state();
            if state.plugins.contains_key(&name) {
                return Err(EngineError::AlreadyRegistered(name));
            }
            state.plugins.insert(
                name.clone(),
                PluginEntry {
                    plugin,
                    slot: Arc::new(CapabilitySlot::default()),
                    lifecycle: Arc::new(tokio::sync::Mutex::new(())),
                },
            );
            state.order.push(name.clone());
        }

        if let Err(e) = self.shared.authority.add_profile(profile.clone()).await {
            let mut state = self.state();
            state.plugins.remove(&name);
            state.order.retain(|n| n != &name);
            return Err(e.into());
        }

        tracing::info!(plugin = %name, methods = ?profile.methods, "Plugin registered");
        if let Some(hook) = self.hooks().on_registration {
            hook(&profile);
        }
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state().plugins.contains_key(name)
    }

    /// Registered plugin names, in registration order
    pub fn plugin_names(&self) -> Vec<String> {
        self.state().order.clone()
    }

    /// Liveness as reported by the authority
    pub async fn is_active(&self, name: &str) -> Result<bool, EngineError> {
        if !self.is_registered(name) {
            return Err(EngineError::NotRegistered(name.to_string()));
        }
        Ok(self.shared.authority.is_active(name).await?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Activate `name`; a no-op when it is already active
    pub async fn activate_plugin(&self, name: &str) -> Result<(), EngineError> {
        let entry = self.entry(name)?;

        let chain = ACTIVATION_CHAIN
            .try_with(|chain| chain.clone())
            .unwrap_or_default();
        if chain.iter().any(|n| n == name) {
            let mut chain = chain;
            chain.push(name.to_string());
            tracing::warn!(chain = ?chain, "Activation cycle detected");
            return Err(EngineError::ActivationCycle { chain });
        }
        let limit = self.shared.config.max_activation_depth.max(1);
        if chain.len() >= limit {
            let mut chain = chain;
            chain.push(name.to_string());
            return Err(EngineError::ActivationDepthExceeded { limit, chain });
        }

        let waiting = match chain.last() {
            Some(innermost) => {
                let mut state = self.state();
                if let Some(cycle) = state.wait_cycle(&chain, name) {
                    tracing::warn!(chain = ?cycle, "Activation cycle across tasks detected");
                    return Err(EngineError::ActivationCycle { chain: cycle });
                }
                state.waits.insert(innermost.clone(), name.to_string());
                Some(InFlight {
                    engine: self,
                    table: Tracked::Wait,
                    name: innermost.clone(),
                })
            }
            None => None,
        };
        let _guard = entry.lifecycle.lock().await;
        drop(waiting);

        let mut held = chain.clone();
        held.push(name.to_string());
        self.state().holders.insert(name.to_string(), held);
        let _holder = InFlight {
            engine: self,
            table: Tracked::Holder,
            name: name.to_string(),
        };

        if self.shared.authority.is_active(name).await? {
            return Ok(());
        }

        tracing::debug!(plugin = %name, depth = chain.len(), "Activating plugin");
        if let Err(e) = self.install(name, &entry, chain).await {
            entry.slot.withdraw();
            self.state().events.release(name);
            tracing::warn!(plugin = %name, error = %e, "Activation failed, rolled back");
            return Err(e);
        }

        tracing::info!(plugin = %name, "Plugin activated");
        if let Some(hook) = self.hooks().on_activated {
            hook(name);
        }
        self.announce(name, ACTIVATED_EVENT);
        Ok(())
    }

    /// Broadcast a lifecycle event under the authority's name
    ///
    /// The transition has already happened, so a corrupted event table is
    /// logged by `broadcast` and not reported to the caller.
    fn announce(&self, name: &str, event: &str) {
        let emitter = self.shared.authority.authority_name();
        if self
            .broadcast(emitter, event, vec![Value::from(name)])
            .is_err()
        {
            tracing::warn!(plugin = %name, event = %event, "Lifecycle event not delivered");
        }
    }

    async fn install(
        &self,
        name: &str,
        entry: &PluginEntry,
        chain: Vec<String>,
    ) -> Result<(), EngineError> {
        self.state().events.allocate(name);

        let app = self.build_app(name).await?;
        entry.slot.install(app);

        let ctx = PluginContext::new(self.binding(name, &entry.slot));
        let mut next = chain;
        next.push(name.to_string());
        ACTIVATION_CHAIN
            .scope(next, entry.plugin.activate(ctx))
            .await?;

        self.shared.authority.toggle_active(name).await?;
        Ok(())
    }

    /// Deactivate `name`; a no-op when it is inactive
    ///
    /// A failing `deactivate` hook or liveness toggle leaves the plugin
    /// active with its capabilities and subscriptions intact.
    pub async fn deactivate_plugin(&self, name: &str) -> Result<(), EngineError> {
        let entry = self.entry(name)?;

        let _guard = entry.lifecycle.lock().await;
        if !self.shared.authority.is_active(name).await? {
            return Ok(());
        }

        entry.plugin.deactivate().await?;
        self.shared.authority.toggle_active(name).await?;

        entry.slot.withdraw();
        self.state().events.release(name);

        tracing::info!(plugin = %name, "Plugin deactivated");
        if let Some(hook) = self.hooks().on_deactivated {
            hook(name);
        }
        self.announce(name, DEACTIVATED_EVENT);
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run `target.method(args)` on behalf of `caller`
    ///
    /// An inactive target is activated first when the authority allows
    /// `caller` to do so.
    pub async fn call_method(
        &self,
        caller: &str,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        let entry = self.entry(target)?;
        let authority = &self.shared.authority;

        let (from, to) =
            tokio::try_join!(authority.get_profile(caller), authority.get_profile(target))?;

        if !authority.can_call(&from, &to, method).await? {
            tracing::warn!(caller = %caller, target = %target, method = %method, "Call denied");
            return Err(EngineError::PermissionDenied {
                caller: caller.to_string(),
                target: target.to_string(),
                method: method.to_string(),
            });
        }

        if !authority.is_active(target).await? {
            if !authority.can_activate(&from, &to).await? {
                tracing::warn!(caller = %caller, target = %target, "Activation denied");
                return Err(EngineError::NotActivatable {
                    caller: caller.to_string(),
                    target: target.to_string(),
                });
            }
            tracing::debug!(caller = %caller, target = %target, "Cascading activation");
            self.activate_plugin(target).await?;
        }

        if !to.exposes(method) {
            return Err(EngineError::MethodNotExposed {
                target: target.to_string(),
                method: method.to_string(),
                exposed: to.methods,
            });
        }

        tracing::debug!(caller = %caller, target = %target, method = %method, "Dispatching request");
        let result = entry
            .plugin
            .add_request(Request::new(caller), method, args)
            .await?;
        Ok(result)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Subscribe `listener` to `event` emitted by `emitter`
    ///
    /// Returns `false` if the triple already had a callback, which is kept.
    pub fn add_listener<F>(&self, listener: &str, emitter: &str, event: &str, callback: F) -> bool
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let added = self
            .state()
            .events
            .add_listener(listener, emitter, event, callback);
        tracing::debug!(listener = %listener, emitter = %emitter, event = %event, added, "Listener added");
        added
    }

    pub fn remove_listener(&self, listener: &str, emitter: &str, event: &str) -> bool {
        self.state()
            .events
            .remove_listener(listener, emitter, event)
    }

    /// Subscribe for exactly one delivery
    pub fn listen_once<F>(&self, listener: &str, emitter: &str, event: &str, callback: F) -> bool
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let fired = AtomicBool::new(false);
        let engine = Arc::downgrade(&self.shared);
        let (owner, source, name) = (listener.to_string(), emitter.to_string(), event.to_string());

        self.add_listener(listener, emitter, event, move |payload: &[Value]| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(shared) = engine.upgrade() {
                Engine::from_shared(shared).remove_listener(&owner, &source, &name);
            }
            callback(payload);
        })
    }

    /// Invoke every subscriber of `emitter/event` in subscription order
    ///
    /// Callbacks run after the engine lock is released, so they may
    /// subscribe, unsubscribe or broadcast themselves.
    pub fn broadcast(
        &self,
        emitter: &str,
        event: &str,
        payload: Vec<Value>,
    ) -> Result<usize, EngineError> {
        let targets = self.state().events.dispatch_list(emitter, event);
        let targets = match targets {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!(emitter = %emitter, event = %event, error = %e, "Event registry corrupted");
                return Err(e);
            }
        };

        for (listener, callback) in &targets {
            tracing::trace!(listener = %listener, emitter = %emitter, event = %event, "Delivering event");
            callback(&payload);
        }
        Ok(targets.len())
    }

    /// Listeners of `emitter/event`, in subscription order
    pub fn listeners(&self, emitter: &str, event: &str) -> Vec<String> {
        self.state().events.listeners(emitter, event)
    }

    /// Check the listener/callback invariant of the event tables
    pub fn verify_events(&self) -> Result<(), EngineError> {
        self.state().events.verify()
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    fn binding(&self, name: &str, slot: &Arc<CapabilitySlot>) -> Binding {
        Binding::new(name, Arc::downgrade(&self.shared), Arc::clone(slot))
    }

    /// Build a fresh view of every registered plugin for `caller`
    pub async fn build_app(&self, caller: &str) -> Result<Arc<AppSnapshot>, EngineError> {
        let slot = self.entry(caller)?.slot;
        let names = self.plugin_names();

        let mut plugins = Vec::with_capacity(names.len());
        for name in names {
            let profile = self.shared.authority.get_profile(&name).await?;
            plugins.push(PluginApi::new(self.binding(caller, &slot), profile));
        }
        Ok(Arc::new(AppSnapshot::new(caller, plugins)))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Engine")
            .field("authority", &self.shared.authority.authority_name())
            .field("plugins", &state.order)
            .field("events", &state.events)
            .finish()
    }
}
