//! Test doubles for exercising the engine without real plugins
//!
//! [`MockPlugin`] is a scriptable [`Plugin`]: it records every request and
//! lifecycle call, keeps the context it was activated with, and can be told
//! to fail or stall its hooks.
//!
//! ```
//! use std::sync::Arc;
//! use plexus_engine::manager::ManagerPresets;
//! use plexus_engine::testing::MockPlugin;
//! use plexus_engine::Engine;
//! use serde_json::json;
//!
//! # tokio_test_runtime(async {
//! let engine = Engine::bootstrap(Arc::new(ManagerPresets::testing())).await.unwrap();
//! let calc = Arc::new(MockPlugin::new("calc").methods(["add"]).respond("add", json!(3)));
//! engine.register(calc.clone()).await.unwrap();
//! engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();
//!
//! let sum = engine.call_method("ui", "calc", "add", vec![json!(1), json!(2)]).await.unwrap();
//! assert_eq!(sum, json!(3));
//! assert_eq!(calc.activation_count(), 1);
//! # });
//! # fn tokio_test_runtime<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f);
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use plexus_api::{PluginError, Profile, Request, Value};

use crate::context::PluginContext;
use crate::plugin::Plugin;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ActivateFn = Arc<dyn Fn(PluginContext) -> BoxFuture<Result<(), PluginError>> + Send + Sync>;
type Handler = Arc<dyn Fn(&Request, &str, &[Value]) -> Result<Value, PluginError> + Send + Sync>;

/// A request received by a [`MockPlugin`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub from: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Scriptable plugin for tests
///
/// Without a handler or canned response a request echoes its arguments back
/// as a JSON array.
pub struct MockPlugin {
    profile: Profile,
    responses: HashMap<String, Value>,
    handler: Option<Handler>,
    on_activate: Option<ActivateFn>,
    activation_delay: Option<Duration>,
    failing_activations: AtomicUsize,
    failing_deactivations: AtomicUsize,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
    context: Mutex<Option<PluginContext>>,
}

impl MockPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_profile(Profile::new(name))
    }

    pub fn with_profile(profile: Profile) -> Self {
        Self {
            profile,
            responses: HashMap::new(),
            handler: None,
            on_activate: None,
            activation_delay: None,
            failing_activations: AtomicUsize::new(0),
            failing_deactivations: AtomicUsize::new(0),
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        }
    }

    /// Expose methods
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profile = self.profile.methods(methods);
        self
    }

    /// Canned response for `method`
    pub fn respond(mut self, method: impl Into<String>, value: Value) -> Self {
        self.responses.insert(method.into(), value);
        self
    }

    /// Compute responses with a closure (takes precedence over canned ones)
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request, &str, &[Value]) -> Result<Value, PluginError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Run `hook` at the end of every successful activation
    pub fn on_activate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.on_activate = Some(Arc::new(
            move |ctx| -> BoxFuture<Result<(), PluginError>> { Box::pin(hook(ctx)) },
        ));
        self
    }

    /// Sleep inside the activation hook
    pub fn activation_delay(mut self, delay: Duration) -> Self {
        self.activation_delay = Some(delay);
        self
    }

    /// Fail the next `n` activations
    pub fn failing_activations(self, n: usize) -> Self {
        self.failing_activations.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` deactivations
    pub fn failing_deactivations(self, n: usize) -> Self {
        self.failing_deactivations.store(n, Ordering::SeqCst);
        self
    }

    /// Number of times the activation hook ran
    pub fn activation_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivation_count(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Context from the most recent activation attempt
    pub fn context(&self) -> Option<PluginContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn profile(&self) -> Profile {
        self.profile.clone()
    }

    async fn activate(&self, ctx: PluginContext) -> Result<(), PluginError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx.clone());

        if let Some(delay) = self.activation_delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_activations) {
            return Err(PluginError::system(format!(
                "{}: scripted activation failure",
                self.profile.name
            )));
        }
        if let Some(hook) = &self.on_activate {
            hook(ctx).await?;
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), PluginError> {
        if Self::take_failure(&self.failing_deactivations) {
            return Err(PluginError::system(format!(
                "{}: scripted deactivation failure",
                self.profile.name
            )));
        }
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_request(
        &self,
        request: Request,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, PluginError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                from: request.from.clone(),
                method: method.to_string(),
                args: payload.clone(),
            });

        if let Some(handler) = &self.handler {
            return handler(&request, method, &payload);
        }
        Ok(self
            .responses
            .get(method)
            .cloned()
            .unwrap_or(Value::Array(payload)))
    }
}
