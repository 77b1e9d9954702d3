//! plexus-sdk: write plexus plugins from closures
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use plexus_sdk::prelude::*;
//! use plexus_engine::manager::ManagerPresets;
//! use plexus_engine::Engine;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let greeter = FnPlugin::new("greeter")
//!     .describe("Says hello")
//!     .method("greet", |request, args| async move {
//!         let name: String = arg(&args, 0)?;
//!         Ok::<_, PluginError>(Value::from(format!("Hello {name}, from {}", request.from)))
//!     });
//!
//! let engine = Engine::bootstrap(Arc::new(ManagerPresets::permissive())).await.unwrap();
//! engine.register(Arc::new(greeter)).await.unwrap();
//! engine.register(Arc::new(FnPlugin::new("ui"))).await.unwrap();
//!
//! let reply = engine
//!     .call_method("ui", "greeter", "greet", vec![Value::from("Ada")])
//!     .await
//!     .unwrap();
//! assert_eq!(reply, Value::from("Hello Ada, from ui"));
//! # });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

pub use plexus_api::*;
pub use plexus_engine::{Plugin, PluginContext};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{arg, FnPlugin};
    pub use plexus_api::{PluginError, Profile, Request, Value};
    pub use plexus_engine::{Plugin, PluginContext};
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type MethodFn = Arc<dyn Fn(Request, Vec<Value>) -> BoxFuture<Result<Value, PluginError>> + Send + Sync>;
type ActivateFn = Arc<dyn Fn(PluginContext) -> BoxFuture<Result<(), PluginError>> + Send + Sync>;
type DeactivateFn = Arc<dyn Fn() -> BoxFuture<Result<(), PluginError>> + Send + Sync>;

/// Deserialize argument `index` of a request
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, PluginError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| PluginError::user(format!("missing argument {index}")))?;
    serde_json::from_value(value)
        .map_err(|e| PluginError::user(format!("invalid argument {index}: {e}")))
}

/// A plugin assembled from closures
///
/// Every method added with [`FnPlugin::method`] is also added to the
/// plugin's profile. The context received on activation is kept and
/// available through [`FnPlugin::context`].
pub struct FnPlugin {
    profile: Profile,
    methods: HashMap<String, MethodFn>,
    on_activate: Option<ActivateFn>,
    on_deactivate: Option<DeactivateFn>,
    context: Mutex<Option<PluginContext>>,
}

impl FnPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            profile: Profile::new(name),
            methods: HashMap::new(),
            on_activate: None,
            on_deactivate: None,
            context: Mutex::new(None),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.profile = self.profile.description(description);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.profile = self.profile.version(version);
        self
    }

    /// Expose `name`, answered by `handler`
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PluginError>> + Send + 'static,
    {
        let name = name.into();
        self.profile = self.profile.method(name.clone());
        self.methods.insert(
            name,
            Arc::new(move |request, args| -> BoxFuture<Result<Value, PluginError>> {
                Box::pin(handler(request, args))
            }),
        );
        self
    }

    /// Run `hook` when the plugin is activated
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

    /// Run `hook` before the plugin is deactivated
    pub fn on_deactivate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginError>> + Send + 'static,
    {
        self.on_deactivate = Some(Arc::new(move || -> BoxFuture<Result<(), PluginError>> {
            Box::pin(hook())
        }));
        self
    }

    /// Context of the current activation, if any
    pub fn context(&self) -> Option<PluginContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Plugin for FnPlugin {
    fn profile(&self) -> Profile {
        self.profile.clone()
    }

    async fn activate(&self, ctx: PluginContext) -> Result<(), PluginError> {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx.clone());
        if let Some(hook) = &self.on_activate {
            hook(ctx).await?;
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), PluginError> {
        if let Some(hook) = &self.on_deactivate {
            hook().await?;
        }
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn add_request(
        &self,
        request: Request,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, PluginError> {
        let handler = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| PluginError::user(format!("unknown method: {method}")))?;
        handler(request, payload).await
    }
}
