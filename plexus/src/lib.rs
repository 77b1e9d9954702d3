//! # plexus: a micro-kernel plugin runtime
//!
//! Plugins register with an [`Engine`], are activated on first use and talk
//! to each other through permissioned method calls and events. A
//! [`PermissionAuthority`] (usually a [`PluginManager`]) decides who may call
//! and activate whom.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use plexus::prelude::*;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = Engine::bootstrap(Arc::new(ManagerPresets::permissive())).await.unwrap();
//!
//! let clock = FnPlugin::new("clock").method("now", |_, _| async { Ok(Value::from(42)) });
//! engine.register(Arc::new(clock)).await.unwrap();
//! engine.register(Arc::new(FnPlugin::new("ui"))).await.unwrap();
//!
//! let now = engine.call_method("ui", "clock", "now", vec![]).await.unwrap();
//! assert_eq!(now, Value::from(42));
//! # });
//! ```

pub mod tracing_support;

pub use plexus_api as api;
pub use plexus_engine::{audit, manager, testing, transport};

pub use plexus_engine::{
    AppSnapshot, AuthorityError, BoundMethod, Engine, EngineConfig, EngineError, EventCallback,
    Message, Operation, PermissionAuthority, Plugin, PluginApi, PluginContext, PluginError,
    Profile, Request, Value, ACTIVATED_EVENT, DEACTIVATED_EVENT, MANAGER_NAME,
};
pub use plexus_engine::manager::{ManagerPresets, PluginManager};
pub use plexus_sdk::{arg, FnPlugin};

#[cfg(feature = "tracing")]
pub use tracing_support::tracing;

#[cfg(feature = "tracing")]
pub use tracing_support::{
    debug, error, info, init_subscriber, init_subscriber_with_config, instrument, trace, warn,
    TracingConfig, TracingFormat,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::manager::{Grants, ManagerPresets, PluginManager};
    pub use crate::{arg, Engine, EngineError, FnPlugin, Plugin, PluginContext};
    pub use plexus_api::{PluginError, Profile, Request, Value};
}
