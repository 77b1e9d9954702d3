//! plexus-engine: plugin registry, lifecycle and event fabric
//!
//! The [`Engine`] registers plugins, activates them lazily, routes method
//! calls between them after asking a [`PermissionAuthority`], and fans out
//! events. Plugins only ever see the world through the [`PluginContext`]
//! they receive on activation.
//!
//! ```rust
//! use std::sync::Arc;
//! use plexus_engine::manager::ManagerPresets;
//! use plexus_engine::testing::MockPlugin;
//! use plexus_engine::Engine;
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = Engine::bootstrap(Arc::new(ManagerPresets::permissive())).await.unwrap();
//! engine.register(Arc::new(MockPlugin::new("echo").methods(["say"]))).await.unwrap();
//! engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();
//!
//! let reply = engine.call_method("ui", "echo", "say", vec![json!("hi")]).await.unwrap();
//! assert_eq!(reply, json!(["hi"]));
//! # });
//! ```

pub mod audit;
mod authority;
mod config;
mod context;
mod engine;
mod error;
mod events;
pub mod manager;
mod plugin;
mod snapshot;
pub mod testing;
pub mod transport;

pub use authority::PermissionAuthority;
pub use config::{EngineConfig, DEFAULT_MAX_ACTIVATION_DEPTH};
pub use context::PluginContext;
pub use engine::{Engine, ACTIVATED_EVENT, DEACTIVATED_EVENT};
pub use error::{AuthorityError, EngineError, Operation};
pub use events::{EventCallback, EventRegistry};
pub use plugin::Plugin;
pub use snapshot::{AppSnapshot, BoundMethod, PluginApi};

pub use plexus_api::{Message, PluginError, Profile, Request, Value, MANAGER_NAME};
