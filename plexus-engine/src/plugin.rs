//! Plugin contract

use async_trait::async_trait;
use plexus_api::{PluginError, Profile, Request, Value};

use crate::context::PluginContext;

/// A unit orchestrated by the engine
///
/// Plugins never reference each other directly. Everything they can do to
/// the rest of the system goes through the [`PluginContext`] handed to
/// [`Plugin::activate`]; the context stops working once the plugin is
/// deactivated.
///
/// # Example
///
/// ```rust,ignore
/// struct Clock {
///     ctx: std::sync::Mutex<Option<PluginContext>>,
/// }
///
/// #[async_trait]
/// impl Plugin for Clock {
///     fn profile(&self) -> Profile {
///         Profile::new("clock").method("now")
///     }
///
///     async fn activate(&self, ctx: PluginContext) -> Result<(), PluginError> {
///         *self.ctx.lock().unwrap() = Some(ctx);
///         Ok(())
///     }
///
///     async fn add_request(
///         &self,
///         _request: Request,
///         method: &str,
///         _payload: Vec<Value>,
///     ) -> Result<Value, PluginError> {
///         match method {
///             "now" => Ok(Value::from(42)),
///             other => Err(PluginError::user(format!("unknown method {other}"))),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Descriptor forwarded to the permission authority at registration
    fn profile(&self) -> Profile;

    /// Called once per activation, after capabilities are installed
    async fn activate(&self, ctx: PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Called before capabilities are withdrawn
    async fn deactivate(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Execute `method` on behalf of `request.from`
    async fn add_request(
        &self,
        request: Request,
        method: &str,
        payload: Vec<Value>,
    ) -> Result<Value, PluginError>;
}
