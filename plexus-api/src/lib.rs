//! plexus-api: Shared types for the plexus plugin runtime
//!
//! This crate defines the vocabulary shared by the engine, plugin authors and
//! remote transports: profiles, requests, plugin errors and the message
//! envelope exchanged with out-of-process plugins.

use serde::{Deserialize, Serialize};
use std::fmt;

pub use serde_json::Value;

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Reserved name of the permission authority plugin
pub const MANAGER_NAME: &str = "manager";

/// Public descriptor of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique plugin name (immutable once registered)
    pub name: String,

    /// Methods exposed to other plugins, in declaration order
    #[serde(default)]
    pub methods: Vec<String>,

    /// Short description
    #[serde(default)]
    pub description: Option<String>,

    /// Plugin version (semver)
    #[serde(default)]
    pub version: Option<String>,
}

impl Profile {
    /// Create a profile exposing no methods
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            description: None,
            version: None,
        }
    }

    /// Expose a method. Duplicates are ignored so `methods` stays an ordered set.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        let method = method.into();
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    /// Expose several methods
    pub fn methods<I, S>(self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        methods.into_iter().fold(self, |profile, m| profile.method(m))
    }

    /// Add description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether `method` is part of this profile
    pub fn exposes(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Metadata attached to every dispatched call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Name of the calling plugin
    pub from: String,
}

impl Request {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            from: caller.into(),
        }
    }
}

/// Error reported by a plugin hook or request handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginError {
    /// Error code (1 = user error, 101 = system error)
    pub code: u8,

    /// Error message
    pub message: String,
}

impl PluginError {
    /// Create a user error (code 1)
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    /// Create a system error (code 101)
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            code: 101,
            message: message.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.code == 101
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for PluginError {}

/// Kind of message exchanged with a remote plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Host asks the remote plugin to run a method
    Request,
    /// Remote plugin answers a request
    Response,
    /// Remote plugin emits an event
    Notification,
    /// Remote plugin subscribes to another plugin's event
    Listen,
}

/// Envelope for host <-> remote plugin traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id; a response carries the id of its request
    pub id: u64,

    pub action: Action,

    /// Plugin the message is addressed to (request) or emitted by (notification)
    pub name: String,

    /// Method name for requests, event name for notifications
    pub key: String,

    #[serde(default)]
    pub payload: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_info: Option<Request>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PluginError>,
}

impl Message {
    /// Build a request for `name.key(payload)`
    pub fn request(
        id: u64,
        name: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<Value>,
        request_info: Request,
    ) -> Self {
        Self {
            id,
            action: Action::Request,
            name: name.into(),
            key: key.into(),
            payload,
            request_info: Some(request_info),
            error: None,
        }
    }

    /// Build the successful response to `request`
    pub fn response_to(request: &Message, result: Value) -> Self {
        Self {
            id: request.id,
            action: Action::Response,
            name: request.name.clone(),
            key: request.key.clone(),
            payload: vec![result],
            request_info: None,
            error: None,
        }
    }

    /// Build the failed response to `request`
    pub fn error_to(request: &Message, error: PluginError) -> Self {
        Self {
            id: request.id,
            action: Action::Response,
            name: request.name.clone(),
            key: request.key.clone(),
            payload: Vec::new(),
            request_info: None,
            error: Some(error),
        }
    }

    /// Build an event notification emitted by `name`
    pub fn notification(name: impl Into<String>, event: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            id: 0,
            action: Action::Notification,
            name: name.into(),
            key: event.into(),
            payload,
            request_info: None,
            error: None,
        }
    }
}
