//! Grant documents for [`super::StrictPolicy`]
//!
//! Grants are plain JSON so they can be reviewed and versioned next to the
//! application:
//!
//! ```json
//! {
//!   "version": 1,
//!   "calls": [
//!     { "from": "ui", "to": "calc", "methods": ["add"] },
//!     { "from": "ui", "to": "clock" }
//!   ],
//!   "activations": [{ "from": "*", "to": "clock" }]
//! }
//! ```
//!
//! `"*"` matches any plugin name. A call grant without `methods` covers every
//! method of the target.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current grant document version
pub const GRANTS_VERSION: u32 = 1;

const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum GrantsError {
    #[error("failed to access grant file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse grant file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported grant file version {found} (expected {GRANTS_VERSION})")]
    UnsupportedVersion { found: u32 },
}

fn matches(pattern: &str, name: &str) -> bool {
    pattern == WILDCARD || pattern == name
}

fn default_version() -> u32 {
    GRANTS_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGrant {
    pub from: String,
    pub to: String,
    /// `None` grants every method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

impl CallGrant {
    fn permits(&self, from: &str, to: &str, method: &str) -> bool {
        matches(&self.from, from)
            && matches(&self.to, to)
            && match &self.methods {
                None => true,
                Some(methods) => methods.iter().any(|m| matches(m, method)),
            }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationGrant {
    pub from: String,
    pub to: String,
}

/// Set of call and activation grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub calls: Vec<CallGrant>,
    #[serde(default)]
    pub activations: Vec<ActivationGrant>,
}

impl Default for Grants {
    fn default() -> Self {
        Self {
            version: GRANTS_VERSION,
            calls: Vec::new(),
            activations: Vec::new(),
        }
    }
}

impl Grants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `from` to call every method of `to`
    pub fn allow_call(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.calls.push(CallGrant {
            from: from.into(),
            to: to.into(),
            methods: None,
        });
        self
    }

    /// Allow `from` to call the listed methods of `to`
    pub fn allow_methods<I, S>(mut self, from: impl Into<String>, to: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calls.push(CallGrant {
            from: from.into(),
            to: to.into(),
            methods: Some(methods.into_iter().map(Into::into).collect()),
        });
        self
    }

    /// Allow `from` to cause `to` to be activated
    pub fn allow_activation(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.activations.push(ActivationGrant {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn permits_call(&self, from: &str, to: &str, method: &str) -> bool {
        self.calls.iter().any(|grant| grant.permits(from, to, method))
    }

    pub fn permits_activation(&self, from: &str, to: &str) -> bool {
        self.activations
            .iter()
            .any(|grant| matches(&grant.from, from) && matches(&grant.to, to))
    }

    pub fn from_json(json: &str) -> Result<Self, GrantsError> {
        let grants: Self = serde_json::from_str(json)?;
        grants.check_version()
    }

    pub fn to_json(&self) -> Result<String, GrantsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load grants from `path`; a missing file yields an empty set
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GrantsError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Grant file not found, using empty grants");
            return Ok(Self::default());
        }
        let reader = BufReader::new(File::open(path)?);
        let grants: Self = serde_json::from_reader(reader)?;
        grants.check_version()
    }

    /// Write grants to `path`, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GrantsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// `<config dir>/<app>/grants.json`
    pub fn default_path(app: &str) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(app)
            .join("grants.json")
    }

    fn check_version(self) -> Result<Self, GrantsError> {
        if self.version != GRANTS_VERSION {
            return Err(GrantsError::UnsupportedVersion {
                found: self.version,
            });
        }
        Ok(self)
    }
}
