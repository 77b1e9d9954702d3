//! Audit trail for permission decisions
//!
//! The reference [`crate::manager::PluginManager`] reports every profile
//! change, permission decision and liveness flip to an [`AuditSink`]. Sinks
//! are synchronous and cheap; a failing sink never changes a decision.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// RFC 3339 timestamp (UTC)
    pub timestamp: String,
    pub event_type: AuditEventType,
    /// Plugin the event is about (the caller for permission checks)
    pub plugin: String,
    /// Other side of a permission check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub details: AuditDetails,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, plugin: impl Into<String>, details: AuditDetails) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event_type,
            plugin: plugin.into(),
            target: None,
            details,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn profile_added(plugin: &str, methods: &[String]) -> Self {
        Self::new(
            AuditEventType::ProfileAdded,
            plugin,
            AuditDetails::Profile {
                methods: methods.to_vec(),
            },
        )
    }

    pub fn call(from: &str, to: &str, method: &str, denied: Option<String>) -> Self {
        let event_type = if denied.is_some() {
            AuditEventType::CallDenied
        } else {
            AuditEventType::CallAllowed
        };
        Self::new(
            event_type,
            from,
            AuditDetails::Call {
                method: method.to_string(),
                reason: denied,
            },
        )
        .with_target(to)
    }

    pub fn activation(from: &str, to: &str, denied: Option<String>) -> Self {
        let event_type = if denied.is_some() {
            AuditEventType::ActivationDenied
        } else {
            AuditEventType::ActivationAllowed
        };
        Self::new(event_type, from, AuditDetails::Activation { reason: denied }).with_target(to)
    }

    pub fn toggled(plugin: &str, active: bool) -> Self {
        Self::new(
            AuditEventType::ActiveToggled,
            plugin,
            AuditDetails::Lifecycle { active },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ProfileAdded,
    CallAllowed,
    CallDenied,
    ActivationAllowed,
    ActivationDenied,
    ActiveToggled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    Call {
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Activation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Lifecycle {
        active: bool,
    },
    Profile {
        methods: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to write audit log: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to serialize audit event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit sink not available: {0}")]
    Unavailable(String),
}

/// Destination for audit events
///
/// ```rust
/// use plexus_engine::audit::{AuditError, AuditEvent, AuditSink};
///
/// struct StderrSink;
///
/// impl AuditSink for StderrSink {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("{:?} {}", event.event_type, event.plugin);
///         Ok(())
///     }
///
///     fn flush(&self) -> Result<(), AuditError> {
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    fn flush(&self) -> Result<(), AuditError>;

    fn is_healthy(&self) -> bool {
        true
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// JSON Lines file sink
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    /// Open `path` for appending, creating parent directories as needed
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.path.parent().map(Path::exists).unwrap_or(true)
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish()
    }
}

/// Bounded in-memory sink; the oldest events are evicted first
pub struct MemoryAuditSink {
    events: RwLock<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY))),
            capacity,
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.read().iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn find_by_plugin(&self, plugin: &str) -> Vec<AuditEvent> {
        self.read()
            .iter()
            .filter(|e| e.plugin == plugin)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<AuditEvent>> {
        self.events.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Fans events out to several sinks
///
/// Every sink sees the event even if an earlier one fails; the first error
/// is returned.
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for CompositeAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event.clone()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn is_healthy(&self) -> bool {
        self.sinks.iter().all(|sink| sink.is_healthy())
    }
}

impl fmt::Debug for CompositeAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeAuditSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
