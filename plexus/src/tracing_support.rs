//! Tracing and logging support.
//!
//! The engine logs through `tracing`; this module installs a subscriber for
//! applications embedding it.

#[cfg(feature = "tracing")]
pub use tracing::{self, debug, error, info, instrument, trace, warn};

#[cfg(feature = "tracing")]
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer, Registry,
};

/// Tracing output format.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable format with colors.
    Pretty,

    /// Compact single-line format.
    Compact,

    /// JSON lines, one object per event.
    Json,
}

/// Tracing configuration.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG or falls back to [`DEFAULT_FILTER`].
    pub level: Option<tracing::Level>,

    pub format: TracingFormat,

    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    pub thread_ids: bool,
}

/// Filter used when RUST_LOG is unset
#[cfg(feature = "tracing")]
pub const DEFAULT_FILTER: &str = "info";

#[cfg(feature = "tracing")]
impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Compact,
            timestamps: true,
            target: true,
            thread_ids: false,
        }
    }
}

#[cfg(feature = "tracing")]
impl TracingConfig {
    /// JSON output for log shippers
    pub fn json() -> Self {
        Self {
            format: TracingFormat::Json,
            ..Default::default()
        }
    }

    pub fn level(mut self, level: tracing::Level) -> Self {
        self.level = Some(level);
        self
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.as_str().to_ascii_lowercase()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(self.target)
            .with_thread_ids(self.thread_ids);

        match (self.format, self.timestamps) {
            (TracingFormat::Pretty, true) => layer.pretty().boxed(),
            (TracingFormat::Pretty, false) => layer.pretty().without_time().boxed(),
            (TracingFormat::Compact, true) => layer.compact().boxed(),
            (TracingFormat::Compact, false) => layer.compact().without_time().boxed(),
            (TracingFormat::Json, true) => layer.json().boxed(),
            (TracingFormat::Json, false) => layer.json().without_time().boxed(),
        }
    }
}

/// Install a global subscriber with default settings.
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Enable debug logs
/// - `RUST_LOG=plexus_engine=trace` - Trace activation and dispatch only
///
/// Fails if a global subscriber is already installed.
#[cfg(feature = "tracing")]
pub fn init_subscriber() -> Result<(), TryInitError> {
    init_subscriber_with_config(TracingConfig::default())
}

/// Install a global subscriber with custom configuration.
///
/// ```no_run
/// use plexus::{init_subscriber_with_config, tracing::Level, TracingConfig};
///
/// init_subscriber_with_config(TracingConfig::json().level(Level::DEBUG))
///     .expect("subscriber already installed");
/// ```
#[cfg(feature = "tracing")]
pub fn init_subscriber_with_config(config: TracingConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.layer())
        .with(config.filter())
        .try_init()
}

#[cfg(not(feature = "tracing"))]
pub fn init_subscriber() -> Result<(), std::convert::Infallible> {
    Ok(())
}
