//! Logging: the injected request logger and subscriber initialisation.
//!
//! Library code never installs a global subscriber. Components that report
//! per-request activity take an `Arc<dyn RequestLogger>` in their
//! constructor; the default implementation emits `tracing` events tagged with
//! the component name. Binaries call [`init`] once at startup.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

/// How a component reports requests and failures.
pub trait RequestLogger: Send + Sync {
    /// A command was received or sent.
    fn request(&self, command: &str, correlation_id: Option<&str>);

    /// A recoverable failure, with the component-level context it occurred in.
    fn error(&self, context: &str, error: &dyn fmt::Display);

    /// A lifecycle event ("awaiting RPC requests", "stopped", ...).
    fn event(&self, message: &str);
}

/// [`RequestLogger`] backed by `tracing` events.
#[derive(Debug, Clone)]
pub struct TracingRequestLogger {
    component: String,
}

impl TracingRequestLogger {
    /// A logger tagging records with `component`.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Shared handle, ready to pass to a constructor.
    #[must_use]
    pub fn shared(component: impl Into<String>) -> Arc<dyn RequestLogger> {
        Arc::new(Self::new(component))
    }
}

impl RequestLogger for TracingRequestLogger {
    fn request(&self, command: &str, correlation_id: Option<&str>) {
        debug!(
            component = %self.component,
            correlation_id = correlation_id.unwrap_or_default(),
            "{command}()"
        );
    }

    fn error(&self, context: &str, error: &dyn fmt::Display) {
        error!(component = %self.component, context, "{error}");
    }

    fn event(&self, message: &str) {
        info!(component = %self.component, "{message}");
    }
}

// ---------------------------------------------------------------------------
// Subscriber initialisation
// ---------------------------------------------------------------------------

/// Output settings for the process-wide subscriber.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub default_level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            json: false,
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}


#[cfg(test)]
pub(crate) use tests::RecordingLogger;
