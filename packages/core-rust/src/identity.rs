//! Static service identity reported by the `info` command.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default `strftime` format for [`build_time`].
pub const DEFAULT_BUILD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Descriptive data about a running service. Not mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub subsystem: String,
    pub name: String,
    pub description: String,
    pub build_timestamp: String,
}

impl ServiceInfo {
    /// Creates an identity stamped with the executable's build time.
    #[must_use]
    pub fn new(
        subsystem: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            subsystem: subsystem.into(),
            name: name.into(),
            description: description.into(),
            build_timestamp: build_time(DEFAULT_BUILD_TIME_FORMAT),
        }
    }

    /// Stamps the build time reported by `info`.
    #[must_use]
    pub fn with_build_timestamp(mut self, build_timestamp: impl Into<String>) -> Self {
        self.build_timestamp = build_timestamp.into();
        self
    }
}

/// Formats the modification time of the current executable (UTC).
///
/// Returns an empty string when the executable cannot be inspected or the
/// format string is invalid.
#[must_use]
pub fn build_time(format: &str) -> String {
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        tracing::debug!(format, "invalid build time format");
        return String::new();
    }

    let modified = std::env::current_exe()
        .and_then(std::fs::metadata)
        .and_then(|meta| meta.modified());
    match modified {
        Ok(time) => DateTime::<Utc>::from(time)
            .format_with_items(items.into_iter())
            .to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "executable modification time unavailable");
            String::new()
        }
    }
}
