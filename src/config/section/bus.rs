//! `[bus]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [bus]
//! max_subscribers = 50        # Per-topic subscriber count before a leak warning
//! ```

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_MAX_SUBSCRIBERS;
use crate::config::{ConfigDiagnostics, FieldPath};

/// Correlation bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-topic subscriber count above which a warning is logged.
    /// Exceeding it never drops a subscription.
    pub max_subscribers: usize,
}

impl BusConfig {
    pub const MAX_SUBSCRIBERS: FieldPath = FieldPath::new("bus.max_subscribers");

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.max_subscribers == 0 {
            diag.error(Self::MAX_SUBSCRIBERS, "must be greater than zero");
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
        }
    }
}
