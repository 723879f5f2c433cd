//! `[resolve]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [resolve]
//! timeout_ms = 5000           # Deadline for one top-level resolution
//! max_depth = 32              # Maximum include nesting
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigDiagnostics, FieldPath};

/// Include resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Deadline for one top-level resolution, in milliseconds.
    pub timeout_ms: u64,

    /// Maximum include nesting depth.
    pub max_depth: usize,
}

impl ResolveConfig {
    pub const TIMEOUT_MS: FieldPath = FieldPath::new("resolve.timeout_ms");
    pub const MAX_DEPTH: FieldPath = FieldPath::new("resolve.max_depth");

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.timeout_ms == 0 {
            diag.error(Self::TIMEOUT_MS, "must be greater than zero");
        }
        if self.max_depth == 0 {
            diag.error_with_hint(
                Self::MAX_DEPTH,
                "must be greater than zero",
                "use 1 to allow includes without nesting",
            );
        }
    }
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_depth: 32,
        }
    }
}
