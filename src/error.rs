//! Resolution and rendering error types.
//!
//! Errors are `Clone` because they travel through the bus as ordinary
//! completion payloads: the same failure may be delivered to every waiter
//! joined on one load.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::bus::BarrierError;
use crate::config::ConfigError;

/// Failures while resolving include directives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("failed to read `{}`: {message}", path.display())]
    Io {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("include directive `{0}` has no file attribute")]
    Pattern(String),

    #[error("include cycle through `{}`", .0.display())]
    Cycle(PathBuf),

    #[error("include nesting exceeds {0} levels")]
    TooDeep(usize),

    #[error("resolution timed out after {0:?}")]
    Timeout(Duration),

    #[error("resolution of `{}` was cancelled", .0.display())]
    Cancelled(PathBuf),

    #[error("include task panicked")]
    Panicked,

    #[error("engine is not initialized")]
    Uninitialized,
}

impl ResolveError {
    /// Wrap an I/O failure for `path`.
    pub fn io(path: &Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Failures while compiling or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("template compile error: {0}")]
    Compile(String),

    #[error("template render error: {0}")]
    Render(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("engine is not initialized")]
    Uninitialized,
}

/// Failures while starting an engine.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("startup stalled: {0}")]
    Barrier(#[from] BarrierError),
}
