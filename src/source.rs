//! Template sources: the I/O collaborator the resolver reads through.
//!
//! - [`FsSource`] reads from disk with `tokio::fs`
//! - [`MemorySource`] serves an in-memory map and counts reads per path

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Read a template by path.
///
/// Calls are independent: no ordering is guaranteed across concurrent reads.
pub trait TemplateSource: Send + Sync + 'static {
    fn read(&self, path: &Path) -> impl Future<Output = io::Result<String>> + Send;
}

// =============================================================================
// FsSource
// =============================================================================

/// Reads templates from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSource;

impl TemplateSource for FsSource {
    fn read(&self, path: &Path) -> impl Future<Output = io::Result<String>> + Send {
        let path = path.to_path_buf();
        async move { tokio::fs::read_to_string(&path).await }
    }
}

// =============================================================================
// MemorySource
// =============================================================================

/// In-memory template store.
///
/// Cloning shares the underlying files and counters, so a test can keep a
/// handle to inspect reads after giving the source to an engine.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Arc<RwLock<FxHashMap<PathBuf, String>>>,
    delays: Arc<RwLock<FxHashMap<PathBuf, Duration>>>,
    reads: Arc<DashMap<PathBuf, usize>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.write().insert(path.into(), content.into());
    }

    /// Delay every read of `path` by `delay`.
    pub fn delay(&self, path: impl Into<PathBuf>, delay: Duration) {
        self.delays.write().insert(path.into(), delay);
    }

    /// Number of reads issued for `path`.
    pub fn reads(&self, path: &Path) -> usize {
        self.reads.get(path).map_or(0, |n| *n)
    }

    /// Total reads across all paths.
    pub fn total_reads(&self) -> usize {
        self.reads.iter().map(|entry| *entry.value()).sum()
    }
}

impl TemplateSource for MemorySource {
    fn read(&self, path: &Path) -> impl Future<Output = io::Result<String>> + Send {
        *self.reads.entry(path.to_path_buf()).or_insert(0) += 1;

        let delay = self.delays.read().get(path).copied();
        let content = self.files.read().get(path).cloned();
        let path = path.to_path_buf();

        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            content.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )
            })
        }
    }
}
