//! Resolution context.
//!
//! An [`Engine`] owns its bus, resolver, render cache and configuration.
//! Nothing is global: two engines in one process share no state.
//!
//! # Lifecycle
//!
//! ```text
//! Engine::new ──> start() ── invalid config ──> report on Diagnostic, stay uninitialized
//!                    │
//!                    └─ arm barrier {config, renderer, preload}
//!                         ├─ config ✓, renderer ✓      (inline)
//!                         └─ spawn: preload ... ✓      (background task)
//!                                    all three ──> Ready
//! ```
//!
//! Every operation before `Ready` returns `Uninitialized`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};

use crate::bus::{Barrier, Bus, Resolution, Topic};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{RenderError, ResolveError, StartError};
use crate::render::Renderer;
use crate::resolve::Resolver;
use crate::source::{FsSource, TemplateSource};
use crate::{debug, log};

const MILESTONE_CONFIG: &str = "config";
const MILESTONE_RENDERER: &str = "renderer";
const MILESTONE_PRELOAD: &str = "preload";

/// Slack on top of the resolve timeout before a stalled startup is reported.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

pub struct Engine<S = FsSource> {
    config: ArcSwap<EngineConfig>,
    bus: Arc<Bus>,
    resolver: Arc<Resolver<S>>,
    renderer: Renderer,
    ready: Arc<AtomicBool>,
}

impl Engine<FsSource> {
    /// Engine reading templates from disk.
    pub fn with_fs(config: EngineConfig) -> Self {
        Self::new(config, FsSource)
    }
}

impl<S: TemplateSource> Engine<S> {
    pub fn new(config: EngineConfig, source: S) -> Self {
        let bus = Arc::new(Bus::with_max_subscribers(config.bus.max_subscribers));
        Self {
            resolver: Arc::new(Resolver::new(source, Arc::clone(&bus))),
            renderer: Renderer::new(Arc::clone(&bus), config.debug_mode),
            config: ArcSwap::from_pointee(config),
            bus,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Validate configuration, warm caches, and mark the engine ready.
    ///
    /// Preload failures are logged and do not fail startup. Calling `start`
    /// on a ready engine does nothing.
    pub async fn start(&self) -> Result<(), StartError> {
        if self.is_ready() {
            return Ok(());
        }

        let cfg = self.config.load_full();
        if let Err(err) = cfg.validate() {
            self.bus.report(format!("config: {err}"));
            return Err(err.into());
        }

        let (barrier, milestones) = Barrier::arm(
            &self.bus,
            [MILESTONE_CONFIG, MILESTONE_RENDERER, MILESTONE_PRELOAD],
        );
        let ready = Arc::clone(&self.ready);
        self.bus.subscribe([Topic::Ready], move |_| {
            ready.store(true, Ordering::Release);
        });

        let mut preload = None;
        for milestone in milestones {
            match milestone.name() {
                MILESTONE_PRELOAD => {
                    let resolver = Arc::clone(&self.resolver);
                    let cfg = Arc::clone(&cfg);
                    preload = Some(tokio::spawn(async move {
                        Self::preload(resolver, cfg).await;
                        milestone.complete();
                    }));
                }
                MILESTONE_RENDERER => {
                    self.renderer.set_debug(cfg.debug_mode);
                    milestone.complete();
                }
                _ => milestone.complete(),
            }
        }

        // Every preload resolve is bounded by the resolve timeout
        let deadline = cfg.resolve.timeout() + STARTUP_GRACE;
        if let Err(err) = barrier.wait(deadline).await {
            if let Some(task) = preload {
                task.abort();
            }
            return Err(err.into());
        }
        log!("ready"; "theme `{}` at {}", cfg.theme, cfg.root_path.display());
        Ok(())
    }

    async fn preload(resolver: Arc<Resolver<S>>, cfg: Arc<EngineConfig>) {
        let mut tasks = JoinSet::new();
        for path in cfg.preload.iter().filter(|p| !p.as_os_str().is_empty()) {
            let resolver = Arc::clone(&resolver);
            let cfg = Arc::clone(&cfg);
            let path = path.clone();
            tasks.spawn(async move {
                let resolution = resolver.resolve(&path, cfg).await;
                (path, resolution)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((path, Ok(_))) => debug!("preload"; "{}", path.display()),
                Ok((path, Err(err))) => log!("preload"; "skipped {}: {}", path.display(), err),
                Err(err) => log!("preload"; "task failed: {}", err),
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Fully resolve the template at `path` (relative to the theme directory).
    pub async fn resolve(&self, path: impl AsRef<Path>) -> Resolution {
        self.ensure_ready()?;
        self.resolver
            .resolve(path.as_ref(), self.config.load_full())
            .await
    }

    /// Resolve in the background and hand the result to `callback`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn resolve_with<F>(&self, path: impl Into<PathBuf>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Resolution) + Send + 'static,
    {
        let path = path.into();
        let state = self
            .ensure_ready()
            .map(|()| (Arc::clone(&self.resolver), self.config.load_full()));

        tokio::spawn(async move {
            let resolution = match state {
                Ok((resolver, cfg)) => resolver.resolve(&path, cfg).await,
                Err(err) => Err(err),
            };
            callback(resolution);
        })
    }

    /// Resolve include directives in an in-memory document.
    pub async fn resolve_text(&self, text: &str) -> Resolution {
        self.ensure_ready()?;
        self.resolver
            .resolve_text(text, self.config.load_full())
            .await
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Render already-resolved template text.
    pub fn render<T: Serialize>(&self, text: &str, data: T) -> Result<String, RenderError> {
        if !self.is_ready() {
            return Err(RenderError::Uninitialized);
        }
        self.renderer.render(text, data)
    }

    /// Resolve the template at `path`, then render it.
    pub async fn render_file<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        data: T,
    ) -> Result<String, RenderError> {
        if !self.is_ready() {
            return Err(RenderError::Uninitialized);
        }
        let text = self.resolve(path).await?;
        self.renderer.render(&text, data)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Wipe the resolved document cache and the compiled template cache.
    pub fn clear_caches(&self) {
        self.resolver.clear();
        self.renderer.clear();
        debug!("cache"; "all caches cleared");
    }

    /// Swap in a new configuration and clear both caches.
    ///
    /// Bus capacity is fixed when the engine is built.
    pub fn reconfigure(&self, config: EngineConfig) -> Result<(), ConfigError> {
        if let Err(err) = config.validate() {
            self.bus.report(format!("config: {err}"));
            return Err(err);
        }
        self.renderer.set_debug(config.debug_mode);
        self.config.store(Arc::new(config));
        self.clear_caches();
        Ok(())
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn resolver(&self) -> &Resolver<S> {
        &self.resolver
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    fn ensure_ready(&self) -> Result<(), ResolveError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ResolveError::Uninitialized)
        }
    }
}
