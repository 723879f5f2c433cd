//! weave - a recursive, cache-aware template include engine.
//!
//! ```text
//! Engine
//! ├── Bus          correlation bus: compound one-shot/persistent subscriptions
//! ├── Resolver     {include ...} fan-out, in-flight dedup, resolved document cache
//! ├── Renderer     compiled template cache keyed by text fingerprint
//! └── EngineConfig weave.toml, swappable at runtime
//! ```
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::with_fs(EngineConfig::with_root("site"));
//! engine.start().await?;
//! let html = engine.render_file("page.tpl", json!({ "title": "Hello" })).await?;
//! ```

pub mod logger;

pub mod bus;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod render;
pub mod resolve;
pub mod source;

pub use bus::{Bus, Topic};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{RenderError, ResolveError, StartError};
pub use fingerprint::Fingerprint;
pub use source::{FsSource, MemorySource, TemplateSource};
