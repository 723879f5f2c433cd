//! Engine configuration management for `weave.toml`.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── section/       # [resolve] and [bus]
//! ├── types/         # ConfigError, ConfigDiagnostics, FieldPath
//! ├── util.rs        # Config file discovery
//! └── mod.rs         # EngineConfig (this file)
//! ```
//!
//! # Example
//!
//! ```toml
//! root_path = "site"          # Project root (relative to this file), required
//! theme = "default"           # Theme directory under <root>/template/
//! cache_enabled = true        # Memoize resolved documents
//! debug_mode = false          # Strict undefined variables and verbose template errors
//! preload = ["layout.tpl"]    # Resolved at startup to warm the cache
//!
//! [resolve]
//! timeout_ms = 5000
//! max_depth = 32
//!
//! [bus]
//! max_subscribers = 50
//! ```

pub mod section;
pub mod types;
mod util;

use util::{find_config_file, normalize_path};

pub use section::{BusConfig, ResolveConfig};
pub use types::{ConfigDiagnostic, ConfigDiagnostics, ConfigError, FieldPath};

use crate::cli::Cli;
use crate::log;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Default theme name.
pub const DEFAULT_THEME: &str = "default";

// ============================================================================
// root configuration
// ============================================================================

/// Root configuration structure representing weave.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Absolute path to the config file (internal use only)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Project root containing `template/` and `module/`. Required.
    pub root_path: PathBuf,

    /// Theme directory name.
    pub theme: String,

    /// Memoize fully resolved documents by path fingerprint.
    pub cache_enabled: bool,

    /// Strict template rendering with detailed errors.
    pub debug_mode: bool,

    /// Templates resolved during startup (relative to the theme directory).
    pub preload: Vec<PathBuf>,

    /// Include resolution settings.
    pub resolve: ResolveConfig,

    /// Correlation bus settings.
    pub bus: BusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            root_path: PathBuf::new(),
            theme: DEFAULT_THEME.to_string(),
            cache_enabled: true,
            debug_mode: false,
            preload: Vec::new(),
            resolve: ResolveConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl EngineConfig {
    pub const ROOT_PATH: FieldPath = FieldPath::new("root_path");
    pub const THEME: FieldPath = FieldPath::new("theme");
    pub const PRELOAD: FieldPath = FieldPath::new("preload");

    /// Create a config for `root` with every other option at its default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root.into(),
            ..Self::default()
        }
    }

    /// Load configuration from CLI arguments.
    ///
    /// Searches upward from cwd for the config file. A missing file is not an
    /// error here: `--root` alone is a complete configuration, and a missing
    /// root is reported by the engine when it starts.
    pub fn load(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current working directory")?;

        let mut config = match find_config_file(&cli.config) {
            Some(path) => {
                let mut config = Self::from_path(&path)?;
                let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
                config.config_path = normalize_path(&path);
                config.normalize_paths(&base);
                config
            }
            None => {
                crate::debug!("config"; "no {} found, using defaults", cli.config.display());
                Self::default()
            }
        };

        config.apply_cli(cli, &cwd);
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from file path with unknown field detection.
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            Self::print_unknown_fields_warning(&ignored, path);
        }
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Print warning about unknown fields.
    fn print_unknown_fields_warning(fields: &[String], path: &Path) {
        let display_path = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        log!("warning"; "unknown fields in {} are ignored:", display_path);
        for field in fields {
            eprintln!("- {}", field);
        }
    }

    // ========================================================================
    // cli configuration updates
    // ========================================================================

    /// Apply CLI overrides. CLI paths are relative to the current directory.
    fn apply_cli(&mut self, cli: &Cli, cwd: &Path) {
        crate::logger::set_verbose(cli.verbose);

        if let Some(root) = &cli.root {
            self.root_path = normalize_path(&cwd.join(root));
        }
        Self::update_option(&mut self.theme, cli.theme.as_ref());
        if cli.no_cache {
            self.cache_enabled = false;
        }
        if cli.debug {
            self.debug_mode = true;
        }
    }

    /// Update config option if CLI value is provided.
    fn update_option<T: Clone>(config_option: &mut T, cli_option: Option<&T>) {
        if let Some(option) = cli_option {
            *config_option = option.clone();
        }
    }

    /// Resolve `root_path` against the config file directory.
    ///
    /// An empty root stays empty so validation can report it.
    fn normalize_paths(&mut self, base: &Path) {
        if !self.root_path.as_os_str().is_empty() {
            self.root_path = normalize_path(&base.join(&self.root_path));
        }
    }

    // ========================================================================
    // paths
    // ========================================================================

    /// `<root>/template/<theme>`
    pub fn template_dir(&self) -> PathBuf {
        self.root_path.join("template").join(&self.theme)
    }

    /// `<root>/module/<module>/template/<theme>`
    pub fn module_template_dir(&self, module: &str) -> PathBuf {
        self.root_path
            .join("module")
            .join(module)
            .join("template")
            .join(&self.theme)
    }

    /// Resolve a user-supplied template path.
    ///
    /// Absolute paths are kept; relative ones are taken from the theme directory.
    pub fn template_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.template_dir().join(path)
        }
    }

    // ========================================================================
    // validation
    // ========================================================================

    /// Validate configuration, collecting every error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut diag = ConfigDiagnostics::new();

        if self.root_path.as_os_str().is_empty() {
            diag.error_with_hint(
                Self::ROOT_PATH,
                "root path is not defined",
                "set `root_path` in weave.toml or pass --root",
            );
        }
        if self.theme.trim().is_empty() {
            diag.error(Self::THEME, "theme must not be empty");
        }
        if self.preload.iter().any(|p| p.as_os_str().is_empty()) {
            diag.warn(Self::PRELOAD, "empty entries are skipped");
        }

        self.resolve.validate(&mut diag);
        self.bus.validate(&mut diag);

        diag.print_warnings();
        diag.into_result().map_err(ConfigError::Diagnostics)
    }
}

// ============================================================================
// Test Helpers (available to all modules via `use crate::config::test_*`)
// ============================================================================

/// Parse config with the required `root_path` set.
/// Panics if there are unknown fields (to catch config typos in tests).
#[cfg(test)]
pub fn test_parse_config(extra: &str) -> EngineConfig {
    let config = format!("root_path = \"/site\"\n{extra}");
    let (parsed, ignored) = EngineConfig::parse_with_ignored(&config).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

// ============================================================================
// tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_from_str_invalid_toml() {
        assert!(EngineConfig::from_str("[resolve\ntimeout_ms = 1").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.theme, "default");
        assert!(config.cache_enabled);
        assert!(!config.debug_mode);
        assert!(config.preload.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = test_parse_config(
            "theme = \"dark\"\ncache_enabled = false\ndebug_mode = true\npreload = [\"layout.tpl\"]",
        );
        assert_eq!(config.root_path, PathBuf::from("/site"));
        assert_eq!(config.theme, "dark");
        assert!(!config.cache_enabled);
        assert!(config.debug_mode);
        assert_eq!(config.preload, vec![PathBuf::from("layout.tpl")]);
    }

    #[test]
    fn test_missing_root_is_validation_error() {
        let config = EngineConfig::default();
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::Diagnostics(diag) => {
                assert_eq!(diag.errors()[0].field, EngineConfig::ROOT_PATH);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(EngineConfig::with_root("/site").validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_detected() {
        let content = "root_path = \"/site\"\n[unknown_section]\nfield = \"value\"";
        let (config, ignored) = EngineConfig::parse_with_ignored(content).unwrap();
        assert_eq!(config.root_path, PathBuf::from("/site"));
        assert!(ignored.iter().any(|f| f.contains("unknown_section")));
    }

    #[test]
    fn test_template_paths() {
        let mut config = EngineConfig::with_root("/site");
        config.theme = "dark".into();
        assert_eq!(config.template_dir(), PathBuf::from("/site/template/dark"));
        assert_eq!(
            config.module_template_dir("blog"),
            PathBuf::from("/site/module/blog/template/dark")
        );
        assert_eq!(
            config.template_path(Path::new("page.tpl")),
            PathBuf::from("/site/template/dark/page.tpl")
        );
        assert_eq!(
            config.template_path(Path::new("/abs/page.tpl")),
            PathBuf::from("/abs/page.tpl")
        );
    }

    #[test]
    fn test_root_relative_to_config_file() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("site")).unwrap();
        let config_path = dir.path().join("weave.toml");
        fs::write(&config_path, "root_path = \"site\"\ntheme = \"dark\"").unwrap();

        let mut config = EngineConfig::from_path(&config_path).unwrap();
        config.normalize_paths(dir.path());
        assert_eq!(config.root_path, normalize_path(&dir.path().join("site")));
        assert_eq!(config.theme, "dark");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "weave", "--theme", "dark", "--no-cache", "--debug", "--root", "/srv/site", "check",
        ]);
        let mut config = EngineConfig::with_root("/site");
        config.apply_cli(&cli, Path::new("/"));
        assert_eq!(config.theme, "dark");
        assert!(!config.cache_enabled);
        assert!(config.debug_mode);
        assert_eq!(config.root_path, PathBuf::from("/srv/site"));
    }
}
