//! `check` command: resolve every template of the active theme.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use jwalk::WalkDir;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::ResolveError;
use crate::log;
use crate::source::TemplateSource;

/// Outcome of a check run.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub checked: usize,
    pub failures: Vec<(PathBuf, ResolveError)>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Check all templates and print a report. Fails if any template does not resolve.
pub async fn run_check<S: TemplateSource>(engine: &Engine<S>) -> Result<()> {
    let config = engine.config();
    let report = check_templates(engine).await;

    if report.checked == 0 {
        log!("check"; "no templates found under {}", config.template_dir().display());
        return Ok(());
    }

    for (path, err) in &report.failures {
        let shown = path.strip_prefix(&config.root_path).unwrap_or(path);
        log!("check"; "{}: {}", shown.display(), err);
    }

    if !report.is_ok() {
        bail!(
            "{} of {} templates failed to resolve",
            report.failures.len(),
            report.checked
        );
    }
    log!("check"; "{} templates resolved", report.checked);
    Ok(())
}

/// Resolve every template concurrently and collect failures, sorted by path.
pub async fn check_templates<S: TemplateSource>(engine: &Engine<S>) -> CheckReport {
    let files = collect_templates(&engine.config());
    let checked = files.len();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for path in files {
        let tx = tx.clone();
        let shown = path.clone();
        engine.resolve_with(path, move |resolution| {
            let _ = tx.send((shown, resolution));
        });
    }
    drop(tx);

    let mut failures = Vec::new();
    while let Some((path, resolution)) = rx.recv().await {
        if let Err(err) = resolution {
            failures.push((path, err));
        }
    }
    failures.sort_by(|a, b| a.0.cmp(&b.0));

    CheckReport { checked, failures }
}

/// Theme templates plus every module's templates for the same theme.
pub fn collect_templates(config: &EngineConfig) -> Vec<PathBuf> {
    let mut dirs = vec![config.template_dir()];
    if let Ok(entries) = fs::read_dir(config.root_path.join("module")) {
        for entry in entries.filter_map(Result::ok) {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                dirs.push(config.module_template_dir(&entry.file_name().to_string_lossy()));
            }
        }
    }

    let mut files: Vec<PathBuf> = dirs
        .iter()
        .filter(|dir| dir.is_dir())
        .flat_map(|dir| walk_files(dir))
        .collect();
    files.sort();
    files
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path())
        .collect()
}
