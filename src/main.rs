//! weave - template include engine CLI.

use anyhow::{Context, Result};
use clap::{ColorChoice, Parser};

use weave::cli::{self, Cli, Commands};
use weave::{Engine, EngineConfig, debug};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }

    let config = EngineConfig::load(&cli)?;
    let engine = Engine::with_fs(config);

    // Failures are returned as errors below; keep the channel for --verbose
    engine
        .bus()
        .on_diagnostic(|message| debug!("diagnostic"; "{}", message));
    engine.start().await.context("failed to start engine")?;

    match &cli.command {
        Commands::Resolve { file } => cli::output::resolve_file(&engine, file).await,
        Commands::Render { file, data } => {
            cli::output::render_file(&engine, file, data.as_deref()).await
        }
        Commands::Check => cli::check::run_check(&engine).await,
    }
}
