//! Command-line interface definitions.

use clap::{ColorChoice, Parser, Subcommand};
use std::path::PathBuf;

/// weave template include engine CLI
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path (default: weave.toml)
    #[arg(short = 'C', long, global = true, default_value = "weave.toml", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Project root containing `template/` and `module/` (relative to current directory)
    #[arg(short, long, global = true, value_hint = clap::ValueHint::DirPath)]
    pub root: Option<PathBuf>,

    /// Theme directory name under `template/`
    #[arg(short, long, global = true)]
    pub theme: Option<String>,

    /// Disable the resolved document cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Strict undefined variables and detailed template errors
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Print debug logs
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Resolve include directives and print the result
    #[command(visible_alias = "r")]
    Resolve {
        /// Template path (relative to the theme directory)
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,
    },

    /// Resolve, then render with JSON data
    Render {
        /// Template path (relative to the theme directory)
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,

        /// Render context as a JSON object
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },

    /// Resolve every template of the theme and report include errors
    #[command(visible_alias = "c")]
    Check,
}
