//! Command-line interface module.

mod args;
pub mod check;
pub mod output;

pub use args::{Cli, Commands};
