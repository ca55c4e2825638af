//! Command-line interface.
//!
//! Argument parsing lives in [`args`], one module per command in [`commands`].

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
