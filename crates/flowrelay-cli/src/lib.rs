//! flowrelay CLI library
//!
//! Argument parsing, TOML configuration and the command handlers behind the
//! `flowrelay` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, ServeConfig};
pub use error::{CliError, Result};
