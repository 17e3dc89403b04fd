//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

/// Address used when none is given or the argument is not an address
pub const DEFAULT_ADDRESS: &str = "//localhost";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the store-and-forward relay
    Serve {
        /// Host to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to bind
        #[arg(long)]
        port: Option<u16>,
        /// Credit window kept open on incoming links
        #[arg(long)]
        window: Option<u32>,
    },
    /// Consume a bounded number of messages from an address
    Drain {
        /// Source address (`//host[:port]/path`)
        address: Option<String>,
        /// Number of messages to consume
        count: Option<u32>,
        /// Wait until all messages arrive instead of draining
        #[arg(short, long)]
        block: bool,
    },
    /// Publish a bounded number of messages to an address
    Spout {
        /// Target address (`//host[:port]/path`)
        address: Option<String>,
        /// Number of messages to publish
        count: Option<u32>,
        /// Message body
        #[arg(long)]
        body: Option<String>,
    },
}

/// Normalize a positional address argument
pub fn resolve_address(address: Option<&str>) -> String {
    match address {
        Some(address) if address.starts_with('/') => address.to_string(),
        _ => DEFAULT_ADDRESS.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_defaults_to_localhost() {
        assert_eq!(resolve_address(None), "//localhost");
        assert_eq!(resolve_address(Some("queue")), "//localhost");
        assert_eq!(
            resolve_address(Some("//relay:5673/queue")),
            "//relay:5673/queue"
        );
    }

    #[test]
    fn test_drain_arguments_parse() {
        let cli = Cli::parse_from(["flowrelay", "-v", "drain", "//localhost/queue", "3", "-b"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Drain {
                address,
                count,
                block,
            } => {
                assert_eq!(address.as_deref(), Some("//localhost/queue"));
                assert_eq!(count, Some(3));
                assert!(block);
            }
            _ => panic!("expected drain command"),
        }
    }

    #[test]
    fn test_serve_arguments_parse() {
        let cli = Cli::parse_from(["flowrelay", "serve", "--port", "5673", "--window", "8"]);
        match cli.command {
            Commands::Serve { host, port, window } => {
                assert!(host.is_none());
                assert_eq!(port, Some(5673));
                assert_eq!(window, Some(8));
            }
            _ => panic!("expected serve command"),
        }
    }
}
