//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Draupnir - ephemeral database instances with access control
#[derive(Parser, Debug)]
#[command(name = "draupnir")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "DRAUPNIR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "DRAUPNIR_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "DRAUPNIR_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DRAUPNIR_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "DRAUPNIR_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve,

    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["draupnir"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_check_config() {
        let cli = Cli::parse_from(["draupnir", "check-config", "--config", "/tmp/d.yaml"]);
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/d.yaml")));
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from(["draupnir", "--port", "9000", "--host", "127.0.0.1", "serve"]);
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}
