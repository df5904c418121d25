//! Draupnir - ephemeral database instances with access control

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use draupnir::{
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Load the configuration, apply command-line overrides and validate
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = Config::resolve_path(cli.config.as_deref());
    if let Some(ref p) = path {
        info!(path = %p.display(), "Loading configuration");
    }

    let mut config = Config::load(path.as_deref()).context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if let Some(ref host) = cli.host {
        config.http.host.clone_from(host);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Validate the configuration and print it with secrets masked
fn check_config(cli: &Cli) -> ExitCode {
    let printed = load_config(cli).and_then(|config| {
        serde_yaml::to_string(&config.redacted()).context("failed to render configuration")
    });

    match printed {
        Ok(yaml) => {
            println!("{yaml}");
            println!("Configuration OK");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the server
async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(c) => c,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
