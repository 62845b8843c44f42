//! ironplan - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ironplan::{
    cli::{Cli, Command, check_tool_command, run_plan_command, sign_command},
    config::{Config, LogFormat},
    server::{AppState, serve},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Non-server commands get plain warn-level logging on stderr
    match cli.command {
        Some(Command::Run { plan, data_dir }) => {
            init_cli_logging();
            let ok = run_plan_command(plan, data_dir).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Some(Command::Sign {
            secret,
            body,
            body_file,
        }) => {
            return sign_command(&secret, body, body_file);
        }
        Some(Command::CheckTool {
            file,
            name,
            capabilities,
        }) => {
            init_cli_logging();
            let ok = check_tool_command(file, name, capabilities).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        None | Some(Command::Serve) => {}
    }

    let config = Config::from_env()?;
    init_logging(&config);

    tracing::info!(
        version = ironplan::VERSION,
        env = %config.gateway.env,
        features = ?config.features(),
        "Starting ironplan"
    );

    let addr = config.gateway.bind_addr();
    let state = Arc::new(AppState::from_config(config)?);
    serve(state, &addr).await
}

fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

fn init_cli_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
}
