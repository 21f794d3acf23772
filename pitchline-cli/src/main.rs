mod call;
mod cli;
mod config;
mod console;
mod relay;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        pitchline_telemetry::init_json_telemetry("pitchline");
    } else {
        pitchline_telemetry::init_telemetry("pitchline");
    }

    let app = AppConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Call(args) => call::run_call(app, args).await,
        Commands::Relay(args) => relay::run_relay(app, args).await,
    }
}
