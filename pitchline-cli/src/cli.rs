use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pitchline_realtime::{Scenario, TransportKind};

#[derive(Parser)]
#[command(name = "pitchline")]
#[command(about = "Practice sales calls against a realtime voice prospect", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML file with [bridge], [relay] and [scenarios] tables
    #[arg(short, long, global = true, env = "PITCHLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log as newline-delimited JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one practice call
    Call(CallArgs),

    /// Run the relay and credential server
    Relay(RelayArgs),
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Objection scenario the prospect raises
    #[arg(short, long, default_value = "price")]
    pub scenario: Scenario,

    /// Transport: websocket or webrtc
    #[arg(short, long)]
    pub transport: Option<TransportKind>,

    /// Connect through a relay instead of directly
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Credential broker endpoint for webrtc calls
    #[arg(long)]
    pub broker_url: Option<String>,

    /// 24kHz mono WAV replayed as the trainee's voice
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Record the prospect's audio to this WAV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Hang up after this many seconds
    #[arg(short, long, default_value = "30")]
    pub duration: u64,

    /// Write the call summary as JSON
    #[arg(long)]
    pub summary: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    /// Listen address
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}
