//! chanmux CLI
//!
//! Runs a soak test of the muxer/demuxer pair: N producers share one
//! channel, each output is checked for completeness and order.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use chanmux_cli::soak::{self, SoakPlan};
use chanmux_core::config::load_config;
use chanmux_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "chanmux")]
#[command(version, about = "Soak test for channel multiplexing", long_about = None)]
struct Args {
    /// Streams registered on both the muxer and the demuxer
    #[arg(long, default_value_t = 4, env = "CHANMUX_STREAMS")]
    streams: usize,

    /// Messages sent on every stream
    #[arg(long, default_value_t = 1000, env = "CHANMUX_MESSAGES")]
    messages: u64,

    /// Capacity of the shared channel
    #[arg(long, default_value_t = 1)]
    shared_capacity: usize,

    /// Put an unbounded relay in front of the demuxer
    #[arg(long)]
    relay: bool,

    /// Extra streams the demuxer never claims
    #[arg(long, default_value_t = 0)]
    unregistered: usize,

    /// Config file (JSON), applied over the global settings
    #[arg(long, env = "CHANMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"); overrides the config
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    config.log.json |= args.log_json;

    init_tracing(
        &default_filter(&["chanmux", "chanmux-cli"], &config.log),
        config.log.json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        streams = args.streams,
        messages = args.messages,
        relay = args.relay,
        unregistered = args.unregistered,
        policy = ?config.demuxer.unregistered,
        "Starting chanmux soak run"
    );

    let plan = SoakPlan {
        streams: args.streams,
        messages: args.messages,
        shared_capacity: args.shared_capacity,
        relay: args.relay,
        unregistered: args.unregistered,
    };
    let report = soak::run(&plan, &config).await?;

    if !report.is_clean() {
        for stream in report.streams.iter().filter(|s| {
            !s.in_order || s.received != report.expected
        }) {
            error!(
                id = %stream.id,
                received = stream.received,
                expected = report.expected,
                in_order = stream.in_order,
                "Stream failed verification"
            );
        }
        anyhow::bail!("soak run failed verification");
    }

    Ok(())
}
