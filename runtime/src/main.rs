//! prometheus-streams command line

#![deny(unsafe_code)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use streams_relay::Config;
use streams_runtime::Component;

#[derive(Debug, Parser)]
#[command(name = "prometheus-streams", version, about = "Prometheus metrics relay over NATS JetStream")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "PROMETHEUS_STREAMS_CONFIG")]
    config: PathBuf,

    /// Write running PID to a file
    #[arg(long)]
    pid: Option<PathBuf>,

    /// Force debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll targets and publish their metrics
    Poller,
    /// Receive published metrics and push them to the gateway
    Receiver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("could not load {}", cli.config.display()))?;
    if cli.debug {
        config.debug = true;
    }

    streams_runtime::init_tracing(&config)?;

    if let Some(pid) = &cli.pid {
        streams_runtime::write_pid(pid)?;
    }

    let component = match cli.command {
        Command::Poller => Component::Poller,
        Command::Receiver => Component::Receiver,
    };

    let result = streams_runtime::run(config, component).await;

    if let Some(pid) = &cli.pid {
        let _ = std::fs::remove_file(pid);
    }

    result
}
