//! Tinpot CLI — runs the coordinator or a worker.
//!
//! Both roles share one binary; see the `tinpot` library for the core
//! functionality.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tinpot::{coordinator, worker, Config};

#[derive(Debug, Parser)]
#[command(name = "tinpot", version, about = "Broker-mediated action dispatch plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP/SSE coordinator.
    Coordinator {
        /// Broker URL, e.g. tcp://localhost:1883 (overrides MQTT_BROKER).
        #[arg(long)]
        broker: Option<String>,
        /// HTTP listen port (overrides PORT).
        #[arg(long)]
        port: Option<u16>,
        /// Deadline in seconds for sync_execute (overrides SYNC_TIMEOUT_SECS).
        #[arg(long)]
        sync_timeout: Option<u64>,
    },
    /// Run an action worker.
    Worker {
        /// Broker URL, e.g. tcp://localhost:1883 (overrides MQTT_BROKER).
        #[arg(long)]
        broker: Option<String>,
        /// Directory of Lua action scripts (overrides ACTIONS_DIR).
        #[arg(long)]
        actions_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Command::Coordinator { broker, port, sync_timeout } => {
            if let Some(broker) = broker {
                config.broker_url = broker;
            }
            if let Some(port) = port {
                config.http_port = port;
            }
            if let Some(secs) = sync_timeout {
                config.sync_timeout = Duration::from_secs(secs);
            }
            coordinator::run(config).await
        }
        Command::Worker { broker, actions_dir } => {
            if let Some(broker) = broker {
                config.broker_url = broker;
            }
            if let Some(dir) = actions_dir {
                config.actions_dir = dir;
            }
            worker::run(config).await
        }
    }
}
