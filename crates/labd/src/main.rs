//! labd — the peerlab daemon.
//!
//! Single binary that assembles the lab:
//! - Metadata store (redb)
//! - Local node provider + HTTP agent connector
//! - Cluster lifecycle manager
//! - Benchmark pipeline + experiment coordinator
//! - Run supervisor
//! - Control API
//!
//! # Usage
//!
//! ```text
//! labd serve --config /etc/peerlab/labd.toml --addr 0.0.0.0:7001 --data-dir /var/lib/peerlab
//! labd config --config /etc/peerlab/labd.toml
//! ```

mod serve;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use peerlab_core::LabdConfig;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,labd=debug,peerlab=debug";

#[derive(Debug, Parser)]
#[command(name = "labd", about = "peerlab daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the control API until interrupted.
    Serve {
        #[command(flatten)]
        config: ConfigArgs,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Path to labd.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file.
    #[arg(long)]
    addr: Option<String>,

    /// Data directory, overriding the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<LabdConfig> {
        let mut config = match &self.config {
            Some(path) => LabdConfig::from_file(path)
                .map_err(|e| anyhow::anyhow!("load config {}: {e}", path.display()))?,
            None => LabdConfig::default(),
        };
        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_json } => {
            init_tracing(log_json);
            serve::run(config.load()?).await
        }
        Command::Config { config } => {
            print!("{}", config.load()?.to_toml_string()?);
            Ok(())
        }
    }
}
