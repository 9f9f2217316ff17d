//! Command-line interface for the Fieldgate industrial IoT gateway.

mod memory_guard;
mod orchestrator;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use fieldgate_storage::{ConfigStore, FullConfig};
use orchestrator::{GatewayOptions, Orchestrator};

/// Fieldgate - Modbus-to-cloud industrial IoT gateway.
#[derive(Parser, Debug)]
#[command(name = "fieldgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Data directory holding the configuration store.
    #[arg(short, long, global = true, default_value = "./data")]
    data_dir: PathBuf,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Listen address for the configuration link.
        #[arg(long, default_value = "0.0.0.0:8423")]
        link_addr: String,
        /// Serial device of RS-485 bus 1.
        #[arg(long, default_value = "/dev/ttyS1")]
        rtu_port1: String,
        /// Serial device of RS-485 bus 2.
        #[arg(long, default_value = "/dev/ttyS2")]
        rtu_port2: String,
    },
    /// Create the data directory and seed default configuration documents.
    Init,
    /// Print the full configuration snapshot as JSON.
    Export,
    /// Replace the configuration from a snapshot file.
    Restore {
        /// Path to a snapshot produced by `export`.
        #[arg(required = true)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Serve {
            link_addr,
            rtu_port1,
            rtu_port2,
        } => {
            // Start from RUST_LOG (default info); the persisted logging
            // document is applied on top once the store is open.
            let env_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let (filter_layer, reload_handle) = reload::Layer::new(env_filter);
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(tracing_subscriber::fmt::layer())
                .init();

            let options = GatewayOptions {
                data_dir: args.data_dir,
                link_addr,
                rtu_port1,
                rtu_port2,
            };
            let mut orchestrator = Orchestrator::build(options, Some(reload_handle)).await?;
            orchestrator.start().await?;
            match orchestrator.run().await? {
                Some(reason) => {
                    tracing::warn!(reason = %reason, "exiting for restart");
                    // A process supervisor (systemd, runit) restarts us.
                    std::process::exit(10);
                }
                None => Ok(()),
            }
        }
        Command::Init => {
            let store = open_store(&args.data_dir)?;
            // Persist the defaults so they can be edited in place.
            store.set_server_config(&store.server_config()?)?;
            store.set_logging_config(&store.logging_config()?)?;
            store.set_ota_config(&store.ota_config()?)?;
            println!(
                "initialized configuration store in {}",
                args.data_dir.display()
            );
            Ok(())
        }
        Command::Export => {
            let store = open_store(&args.data_dir)?;
            let snapshot = store.export()?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Command::Restore { input } => {
            let store = open_store(&args.data_dir)?;
            let raw = std::fs::read(&input)
                .with_context(|| format!("read snapshot {}", input.display()))?;
            let snapshot: FullConfig =
                serde_json::from_slice(&raw).context("parse snapshot")?;
            store.restore(&snapshot)?;
            println!("restored {} devices", snapshot.devices.len());
            Ok(())
        }
    }
}

fn open_store(data_dir: &std::path::Path) -> Result<ConfigStore> {
    let path = data_dir.join("config.redb");
    ConfigStore::open(&path).with_context(|| format!("open config store at {}", path.display()))
}
