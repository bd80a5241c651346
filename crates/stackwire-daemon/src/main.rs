//! Stackwire Daemon - Main entry point
//!
//! Connects to the broker, keeps the device registry current and mirrors
//! Air Quality readings onto an attached LCD. Optionally serves a status API.

mod api;
mod config;
mod server;
mod state;
mod station;
mod ws;

use anyhow::Result;
use clap::Parser;
use stackwire_discovery::{DeviceRegistry, DriverFactory, EnumerationService};
use stackwire_transport::{AutoReconnect, CallbackDispatcher, TransportConnection, TransportError};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "stackwire")]
#[command(about = "Weather station on top of a Bricklet broker")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "stackwire.toml")]
    config: PathBuf,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enumerate once, print the attached devices and exit
    #[arg(long)]
    enumerate_once: bool,
}

/// How long `--enumerate-once` waits for enumeration callbacks
const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Stackwire v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }

    let address = config.broker_address();
    let policy = config.retry_policy();
    info!(broker = %address, loss_policy = ?config.loss_policy(), "Configuration loaded");

    // Handlers are registered before the first connect so no event is missed
    let dispatcher = CallbackDispatcher::new();
    let delivery = dispatcher.spawn()?;
    let connection = TransportConnection::new(dispatcher.sink(), config.connection_options());

    let registry = DeviceRegistry::new(
        DriverFactory::with_defaults(config.driver_settings()),
        connection.clone(),
        dispatcher.clone(),
        config.loss_policy(),
    );
    registry.attach();

    let station = station::Station::new(registry.clone());
    let station_task = station.start();

    let enumeration = EnumerationService::new(connection.clone(), policy.clone());
    enumeration.attach(&dispatcher);

    policy
        .retry_if(
            "connect",
            || connection.connect(&address),
            |e| !matches!(e, TransportError::AlreadyConnected),
        )
        .await?;
    let supervisor = AutoReconnect::enable(&dispatcher, connection.clone(), policy.clone());
    enumeration.enumerate_with_retry().await?;

    if args.enumerate_once {
        tokio::time::sleep(SETTLE_DELAY).await;
        let devices = registry.devices();
        println!("Attached {} devices:", devices.len());
        for device in devices {
            println!("  - {} {}", device.uid, device.device_type);
            println!(
                "    Hardware {} / Firmware {}",
                device.hardware_version, device.firmware_version
            );
            if let Some(parent) = &device.parent {
                println!("    Parent {} position {}", parent, device.position);
            }
        }
    } else {
        let server_task = config.status.enabled.then(|| {
            let state = state::AppState::new(registry.clone(), connection.clone(), station.clone());
            let bind = config.status.bind.clone();
            tokio::spawn(async move {
                if let Err(e) = server::run(state, &bind).await {
                    error!(error = %e, "Status server failed");
                }
            })
        });

        info!("Running; press Enter or Ctrl-C to exit");
        wait_for_exit().await;

        if let Some(task) = server_task {
            task.abort();
        }
    }

    supervisor.disable();
    enumeration.detach();
    connection.disconnect();
    if let Some(task) = station_task {
        task.abort();
    }
    dispatcher.shutdown();
    let _ = delivery.await;

    info!("Stopped");
    Ok(())
}

async fn wait_for_exit() {
    let enter = async {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        // closed stdin (service mode) leaves only Ctrl-C
        if !matches!(lines.next_line().await, Ok(Some(_))) {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        _ = enter => {}
    }
}
