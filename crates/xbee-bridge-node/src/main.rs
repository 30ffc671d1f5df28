//! XBee Bridge Node - XBee radio mesh to MQTT daemon
//!
//! This binary runs the bridge with:
//! - A JSON-lines TCP link to the XBee frame decoder
//! - An MQTT client for the pub/sub side
//! - Route reload on `SIGHUP`, clean shutdown on `SIGINT`/`SIGTERM`

mod mqtt;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mqtt::MqttBus;
use xbee_bridge::{TcpLink, XBeeBridge, XBeeBridgeConfig, VERSION};

#[derive(Parser)]
#[command(name = "xbee-bridge-node")]
#[command(about = "Bridge between an XBee radio mesh and an MQTT broker")]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the radio link address (host:port)
    #[arg(long)]
    radio: Option<String>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<XBeeBridgeConfig> {
    let Some(path) = path else {
        return Ok(XBeeBridgeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(unix)]
fn hangups() -> anyhow::Result<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{signal, SignalKind};
    Ok(signal(SignalKind::hangup())?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = load_config(args.config.as_deref())?;
    if let Some(radio) = args.radio {
        config.radio.address = radio;
    }

    info!("Starting xbee-bridge-node v{}", VERSION);

    let (bus, eventloop) = MqttBus::connect(&config.mqtt)
        .await
        .context("Failed to connect to MQTT broker")?;
    let bus = Arc::new(bus);

    let link = TcpLink::new(&config.radio.address);
    let (bridge, handle) = XBeeBridge::new(link, &config.general, bus.clone())?;

    tokio::spawn(mqtt::forward_messages(eventloop, handle.clone()));
    let mut bridge_task = tokio::spawn(bridge.run());

    #[cfg(unix)]
    let mut hangup = hangups()?;

    let outcome = loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            result = &mut bridge_task => {
                break result.context("Bridge task panicked")?.context("Bridge stopped");
            }

            _ = reload => {
                match load_config(args.config.as_deref()) {
                    Ok(reloaded) => {
                        if let Err(e) = handle.reload(reloaded.general.routes).await {
                            warn!("Reload failed: {}", e);
                        }
                    }
                    Err(e) => error!("Keeping current routes: {:#}", e),
                }
            }

            _ = terminate() => {
                info!("Shutdown requested");
                if let Err(e) = handle.shutdown().await {
                    warn!("Bridge already stopped: {}", e);
                }
                break bridge_task
                    .await
                    .context("Bridge task panicked")?
                    .context("Bridge stopped");
            }
        }
    };

    bus.disconnect().await;
    info!("Exiting");
    outcome
}
