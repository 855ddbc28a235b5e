// Module declarations for the bridge's core components
pub mod config; // YAML configuration (inverters, discovery, logging)
pub mod discovery; // UDP broadcast discovery across local interfaces
pub mod envertech; // Envertech gateway protocol implementation
pub mod options; // Command line options parsing
pub mod prelude; // Common imports and types
pub mod utils; // Byte math and scaling helpers

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::discovery::DiscoveredDevice;
use crate::envertech::client::{InverterClient, StreamEvent, DEFAULT_PORT};
use crate::prelude::*;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const RECONNECT_DELAY_SECS: u64 = 5; // delay before reconnection attempts

/// One device the bridge polls, whether it came from the config file or
/// from a discovery pass.
#[derive(Clone, Debug)]
struct PollTarget {
    host: String,
    port: u16,
    serial: Serial,
    interval: Duration,
    receive_timeout: Duration,
}

impl PollTarget {
    fn from_inverter(inverter: &config::Inverter) -> Self {
        Self {
            host: inverter.host().to_string(),
            port: inverter.port(),
            serial: inverter.serial(),
            interval: inverter.poll_interval(),
            receive_timeout: inverter.receive_timeout(),
        }
    }

    fn from_discovered(device: &DiscoveredDevice) -> Option<Self> {
        let serial = match device.serial_number.parse() {
            Ok(serial) => serial,
            Err(e) => {
                warn!(
                    "discovered device at {} has unusable serial {:?}: {}",
                    device.ip, device.serial_number, e
                );
                return None;
            }
        };
        Some(Self {
            host: device.ip.clone(),
            port: DEFAULT_PORT,
            serial,
            interval: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(10),
        })
    }
}

/// Main application loop: optional discovery pass, then one polling task
/// per target device until the shutdown signal arrives.
pub async fn app(
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    config: Arc<Config>,
) -> Result<()> {
    let mut targets: Vec<PollTarget> = config
        .enabled_inverters()
        .map(PollTarget::from_inverter)
        .collect();

    if config.discovery().enabled() {
        match discovery::discover(
            config.discovery().bind_addresses(),
            config.discovery().timeout(),
        )
        .await
        {
            Ok(devices) => {
                for device in &devices {
                    info!(
                        "discovered gateway {} at {} via {}{}",
                        device.serial_number,
                        device.ip,
                        device.source,
                        device
                            .mac
                            .as_deref()
                            .map(|mac| format!(" (mac {})", mac))
                            .unwrap_or_default()
                    );
                }
                // configured inverters take precedence; discovery only
                // fills in when the config names none
                if targets.is_empty() {
                    targets = devices.iter().filter_map(PollTarget::from_discovered).collect();
                }
            }
            Err(e) => warn!("discovery failed: {}", e),
        }
    }

    if targets.is_empty() {
        bail!("no inverters configured and none discovered");
    }

    let mut handles = Vec::new();
    for target in targets {
        handles.push(tokio::spawn(poll_target(target)));
    }

    let _ = shutdown_rx.recv().await;
    info!("shutdown signal received, stopping polling tasks");
    for handle in &handles {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}

async fn poll_target(target: PollTarget) {
    loop {
        if let Err(e) = stream_target(&target).await {
            error!("inverter {}: {}", target.serial, e);
        }
        info!(
            "inverter {}: reconnecting in {}s",
            target.serial, RECONNECT_DELAY_SECS
        );
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

async fn stream_target(target: &PollTarget) -> Result<()> {
    let client = InverterClient::new(target.host.clone(), target.port, target.serial);
    let mut stream = client.stream(target.interval, target.receive_timeout).await?;

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Reply(reply) if reply.is_usable() => {
                println!("{}", serde_json::to_string(&reply.snapshot)?);
            }
            StreamEvent::Reply(reply) => {
                debug!(
                    "inverter {}: empty reply (control code {:?})",
                    target.serial, reply.control_code
                );
            }
            StreamEvent::Idle => {
                debug!("inverter {}: no data this cycle", target.serial);
            }
            StreamEvent::Failed(message) => bail!("stream failed: {}", message),
        }
    }

    Ok(())
}

/// Entry point: load configuration, set up logging and the shutdown
/// channel, then run the main loop.
pub async fn run() -> Result<()> {
    let options = Options::new();
    let config = Config::new(options.config_file.clone())?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.loglevel()))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    info!(
        "starting envertech-bridge {} with config file: {}",
        CARGO_PKG_VERSION, options.config_file
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {}", e);
        }
        let _ = shutdown_tx.send(());
    });

    app(shutdown_rx, Arc::new(config)).await
}
