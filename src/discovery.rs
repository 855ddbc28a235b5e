use crate::prelude::*;

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

pub const LOCALCON_PROBE: &[u8] = b"LOCALCON-1508-READ";
pub const WIFI_PROBE: &[u8] = b"www.usr.cn";
pub const LOCALCON_PORT: u16 = 48889;
pub const WIFI_PORT: u16 = 48899;

const RECV_BUFFER_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    Ethernet,
    Wifi,
}

impl std::fmt::Display for DeviceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSource::Ethernet => write!(f, "ethernet"),
            DeviceSource::Wifi => write!(f, "wifi"),
        }
    }
}

/// A gateway seen on the local network. Identity is the serial number;
/// records never change after decoding.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub serial_number: String,
    pub mac: Option<String>,
    pub source: DeviceSource,
}

impl DiscoveredDevice {
    /// Dedup key. Serials are hex digits and the two dialects disagree on
    /// case, so compare uppercased.
    pub fn identity(&self) -> String {
        self.serial_number.to_uppercase()
    }
}

/// Binary reply on the localcon port: ip in the first 4 bytes, serial in
/// bytes 6..10, no MAC.
pub fn decode_localcon_reply(data: &[u8]) -> Option<DiscoveredDevice> {
    if data.len() < 10 {
        return None;
    }
    let ip = format!("{}.{}.{}.{}", data[0], data[1], data[2], data[3]);
    let serial_number = data[6..10].iter().map(|b| format!("{:02X}", b)).collect();
    Some(DiscoveredDevice {
        ip,
        serial_number,
        mac: None,
        source: DeviceSource::Ethernet,
    })
}

/// Text reply on the wifi port: comma-separated `ip,mac,serial,...`.
/// Replies with fewer than 3 fields are discarded.
pub fn decode_wifi_reply(data: &[u8]) -> Option<DiscoveredDevice> {
    let text = String::from_utf8_lossy(data);
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() < 3 {
        return None;
    }
    Some(DiscoveredDevice {
        ip: parts[0].trim().to_string(),
        mac: Some(parts[1].trim().to_string()),
        serial_number: parts[2].trim().to_string(),
        source: DeviceSource::Wifi,
    })
}

struct Probe {
    source: DeviceSource,
    payload: &'static [u8],
    port: u16,
}

static PROBES: [Probe; 2] = [
    Probe {
        source: DeviceSource::Ethernet,
        payload: LOCALCON_PROBE,
        port: LOCALCON_PORT,
    },
    Probe {
        source: DeviceSource::Wifi,
        payload: WIFI_PROBE,
        port: WIFI_PORT,
    },
];

/// Broadcast both probe dialects from every given local address and collect
/// replies until `wait` elapses, deduplicated by serial number (first seen
/// wins). Individual probe failures are logged and contribute no devices;
/// only an empty bind address list fails the call, since that means the
/// interface enumeration collaborator gave us nothing to work with.
pub async fn discover(
    bind_addresses: &[Ipv4Addr],
    wait: Duration,
) -> Result<Vec<DiscoveredDevice>> {
    if bind_addresses.is_empty() {
        bail!("no local addresses to probe from");
    }

    let mut probes = Vec::with_capacity(bind_addresses.len() * PROBES.len());
    for &addr in bind_addresses {
        for probe in &PROBES {
            probes.push(run_probe(addr, probe, wait));
        }
    }

    let results = join_all(probes).await;
    Ok(dedup_by_serial(results.into_iter().flatten()))
}

/// First occurrence wins across every interface/dialect combination;
/// serial-less records are dropped.
pub fn dedup_by_serial(
    devices: impl IntoIterator<Item = DiscoveredDevice>,
) -> Vec<DiscoveredDevice> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| !device.serial_number.is_empty() && seen.insert(device.identity()))
        .collect()
}

async fn run_probe(bind_addr: Ipv4Addr, probe: &Probe, wait: Duration) -> Vec<DiscoveredDevice> {
    match probe_once(bind_addr, probe, wait).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("[{}] probe from {} failed: {}", probe.source, bind_addr, e);
            Vec::new()
        }
    }
}

async fn probe_once(
    bind_addr: Ipv4Addr,
    probe: &Probe,
    wait: Duration,
) -> Result<Vec<DiscoveredDevice>> {
    let socket = UdpSocket::bind((bind_addr, 0)).await?;
    socket.set_broadcast(true)?;
    let local_addr = socket.local_addr()?;
    debug!("[{}] bound to {}", probe.source, local_addr);

    socket
        .send_to(probe.payload, (Ipv4Addr::BROADCAST, probe.port))
        .await?;
    info!(
        "[{}] probe sent from {} to {}:{}",
        probe.source,
        local_addr,
        Ipv4Addr::BROADCAST,
        probe.port
    );

    // wall-clock deadline computed once; replies do not extend it
    let deadline = Instant::now() + wait;
    let mut devices = Vec::new();
    let mut seen = HashSet::new();
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (len, peer) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!("[{}] receive error: {}", probe.source, e);
                break;
            }
        };
        debug!("[{}] reply from {}: {} bytes", probe.source, peer, len);

        let decoded = match probe.source {
            DeviceSource::Ethernet => decode_localcon_reply(&buf[..len]),
            DeviceSource::Wifi => decode_wifi_reply(&buf[..len]),
        };
        let Some(device) = decoded else {
            warn!("[{}] undecodable reply from {}, skipping", probe.source, peer);
            continue;
        };
        if !device.serial_number.is_empty() && seen.insert(device.identity()) {
            devices.push(device);
        }
    }

    Ok(devices)
}
