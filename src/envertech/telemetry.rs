use crate::prelude::*;

use crate::envertech::frame::ControlCode;
use nom_derive::{Nom, Parse};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Minimum viable reply: fixed header plus trailer region.
pub const MIN_REPLY_LEN: usize = 22;
/// Panel blocks start here and repeat every [`PANEL_BLOCK_LEN`] bytes.
pub const PANEL_DATA_START: usize = 20;
pub const PANEL_BLOCK_LEN: usize = 32;

const FIRMWARE_MAJOR_OFFSET: usize = 10;
const FIRMWARE_MINOR_OFFSET: usize = 12;

// PanelBlock {{{
/// One micro-inverter module's telemetry block.
///
/// Field order (plus the skipped gap) encodes the firmware's fixed offsets
/// within the 32-byte stride; a future firmware revision with a different
/// layout is a one-struct change.
#[derive(PartialEq, Clone, Debug, Nom)]
#[nom(BigEndian)]
pub struct PanelBlock {
    #[nom(Parse = "Utils::take_module_serial")]
    pub mi_sn: [u8; 4],
    #[nom(SkipBefore(2))] // block bytes 4..6 are reserved
    #[nom(Parse = "Utils::be_u16_scale64")]
    pub input_voltage: f64,
    #[nom(Parse = "Utils::be_u16_scale512")]
    pub power: f64,
    #[nom(Parse = "Utils::be_u32_scale4")]
    pub energy: f64,
    #[nom(Parse = "Utils::be_u16_temperature")]
    pub temperature: f64,
    #[nom(Parse = "Utils::be_u16_scale512")]
    pub grid_voltage: f64,
    #[nom(Parse = "Utils::be_u16_scale128")]
    pub frequency: f64,
}

impl PanelBlock {
    /// Decode the block starting at `base`. A block that would read past the
    /// end of the buffer is absent, not an error; the caller skips it and
    /// carries on with the remaining panels.
    pub fn decode(buffer: &[u8], base: usize) -> Option<Self> {
        let block = buffer.get(base..)?;
        match PanelBlock::parse(block) {
            Ok((_, panel)) => Some(panel),
            Err(_) => None,
        }
    }

    pub fn mi_sn_hex(&self) -> String {
        self.mi_sn.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
// }}}

/// One complete telemetry read across all panels plus derived aggregates,
/// keyed `"{panel_index}_{metric}"` with `total_power`, `total_energy` and
/// `firmware_version` on top.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot(BTreeMap<String, Value>);

impl TelemetrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    fn insert(&mut self, key: String, value: Value) {
        self.0.insert(key, value);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParsedReply {
    pub snapshot: TelemetrySnapshot,
    pub panel_count: Option<usize>,
    pub control_code: Option<u16>,
}

impl ParsedReply {
    /// A reply worth handing to the caller: either telemetry values or at
    /// least a panel count. An ack (4102) or unrecognized code is neither.
    pub fn is_usable(&self) -> bool {
        !self.snapshot.is_empty() || self.panel_count.is_some()
    }
}

/// Decode a raw gateway reply. Never fails hard: malformed input yields an
/// empty snapshot and absent panel count, with the control code (when
/// readable) passed through so the caller can tell an ack from garbage.
pub fn parse(raw: &[u8]) -> ParsedReply {
    if raw.len() < MIN_REPLY_LEN {
        warn!("reply too short to parse: {} bytes", raw.len());
        return ParsedReply::default();
    }

    let control_code = Utils::be_u16(raw[4], raw[5]);
    let mut reply = ParsedReply {
        control_code: Some(control_code),
        ..Default::default()
    };

    match ControlCode::try_from(control_code) {
        Ok(ControlCode::Telemetry) => parse_telemetry(raw, &mut reply),
        Ok(ControlCode::Ack) => {
            // command acknowledged, no data to report this cycle
            debug!("gateway ack, no telemetry");
        }
        _ => {
            debug!("unrecognized control code {}", control_code);
        }
    }

    reply
}

fn parse_telemetry(raw: &[u8], reply: &mut ParsedReply) {
    // trailing bytes short of a full block are dropped, not an error
    let panel_count = (raw.len() - MIN_REPLY_LEN) / PANEL_BLOCK_LEN;
    reply.panel_count = Some(panel_count);

    let mut total_power = 0.0;
    let mut total_energy = 0.0;

    for i in 0..panel_count {
        let base = PANEL_DATA_START + i * PANEL_BLOCK_LEN;
        let Some(panel) = PanelBlock::decode(raw, base) else {
            warn!("panel {}: truncated block, skipping", i);
            continue;
        };

        let power = Utils::round(panel.power, 2);
        let energy = Utils::round(panel.energy, 2);
        total_power += power;
        total_energy += energy;

        let snapshot = &mut reply.snapshot;
        snapshot.insert(format!("{}_mi_sn", i), Value::String(panel.mi_sn_hex()));
        snapshot.insert(
            format!("{}_input_voltage", i),
            Value::from(Utils::round(panel.input_voltage, 2)),
        );
        snapshot.insert(format!("{}_power", i), Value::from(power));
        snapshot.insert(format!("{}_energy", i), Value::from(energy));
        snapshot.insert(
            format!("{}_temperature", i),
            Value::from(Utils::round(panel.temperature, 2)),
        );
        snapshot.insert(
            format!("{}_grid_voltage", i),
            Value::from(Utils::round(panel.grid_voltage, 2)),
        );
        snapshot.insert(
            format!("{}_frequency", i),
            Value::from(Utils::round(panel.frequency, 2)),
        );
    }

    reply.snapshot.insert(
        "total_power".to_string(),
        Value::from(Utils::round(total_power, 2)),
    );
    reply.snapshot.insert(
        "total_energy".to_string(),
        Value::from(Utils::round(total_energy, 2)),
    );
    reply.snapshot.insert(
        "firmware_version".to_string(),
        Value::String(format!(
            "{}/{}",
            raw[FIRMWARE_MAJOR_OFFSET], raw[FIRMWARE_MINOR_OFFSET]
        )),
    );
}
