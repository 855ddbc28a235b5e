use crate::prelude::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const FRAME_START: u8 = 0x68;
pub const FRAME_END: u8 = 0x16;

/// 16-bit command/response selector carried in bytes 4-5 of every frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlCode {
    DataRequest = 4215,  // 0x1077
    Break = 4161,        // 0x1041
    PowerControl = 4407, // 0x1137
    Telemetry = 4177,    // 0x1051
    Ack = 4102,          // 0x1006, command recognized but no data
}

// Serial {{{
/// Gateway identifier: 4 raw bytes, written as 8 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Serial([u8; 4]);

impl Serial {
    pub fn data(&self) -> [u8; 4] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl From<[u8; 4]> for Serial {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl std::str::FromStr for Serial {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex_id(s)
            .ok_or_else(|| anyhow!("serial must be exactly 8 hex characters, got {:?}", s))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for Serial {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Serial {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
// }}}

fn decode_hex_id(id: &str) -> Option<[u8; 4]> {
    if id.len() != 8 || !id.is_ascii() {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, pair) in id.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(pair).ok()?;
        bytes[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(bytes)
}

/// Build a protocol-compliant gateway command.
///
/// Layout: `[0x68][len:2][0x68][control_code:2][device_id:4][payload]
/// [padding][checksum][0x16]`, where the length field counts the whole
/// frame and the checksum covers every byte before it.
///
/// Returns an empty vec (with a logged diagnostic) when the device id is
/// not exactly 8 hex characters; a single bad command must never abort a
/// polling session.
pub fn build_command(
    device_id_hex: &str,
    control_code: u16,
    payload: &[u8],
    payload_padding: usize,
) -> Vec<u8> {
    let Some(device_id) = decode_hex_id(device_id_hex) else {
        error!(
            "device id must be exactly 8 hex characters, got {:?}",
            device_id_hex
        );
        return Vec::new();
    };

    let mut data = Vec::with_capacity(12 + payload.len() + payload_padding);
    data.push(FRAME_START);
    data.push(0x00); // length placeholder
    data.push(0x00);
    data.push(FRAME_START);
    data.extend_from_slice(&control_code.to_be_bytes());
    data.extend_from_slice(&device_id);
    data.extend_from_slice(payload);
    data.resize(data.len() + payload_padding, 0x00);

    // total length includes the checksum and end marker still to come
    let total_length = (data.len() + 2) as u16;
    data[1] = (total_length >> 8) as u8;
    data[2] = total_length as u8;

    let checksum = Utils::checksum(&data);
    data.push(checksum);
    data.push(FRAME_END);
    data
}

pub fn build_data_request(serial: &Serial) -> Vec<u8> {
    build_command(&serial.to_hex(), ControlCode::DataRequest.into(), &[], 20)
}

pub fn build_break_command(serial: &Serial) -> Vec<u8> {
    build_command(&serial.to_hex(), ControlCode::Break.into(), &[], 10)
}

pub fn build_power_control(serial: &Serial, level: u8) -> Vec<u8> {
    build_command(
        &serial.to_hex(),
        ControlCode::PowerControl.into(),
        &[level],
        0,
    )
}
