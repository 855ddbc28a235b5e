#![allow(dead_code)]

use envertech_bridge::envertech::telemetry::{PANEL_BLOCK_LEN, PANEL_DATA_START};

pub const DEVICE_ID: &str = "30800000";

// field offsets within one panel block
pub const OFF_MI_SN: usize = 0;
pub const OFF_INPUT_VOLTAGE: usize = 6;
pub const OFF_POWER: usize = 8;
pub const OFF_ENERGY: usize = 10;
pub const OFF_TEMPERATURE: usize = 14;
pub const OFF_GRID_VOLTAGE: usize = 16;
pub const OFF_FREQUENCY: usize = 18;

pub struct Factory;

impl Factory {
    /// Telemetry reply (control code 4177) with `panels` full blocks and
    /// `extra` trailing bytes; firmware version bytes set to 5 and 7.
    pub fn telemetry_reply(panels: usize, extra: usize) -> Vec<u8> {
        let mut raw = vec![0u8; 22 + panels * PANEL_BLOCK_LEN + extra];
        raw[0] = 0x68;
        raw[4] = 0x10;
        raw[5] = 0x51;
        raw[10] = 5;
        raw[12] = 7;
        raw
    }

    /// Bare ack reply (control code 4102).
    pub fn ack_reply() -> Vec<u8> {
        let mut raw = vec![0u8; 22];
        raw[0] = 0x68;
        raw[4] = 0x10;
        raw[5] = 0x06;
        raw
    }
}

pub fn panel_base(i: usize) -> usize {
    PANEL_DATA_START + i * PANEL_BLOCK_LEN
}

pub fn put_u16(raw: &mut [u8], offset: usize, value: u16) {
    raw[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn put_u32(raw: &mut [u8], offset: usize, value: u32) {
    raw[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
