use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32};
use nom::IResult;

/// Byte-level helpers shared by the frame builder, the telemetry parser and
/// the discovery decoders.
pub struct Utils;

impl Utils {
    /// Frame checksum: sum of all preceding bytes plus 85, truncated to one
    /// byte.
    pub fn checksum(data: &[u8]) -> u8 {
        data.iter()
            .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
            .wrapping_add(85) as u8
    }

    pub fn be_u16(b0: u8, b1: u8) -> u16 {
        u16::from(b0) << 8 | u16::from(b1)
    }

    pub fn be_u32(b0: u8, b1: u8, b2: u8, b3: u8) -> u32 {
        u32::from(b0) << 24 | u32::from(b1) << 16 | u32::from(b2) << 8 | u32::from(b3)
    }

    pub fn round(value: f64, decimal_places: i32) -> f64 {
        let factor = 10f64.powi(decimal_places);
        (value * factor).round() / factor
    }

    // Scaled big-endian field parsers for the per-panel telemetry schema.
    // The multiplier/divisor pairs are fixed by the gateway firmware; keep
    // them literal rather than reducing the fractions.

    pub fn be_u16_scale64(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, raw) = be_u16(input)?;
        Ok((input, f64::from(raw) * 64.0 / 32768.0))
    }

    pub fn be_u16_scale128(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, raw) = be_u16(input)?;
        Ok((input, f64::from(raw) * 128.0 / 32768.0))
    }

    pub fn be_u16_scale512(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, raw) = be_u16(input)?;
        Ok((input, f64::from(raw) * 512.0 / 32768.0))
    }

    pub fn be_u32_scale4(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, raw) = be_u32(input)?;
        Ok((input, f64::from(raw) * 4.0 / 32768.0))
    }

    /// Temperature is reported with a fixed -40 offset.
    pub fn be_u16_temperature(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, raw) = be_u16(input)?;
        Ok((input, f64::from(raw) * 256.0 / 32768.0 - 40.0))
    }

    pub fn take_module_serial(input: &[u8]) -> IResult<&[u8], [u8; 4]> {
        let (input, bytes) = take(4usize)(input)?;
        let mut serial = [0u8; 4];
        serial.copy_from_slice(bytes);
        Ok((input, serial))
    }
}
