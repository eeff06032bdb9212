//! Runtime camera controls and the liquid-lens serial protocol

use serde::{Deserialize, Serialize};

/// Lowest focus voltage the lens driver accepts
pub const LENS_MIN_VOLTAGE: f64 = 24.0;
/// Highest focus voltage the lens driver accepts
pub const LENS_MAX_VOLTAGE: f64 = 70.0;

const STX: u8 = 0x02;
const CMD_SET_FOCAL_POWER: u8 = 0x37;
const LENS_ADDRESS: u8 = 0x00;
const PAYLOAD_LEN: u8 = 0x02;

/// Acquisition modes understood by GenICam devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcquisitionMode {
    #[default]
    Continuous,
    SingleFrame,
    MultiFrame,
}

/// Sensor binning factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub dx: u32,
    pub dy: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { dx: 1, dy: 1 }
    }
}

/// Features that can be written while a device is open
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Gain(f64),
    /// Exposure time in microseconds
    ExposureTime(f64),
    AutoExposure(bool),
    FrameRate(f64),
    /// 3.3 V supply for the liquid lens
    LensPower(bool),
    /// Route the serial port to the lens line at the given baud rate (e.g. "Baud57600")
    LensSerial { baud_rate: String },
}

impl Control {
    /// GenICam feature name the control maps to
    pub fn feature_name(&self) -> &'static str {
        match self {
            Control::Gain(_) => "Gain",
            Control::ExposureTime(_) => "ExposureTime",
            Control::AutoExposure(_) => "ExposureAuto",
            Control::FrameRate(_) => "AcquisitionFrameRate",
            Control::LensPower(_) => "V3_3Enable",
            Control::LensSerial { .. } => "SerialPortBaudRate",
        }
    }
}

/// Clamp a focus voltage to the lens driver's range
pub fn clamp_focus_voltage(voltage: f64) -> f64 {
    voltage.clamp(LENS_MIN_VOLTAGE, LENS_MAX_VOLTAGE)
}

/// Encode a "set focal power" command for the lens driver
///
/// The value is millivolts above the minimum, little-endian, followed by a
/// checksum that is the wrapping sum of all preceding bytes.
pub fn focus_packet(voltage: f64) -> [u8; 7] {
    let volts = clamp_focus_voltage(voltage);
    let raw = ((volts - LENS_MIN_VOLTAGE) * 1000.0) as u16;
    let [lo, hi] = raw.to_le_bytes();

    let mut packet = [STX, CMD_SET_FOCAL_POWER, LENS_ADDRESS, PAYLOAD_LEN, lo, hi, 0];
    packet[6] = packet[..6].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_packet_minimum() {
        assert_eq!(focus_packet(24.0), [0x02, 0x37, 0x00, 0x02, 0x00, 0x00, 0x3B]);
    }

    #[test]
    fn test_focus_packet_value() {
        // 30 V -> 6000 mV above minimum = 0x1770
        let packet = focus_packet(30.0);
        assert_eq!(&packet[4..6], &[0x70, 0x17]);
        assert_eq!(packet[6], 0x02u8.wrapping_add(0x37 + 0x02 + 0x70 + 0x17));
    }

    #[test]
    fn test_focus_voltage_is_clamped() {
        assert_eq!(focus_packet(5.0), focus_packet(LENS_MIN_VOLTAGE));
        assert_eq!(focus_packet(120.0), focus_packet(LENS_MAX_VOLTAGE));
        // 46 V span -> 46000 = 0xB3B0
        assert_eq!(&focus_packet(120.0)[4..6], &[0xB0, 0xB3]);
    }

    #[test]
    fn test_feature_names() {
        assert_eq!(Control::Gain(2.0).feature_name(), "Gain");
        assert_eq!(Control::AutoExposure(true).feature_name(), "ExposureAuto");
    }
}
