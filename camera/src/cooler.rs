//! Cooler status model shared by both vendor backends.
//!
//! Each vendor reports thermoelectric cooler state as a raw numeric code
//! with its own meaning. The codes are translated through explicit finite
//! maps; a code outside the known range becomes [`CoolerStatus::Invalid`]
//! rather than an error, because a bad status read must never kill an
//! exposure in progress.

use serde::Serialize;
use std::fmt;

// =============================================================================
// COOLER STATUS
// =============================================================================

/// Named cooler status, the union of both vendors' vocabularies.
///
/// The first eight are the Alta regulation states; the stabilization group
/// is Andor's. `Unknown` is the value before any hardware read; `Invalid`
/// marks a raw code outside the vendor's documented range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoolerStatus {
    Off,
    RampingToSetPoint,
    Correcting,
    RampingToAmbient,
    AtAmbient,
    AtMax,
    AtMin,
    AtSetPoint,
    NotStabilized,
    Stabilized,
    NotReached,
    OutOfRange,
    NotSupported,
    WasStableNowDrifting,
    Invalid,
    Unknown,
}

impl CoolerStatus {
    /// Map an Alta cooler status register value (0..=7).
    pub fn from_alta_code(code: i32) -> Self {
        match code {
            0 => CoolerStatus::Off,
            1 => CoolerStatus::RampingToSetPoint,
            2 => CoolerStatus::Correcting,
            3 => CoolerStatus::RampingToAmbient,
            4 => CoolerStatus::AtAmbient,
            5 => CoolerStatus::AtMax,
            6 => CoolerStatus::AtMin,
            7 => CoolerStatus::AtSetPoint,
            _ => CoolerStatus::Invalid,
        }
    }

    /// Map an Andor GetTemperature return status (DRV_TEMP_* family).
    pub fn from_andor_code(code: i32) -> Self {
        match code {
            20034 => CoolerStatus::Off,
            20035 => CoolerStatus::NotStabilized,
            20036 => CoolerStatus::Stabilized,
            20037 => CoolerStatus::NotReached,
            20038 => CoolerStatus::OutOfRange,
            20039 => CoolerStatus::NotSupported,
            20040 => CoolerStatus::WasStableNowDrifting,
            _ => CoolerStatus::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoolerStatus::Off => "Off",
            CoolerStatus::RampingToSetPoint => "RampingToSetPoint",
            CoolerStatus::Correcting => "Correcting",
            CoolerStatus::RampingToAmbient => "RampingToAmbient",
            CoolerStatus::AtAmbient => "AtAmbient",
            CoolerStatus::AtMax => "AtMax",
            CoolerStatus::AtMin => "AtMin",
            CoolerStatus::AtSetPoint => "AtSetPoint",
            CoolerStatus::NotStabilized => "NotStabilized",
            CoolerStatus::Stabilized => "Stabilized",
            CoolerStatus::NotReached => "NotReached",
            CoolerStatus::OutOfRange => "OutOfRange",
            CoolerStatus::NotSupported => "NotSupported",
            CoolerStatus::WasStableNowDrifting => "WasStableNowDrifting",
            CoolerStatus::Invalid => "Invalid",
            CoolerStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for CoolerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// COOLER STATE
// =============================================================================

/// Full cooler reading as refreshed from hardware.
///
/// Backends that cannot report a field (the Andor head has no heatsink
/// sensor) leave it at 0.0 rather than inventing a value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoolerState {
    /// Programmed setpoint in degC; `None` while the cooler is off.
    pub setpoint: Option<f64>,
    pub ccd_temp: f64,
    pub heatsink_temp: f64,
    /// Cooler drive level in percent.
    pub drive_level: f64,
    pub fan_level: f64,
    pub status: CoolerStatus,
}

impl Default for CoolerState {
    fn default() -> Self {
        Self {
            setpoint: None,
            ccd_temp: 0.0,
            heatsink_temp: 0.0,
            drive_level: 0.0,
            fan_level: 0.0,
            status: CoolerStatus::Unknown,
        }
    }
}

impl CoolerState {
    /// Render the comma-joined cooler status keyword value:
    /// `setpoint,ccdTemp,heatsinkTemp,drive,fan,statusText`.
    pub fn keyword_value(&self) -> String {
        let setpoint = match self.setpoint {
            Some(sp) => format!("{:.1}", sp),
            None => "None".to_string(),
        };
        format!(
            "{},{:.1},{:.1},{:.1},{:.1},{}",
            setpoint, self.ccd_temp, self.heatsink_temp, self.drive_level, self.fan_level, self.status
        )
    }
}
