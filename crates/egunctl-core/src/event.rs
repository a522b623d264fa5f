//! Device event model
//!
//! Every frame decoded from the controller is classified into a
//! [`DeviceEvent`]. Events are produced only by the message dispatcher and
//! consumed by observers and by the synchronous request correlator, which
//! matches them through their filter key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode of one high voltage supply as reported by `psustate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsuMode {
    /// Supply disabled (`-`)
    Off,
    /// Constant current regulation (`C`)
    Current,
    /// Constant voltage regulation (any other character)
    Voltage,
}

impl PsuMode {
    /// Decode one mode character of a `psustate` reply
    pub fn from_flag(flag: char) -> Self {
        match flag {
            '-' => Self::Off,
            'C' => Self::Current,
            _ => Self::Voltage,
        }
    }
}

impl fmt::Display for PsuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Current => write!(f, "current"),
            Self::Voltage => write!(f, "voltage"),
        }
    }
}

/// Target voltages stored on the controller (`vtargets`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetVoltages {
    pub cathode: f64,
    pub wehnelt: f64,
    pub wehnelt_blank: f64,
    pub focus: f64,
}

/// Per-supply current limits (`beamcurlim`, `insulcurlim`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupplyLimits {
    pub cathode: f64,
    pub wehnelt: f64,
    pub focus: f64,
    pub aux: f64,
}

/// Ramp step sizes (`rampsteps`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampSteps {
    pub volts: f64,
    pub filament_amps: f64,
}

/// Ramp step durations (`rampdurations`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RampDurations {
    pub voltage_step: f64,
    pub filament_step: f64,
    pub init: f64,
}

/// A classified reply from the electron source controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Response to `$$$id`: `electronctrl_<date>_<rev>`
    Identify {
        version_date: String,
        version_rev: String,
    },
    /// Beam has been switched on
    BeamOn,
    /// Insulation test passed
    InsulationOk,
    /// Insulation test failed on the listed channels (1-based)
    InsulationFailed { failed_channels: Vec<u8> },
    /// Measured voltage of a supply channel in volts
    Voltage { channel: u8, value: i64 },
    /// Measured current of a supply channel in microamps
    Current { channel: u8, value: f64 },
    /// Measured filament current
    FilamentCurrent { value: f64 },
    /// Regulation modes of all four supplies
    PsuModes { modes: [PsuMode; 4] },
    /// Filament current set point; `None` when the filament is disabled
    FilamentCurrentSet { value: Option<i64> },
    /// Controller switched everything off
    Off,
    /// Raw ADC reading of the first converter channel
    AdcRaw { value: f64 },
    /// Stored target voltages
    TargetVoltages(TargetVoltages),
    /// Current limits used while the beam is on
    CurrentLimitBeam(SupplyLimits),
    /// Current limits used during the insulation test
    CurrentLimitInsulation(SupplyLimits),
    /// Ramp step sizes
    RampSteps(RampSteps),
    /// Ramp step durations
    RampDurations(RampDurations),
    /// Anything not recognised
    Unknown { raw: String },
}

/// Discriminant of [`DeviceEvent`], used to key observer lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Identify,
    BeamOn,
    InsulationOk,
    InsulationFailed,
    Voltage,
    Current,
    FilamentCurrent,
    PsuModes,
    FilamentCurrentSet,
    Off,
    AdcRaw,
    TargetVoltages,
    CurrentLimitBeam,
    CurrentLimitInsulation,
    RampSteps,
    RampDurations,
    Unknown,
}

impl DeviceEvent {
    /// The kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Identify { .. } => EventKind::Identify,
            Self::BeamOn => EventKind::BeamOn,
            Self::InsulationOk => EventKind::InsulationOk,
            Self::InsulationFailed { .. } => EventKind::InsulationFailed,
            Self::Voltage { .. } => EventKind::Voltage,
            Self::Current { .. } => EventKind::Current,
            Self::FilamentCurrent { .. } => EventKind::FilamentCurrent,
            Self::PsuModes { .. } => EventKind::PsuModes,
            Self::FilamentCurrentSet { .. } => EventKind::FilamentCurrentSet,
            Self::Off => EventKind::Off,
            Self::AdcRaw { .. } => EventKind::AdcRaw,
            Self::TargetVoltages(_) => EventKind::TargetVoltages,
            Self::CurrentLimitBeam(_) => EventKind::CurrentLimitBeam,
            Self::CurrentLimitInsulation(_) => EventKind::CurrentLimitInsulation,
            Self::RampSteps(_) => EventKind::RampSteps,
            Self::RampDurations(_) => EventKind::RampDurations,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Filter key a synchronous caller waits on to receive this event.
    ///
    /// Both insulation outcomes share the `insulok` key. Unknown messages
    /// never satisfy a wait.
    pub fn filter_key(&self) -> Option<String> {
        let key = match self {
            Self::Identify { .. } => "id".to_string(),
            Self::BeamOn => "beamon".to_string(),
            Self::InsulationOk | Self::InsulationFailed { .. } => "insulok".to_string(),
            Self::Voltage { channel, .. } => format!("v{}", channel),
            Self::Current { channel, .. } => format!("a{}", channel),
            Self::FilamentCurrent { .. } => "af".to_string(),
            Self::PsuModes { .. } => "psustate".to_string(),
            Self::FilamentCurrentSet { .. } => "filseta".to_string(),
            Self::Off => "off".to_string(),
            Self::AdcRaw { .. } => "adc0".to_string(),
            Self::TargetVoltages(_) => "vtargets".to_string(),
            Self::CurrentLimitBeam(_) => "beamcurlim".to_string(),
            Self::CurrentLimitInsulation(_) => "insulcurlim".to_string(),
            Self::RampSteps(_) => "rampsteps".to_string(),
            Self::RampDurations(_) => "rampdurations".to_string(),
            Self::Unknown { .. } => return None,
        };
        Some(key)
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identify {
                version_date,
                version_rev,
            } => write!(f, "Identify: {} (rev. {})", version_date, version_rev),
            Self::BeamOn => write!(f, "Beam on"),
            Self::InsulationOk => write!(f, "Insulation ok"),
            Self::InsulationFailed { failed_channels } => {
                write!(f, "Insulation failed on {:?}", failed_channels)
            }
            Self::Voltage { channel, value } => write!(f, "Voltage {}: {} V", channel, value),
            Self::Current { channel, value } => write!(f, "Current {}: {:.1} uA", channel, value),
            Self::FilamentCurrent { value } => write!(f, "Filament current: {}", value),
            Self::PsuModes { modes } => write!(
                f,
                "PSU modes: {} {} {} {}",
                modes[0], modes[1], modes[2], modes[3]
            ),
            Self::FilamentCurrentSet { value: Some(v) } => write!(f, "Filament set point: {}", v),
            Self::FilamentCurrentSet { value: None } => write!(f, "Filament disabled"),
            Self::Off => write!(f, "Off"),
            Self::AdcRaw { value } => write!(f, "ADC0: {}", value),
            Self::TargetVoltages(t) => write!(f, "Target voltages: {:?}", t),
            Self::CurrentLimitBeam(l) => write!(f, "Beam current limits: {:?}", l),
            Self::CurrentLimitInsulation(l) => write!(f, "Insulation current limits: {:?}", l),
            Self::RampSteps(r) => write!(f, "Ramp steps: {:?}", r),
            Self::RampDurations(r) => write!(f, "Ramp durations: {:?}", r),
            Self::Unknown { raw } => write!(f, "Unknown message: {}", raw),
        }
    }
}
