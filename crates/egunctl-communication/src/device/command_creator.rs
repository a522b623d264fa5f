//! Wire command construction
//!
//! Every command is ASCII, literally `$$$<name>[<args>]\n`. The creator
//! validates arguments and never touches a transport, so a rejected
//! argument can never reach the wire.

use egunctl_core::DeviceError;
use std::fmt;

/// Highest voltage any supply or target accepts
pub const MAX_VOLTAGE: u32 = 3250;

/// Highest supply current in microamps
pub const MAX_CURRENT_MICROAMPS: u32 = 2000;

/// Highest filament current in milliamps unless protection is overridden
pub const MAX_FILAMENT_MILLIAMPS: f64 = 100.0;

/// Highest ramp step size
pub const MAX_RAMP_STEP: u32 = 200;

/// Recovery probe. Enough marker bytes to terminate any half-received
/// command on the controller, followed by an identify.
pub const PROBE: &[u8] = b"$$$$$$$$$$$$id\n";

/// One of the four high voltage supplies (1 = cathode, 2 = Wehnelt,
/// 3 = focus, 4 = auxiliary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    /// All four channels in order
    pub const ALL: [Channel; 4] = [Channel(1), Channel(2), Channel(3), Channel(4)];

    /// Validate a channel number
    pub fn new(number: u8) -> Result<Self, DeviceError> {
        if (1..=4).contains(&number) {
            Ok(Self(number))
        } else {
            Err(DeviceError::invalid(
                "channel",
                format!("has to be in range 1 to 4, got {}", number),
            ))
        }
    }

    /// Channel number, 1 to 4
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero based index
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<i64> for Channel {
    type Error = DeviceError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| {
                DeviceError::invalid("channel", format!("has to be in range 1 to 4, got {}", value))
            })
            .and_then(Channel::new)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output polarity of a supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    fn flag(self) -> char {
        match self {
            Self::Positive => 'p',
            Self::Negative => 'n',
        }
    }
}

/// Supply addressed by a limit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supply {
    Cathode,
    Wehnelt,
    Focus,
    Aux,
}

impl Supply {
    fn suffix(self) -> &'static str {
        match self {
            Self::Cathode => "k",
            Self::Wehnelt => "w",
            Self::Focus => "f",
            Self::Aux => "a",
        }
    }
}

/// Stored target voltage addressed by `setvtarget`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageTarget {
    Cathode,
    Wehnelt,
    WehneltBlank,
    Focus,
    Aux,
}

impl VoltageTarget {
    fn suffix(self) -> &'static str {
        match self {
            Self::Cathode => "vk",
            Self::Wehnelt => "vw",
            Self::WehneltBlank => "vwblank",
            Self::Focus => "vf",
            Self::Aux => "va",
        }
    }
}

/// Which limit table `setbeamcurlim`/`setinsulcurlim` writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitTable {
    Beam,
    Insulation,
}

/// Ramp timing written by `setduration*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampDuration {
    Init,
    VoltageStep,
    FilamentStep,
}

fn frame(body: impl fmt::Display) -> Vec<u8> {
    format!("$$${}\n", body).into_bytes()
}

fn check_range(param: &str, value: u32, max: u32, unit: &str) -> Result<(), DeviceError> {
    if value > max {
        return Err(DeviceError::invalid(
            param,
            format!("has to be in range from 0 to {}{}, got {}", max, unit, value),
        ));
    }
    Ok(())
}

/// Builder for controller commands
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCreator;

impl CommandCreator {
    /// Create a new command creator
    pub fn new() -> Self {
        Self
    }

    /// `$$$id\n`
    pub fn identify(&self) -> Vec<u8> {
        frame("id")
    }

    /// Recovery probe
    pub fn jabber(&self) -> Vec<u8> {
        PROBE.to_vec()
    }

    /// Read back a supply voltage
    pub fn get_voltage(&self, channel: Channel) -> Vec<u8> {
        frame(format_args!("psugetv{}", channel))
    }

    /// Read back a supply current
    pub fn get_current(&self, channel: Channel) -> Vec<u8> {
        frame(format_args!("psugeta{}", channel))
    }

    /// Query the regulation modes of all supplies
    pub fn get_modes(&self) -> Vec<u8> {
        frame("psumode")
    }

    /// Query the measured filament current
    pub fn get_filament_current(&self) -> Vec<u8> {
        frame("fila")
    }

    /// Set a supply voltage, 0 to [`MAX_VOLTAGE`] volts
    pub fn set_voltage(&self, channel: Channel, volts: u32) -> Result<Vec<u8>, DeviceError> {
        check_range("voltage", volts, MAX_VOLTAGE, "V")?;
        Ok(frame(format_args!("psusetv{}{}", channel, volts)))
    }

    /// Set a supply current limit, 0 to 2000 microamps
    pub fn set_current_microamps(
        &self,
        channel: Channel,
        microamps: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        check_range("current", microamps, MAX_CURRENT_MICROAMPS, " uA")?;
        Ok(frame(format_args!("psuseta{}{}", channel, microamps)))
    }

    /// Switch a supply's output polarity
    pub fn set_polarity(&self, channel: Channel, polarity: Polarity) -> Vec<u8> {
        frame(format_args!("psupol{}{}", channel, polarity.flag()))
    }

    /// Enable one supply
    pub fn psu_on(&self, channel: Channel) -> Vec<u8> {
        frame(format_args!("psuon{}", channel))
    }

    /// Disable one supply
    pub fn psu_off(&self, channel: Channel) -> Vec<u8> {
        frame(format_args!("psuoff{}", channel))
    }

    /// Set the filament current in milliamps, sent in 100 uA steps.
    ///
    /// Without `override_limit` the value has to be within 0 to 100 mA;
    /// with it only the lower bound is checked.
    pub fn set_filament_current(
        &self,
        milliamps: f64,
        override_limit: bool,
    ) -> Result<Vec<u8>, DeviceError> {
        let upper_ok = override_limit || milliamps <= MAX_FILAMENT_MILLIAMPS;
        if !milliamps.is_finite() || milliamps < 0.0 || !upper_ok {
            return Err(DeviceError::invalid(
                "filament current",
                format!("has to be in range 0 to 100 mA, got {}", milliamps),
            ));
        }
        let tenths = (milliamps * 10.0).round() as u64;
        Ok(frame(format_args!("setfila{}", tenths)))
    }

    /// `$$$filon\n`
    pub fn filament_on(&self) -> Vec<u8> {
        frame("filon")
    }

    /// `$$$filoff\n`
    pub fn filament_off(&self) -> Vec<u8> {
        frame("filoff")
    }

    /// Start the insulation test
    pub fn insulation_test(&self) -> Vec<u8> {
        frame("insul")
    }

    /// Ramp up the beam
    pub fn beam_on(&self) -> Vec<u8> {
        frame("beamon")
    }

    /// Switch everything off
    pub fn off(&self) -> Vec<u8> {
        frame("off")
    }

    /// Disable the controller's protection logic
    pub fn no_protection(&self) -> Vec<u8> {
        frame("noprotection")
    }

    /// Reboot the controller
    pub fn reset(&self) -> Vec<u8> {
        frame("reset")
    }

    pub fn get_target_voltages(&self) -> Vec<u8> {
        frame("getvtarget")
    }

    pub fn get_current_limits(&self, table: LimitTable) -> Vec<u8> {
        match table {
            LimitTable::Beam => frame("getbeamcurlim"),
            LimitTable::Insulation => frame("getinsulcurlim"),
        }
    }

    pub fn get_ramp_steps(&self) -> Vec<u8> {
        frame("getstepsizes")
    }

    pub fn get_ramp_durations(&self) -> Vec<u8> {
        frame("getdurations")
    }

    /// Store one target voltage
    pub fn set_target_voltage(
        &self,
        target: VoltageTarget,
        volts: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        check_range("target voltage", volts, MAX_VOLTAGE, "V")?;
        Ok(frame(format_args!("setvtarget{}{}", target.suffix(), volts)))
    }

    /// Store one current limit
    pub fn set_current_limit(
        &self,
        table: LimitTable,
        supply: Supply,
        value: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        check_range("current limit", value, MAX_VOLTAGE, "")?;
        let name = match table {
            LimitTable::Beam => "setbeamcurlim",
            LimitTable::Insulation => "setinsulcurlim",
        };
        Ok(frame(format_args!("{}{}{}", name, supply.suffix(), value)))
    }

    /// Voltage ramp step size, 0 to 200
    pub fn set_ramp_voltage_step(&self, step: u32) -> Result<Vec<u8>, DeviceError> {
        check_range("voltage step", step, MAX_RAMP_STEP, "")?;
        Ok(frame(format_args!("setstepsizev{}", step)))
    }

    /// Filament current ramp step size, 0 to 200
    pub fn set_ramp_filament_step(&self, step: u32) -> Result<Vec<u8>, DeviceError> {
        check_range("filament step", step, MAX_RAMP_STEP, "")?;
        Ok(frame(format_args!("setstepsizeila{}", step)))
    }

    /// One ramp duration, strictly positive
    pub fn set_ramp_duration(
        &self,
        which: RampDuration,
        value: f64,
    ) -> Result<Vec<u8>, DeviceError> {
        let (param, name) = match which {
            RampDuration::Init => ("init duration", "setdurationinit"),
            RampDuration::VoltageStep => ("voltage step duration", "setdurationstepv"),
            RampDuration::FilamentStep => ("filament step duration", "setdurationstepfila"),
        };
        if !value.is_finite() || value <= 0.0 {
            return Err(DeviceError::invalid(
                param,
                format!("has to be positive, got {}", value),
            ));
        }
        Ok(frame(format_args!("{}{}", name, value)))
    }

    pub fn store_settings(&self) -> Vec<u8> {
        frame("storesettings")
    }

    /// Voltage ADC calibration point (run with the supply unplugged)
    pub fn calibrate_adc_volts(&self) -> Vec<u8> {
        frame("calhvpsu")
    }

    /// Current ADC calibration point (run with the supply unplugged)
    pub fn calibrate_adc_amps(&self) -> Vec<u8> {
        frame("calhvpsuamp")
    }

    pub fn blank(&self) -> Vec<u8> {
        frame("blank")
    }

    pub fn unblank(&self) -> Vec<u8> {
        frame("unblank")
    }
}
