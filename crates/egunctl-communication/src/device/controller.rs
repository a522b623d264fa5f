//! Command layer of the electron source controller
//!
//! Each operation validates its arguments, writes the wire command,
//! records it as the last command for retransmission and, in blocking
//! mode, waits on the correlator for the reply with the operation's
//! filter key.
//!
//! Synchronous calls on one connection must be serialised by the caller;
//! the protocol cannot tell two outstanding replies of the same kind
//! apart.

use crate::communication::Transport;
use crate::device::command_creator::{
    Channel, CommandCreator, LimitTable, Polarity, RampDuration, Supply, VoltageTarget,
};
use crate::device::connection::ConnectionConfig;
use crate::device::correlator::{Correlator, RetryLink, WaitOutcome};
use egunctl_core::{
    DeviceError, DeviceEvent, PsuMode, RampDurations, RampSteps, Result, SupplyLimits,
    TargetVoltages,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Whether a call waits for the device's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Wait for the matching reply (and apply settle delays)
    Blocking,
    /// Return right after the write; replies still reach observers
    NonBlocking,
}

impl CallMode {
    fn is_blocking(self) -> bool {
        self == Self::Blocking
    }
}

/// Outcome of a command that may wait for a reply
#[derive(Debug, Clone, PartialEq)]
pub enum Response<T> {
    /// Written without waiting
    Sent,
    /// The device answered
    Value(T),
    /// The device did not answer within the retry budget
    NoResponse,
}

impl<T> Response<T> {
    /// The answer, if there is one
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// True if the device stayed silent
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse)
    }

    /// Transform the answer
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        match self {
            Self::Sent => Response::Sent,
            Self::Value(v) => Response::Value(f(v)),
            Self::NoResponse => Response::NoResponse,
        }
    }
}

/// Firmware identity reported by `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub version: String,
    pub revision: String,
}

/// Result of the insulation test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsulationResult {
    Passed,
    /// Failed on the listed channels (1-based)
    Failed(Vec<u8>),
}

/// Target voltages to store; `None` leaves a value untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetVoltageSettings {
    pub cathode: Option<u32>,
    pub wehnelt: Option<u32>,
    pub wehnelt_blank: Option<u32>,
    pub focus: Option<u32>,
    pub aux: Option<u32>,
}

/// Current limits to store; `None` leaves a value untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CurrentLimits {
    pub cathode: Option<u32>,
    pub wehnelt: Option<u32>,
    pub focus: Option<u32>,
    pub aux: Option<u32>,
}

/// Ramp durations to store; `None` leaves a value untouched
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RampDurationSettings {
    pub init: Option<f64>,
    pub voltage_step: Option<f64>,
    pub filament_step: Option<f64>,
}

/// Snapshot collected by [`CommandLayer::status`]. Fields are `None`
/// where the device did not answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub identity: Option<Identity>,
    pub voltages: [Option<i64>; 4],
    pub currents: [Option<f64>; 4],
    pub modes: Option<[PsuMode; 4]>,
    pub filament_current: Option<f64>,
}

fn unsigned(param: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        DeviceError::invalid(param, format!("has to be a non-negative integer, got {}", value))
            .into()
    })
}

fn unexpected(event: &DeviceEvent) -> egunctl_core::Error {
    DeviceError::Other {
        message: format!("unexpected reply: {}", event),
    }
    .into()
}

/// Validates, writes and correlates controller commands
pub struct CommandLayer {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    open: Arc<AtomicBool>,
    last_command: Mutex<Option<Vec<u8>>>,
    creator: CommandCreator,
    config: ConnectionConfig,
}

impl CommandLayer {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        open: Arc<AtomicBool>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            transport,
            correlator,
            open,
            last_command: Mutex::new(None),
            creator: CommandCreator::new(),
            config,
        }
    }

    /// True while the transport is usable
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Timing in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The most recently transmitted command
    pub fn last_command(&self) -> Option<Vec<u8>> {
        self.last_command.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected.into())
        }
    }

    fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn send(&self, command: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(
            "Sending {}",
            String::from_utf8_lossy(&command).trim_end()
        );
        self.transport.write_all(&command)?;
        *self.last_command.lock() = Some(command);
        Ok(())
    }

    fn request(&self, command: Vec<u8>, key: &str, mode: CallMode) -> Result<Response<DeviceEvent>> {
        self.ensure_open()?;
        if !mode.is_blocking() {
            self.send(command)?;
            return Ok(Response::Sent);
        }

        self.correlator.expect(key);
        if let Err(e) = self.send(command) {
            self.correlator.cancel();
            return Err(e);
        }
        self.await_reply()
    }

    fn await_reply(&self) -> Result<Response<DeviceEvent>> {
        match self.correlator.wait(self) {
            WaitOutcome::Reply(event) => Ok(Response::Value(event)),
            WaitOutcome::NoResponse => Ok(Response::NoResponse),
            WaitOutcome::Abandoned => Err(DeviceError::NotConnected.into()),
        }
    }

    fn query<T>(
        &self,
        command: Vec<u8>,
        key: &str,
        mode: CallMode,
        extract: impl FnOnce(&DeviceEvent) -> Option<T>,
    ) -> Result<Response<T>> {
        match self.request(command, key, mode)? {
            Response::Value(event) => extract(&event)
                .map(Response::Value)
                .ok_or_else(|| unexpected(&event)),
            Response::Sent => Ok(Response::Sent),
            Response::NoResponse => Ok(Response::NoResponse),
        }
    }

    fn channel(number: u8) -> Result<Channel> {
        Ok(Channel::new(number)?)
    }

    /// Ask the controller for its firmware identity
    pub fn identify(&self, mode: CallMode) -> Result<Response<Identity>> {
        self.query(self.creator.identify(), "id", mode, identity_of)
    }

    /// Recovery probe, answered with the identity
    pub fn jabber(&self, mode: CallMode) -> Result<Response<Identity>> {
        self.query(self.creator.jabber(), "id", mode, identity_of)
    }

    /// Measured voltage of a supply in volts
    pub fn get_voltage(&self, channel: u8, mode: CallMode) -> Result<Response<i64>> {
        let channel = Self::channel(channel)?;
        self.query(
            self.creator.get_voltage(channel),
            &format!("v{}", channel),
            mode,
            |ev| match ev {
                DeviceEvent::Voltage { value, .. } => Some(*value),
                _ => None,
            },
        )
    }

    /// Measured current of a supply in microamps
    pub fn get_current(&self, channel: u8, mode: CallMode) -> Result<Response<f64>> {
        let channel = Self::channel(channel)?;
        self.query(
            self.creator.get_current(channel),
            &format!("a{}", channel),
            mode,
            |ev| match ev {
                DeviceEvent::Current { value, .. } => Some(*value),
                _ => None,
            },
        )
    }

    /// Regulation modes of all four supplies
    pub fn get_modes(&self, mode: CallMode) -> Result<Response<[PsuMode; 4]>> {
        self.query(self.creator.get_modes(), "psustate", mode, |ev| match ev {
            DeviceEvent::PsuModes { modes } => Some(*modes),
            _ => None,
        })
    }

    /// Measured filament current
    pub fn get_filament_current(&self, mode: CallMode) -> Result<Response<f64>> {
        self.query(self.creator.get_filament_current(), "af", mode, |ev| match ev {
            DeviceEvent::FilamentCurrent { value } => Some(*value),
            _ => None,
        })
    }

    /// Set a supply voltage.
    ///
    /// Blocking mode polls the channel until it reads within the voltage
    /// tolerance of the target and then applies the stabilization delay.
    /// Convergence that takes longer than the configured bound fails with
    /// [`DeviceError::CommunicationTimeout`].
    pub fn set_voltage(&self, channel: u8, volts: i64, mode: CallMode) -> Result<Response<i64>> {
        let channel = Self::channel(channel)?;
        let volts = unsigned("voltage", volts)?;
        let command = self.creator.set_voltage(channel, volts)?;
        self.send(command)?;
        if !mode.is_blocking() {
            return Ok(Response::Sent);
        }

        let target = i64::from(volts);
        let started = Instant::now();
        let reached = loop {
            match self.get_voltage(channel.number(), CallMode::Blocking)? {
                Response::Value(v) if (v - target).abs() < self.config.voltage_tolerance => {
                    break v;
                }
                Response::Value(v) => {
                    tracing::debug!("Supply {} at {} V, waiting for {} V", channel, v, target);
                }
                _ => self.settle(self.config.convergence_poll),
            }
            if started.elapsed() > self.config.voltage_convergence_timeout {
                return Err(DeviceError::CommunicationTimeout {
                    filter: format!("v{}", channel),
                }
                .into());
            }
        };
        self.settle(self.config.stabilization_delay);
        Ok(Response::Value(reached))
    }

    /// Set a supply's current in microamps (0 to 2000)
    pub fn set_current_microamps(
        &self,
        channel: u8,
        microamps: i64,
        mode: CallMode,
    ) -> Result<Response<()>> {
        let channel = Self::channel(channel)?;
        let microamps = unsigned("current", microamps)?;
        self.send(self.creator.set_current_microamps(channel, microamps)?)?;
        if !mode.is_blocking() {
            return Ok(Response::Sent);
        }
        self.settle(self.config.stabilization_delay);
        Ok(Response::Value(()))
    }

    /// Switch a supply's polarity. Blocking mode waits for the relays.
    pub fn set_polarity(
        &self,
        channel: u8,
        polarity: Polarity,
        mode: CallMode,
    ) -> Result<Response<()>> {
        let channel = Self::channel(channel)?;
        self.send(self.creator.set_polarity(channel, polarity))?;
        if !mode.is_blocking() {
            return Ok(Response::Sent);
        }
        self.settle(self.config.polarity_settle);
        Ok(Response::Value(()))
    }

    /// Enable one supply
    pub fn psu_on(&self, channel: u8) -> Result<()> {
        let channel = Self::channel(channel)?;
        self.send(self.creator.psu_on(channel))
    }

    /// Disable one supply
    pub fn psu_off(&self, channel: u8) -> Result<()> {
        let channel = Self::channel(channel)?;
        self.send(self.creator.psu_off(channel))
    }

    /// Set the filament current in milliamps. `override_limit` lifts the
    /// 100 mA upper bound. Returns the new set point (`None` = disabled).
    pub fn set_filament_current(
        &self,
        milliamps: f64,
        override_limit: bool,
        mode: CallMode,
    ) -> Result<Response<Option<i64>>> {
        let command = self.creator.set_filament_current(milliamps, override_limit)?;
        self.query(command, "filseta", mode, filament_set_point)
    }

    /// Enable the filament supply
    pub fn filament_on(&self, mode: CallMode) -> Result<Response<Option<i64>>> {
        self.query(self.creator.filament_on(), "filseta", mode, filament_set_point)
    }

    /// Disable the filament supply. Blocking mode waits until the set
    /// point reads disabled or zero.
    pub fn filament_off(&self, mode: CallMode) -> Result<Response<Option<i64>>> {
        let mut response =
            self.query(self.creator.filament_off(), "filseta", mode, filament_set_point)?;
        loop {
            match response {
                Response::Value(Some(v)) if v != 0 => {
                    tracing::debug!("Filament set point still {}, waiting", v);
                    self.correlator.expect("filseta");
                    response = match self.await_reply()? {
                        Response::Value(event) => Response::Value(
                            filament_set_point(&event).ok_or_else(|| unexpected(&event))?,
                        ),
                        other => other.map(|_| None),
                    };
                }
                done => return Ok(done),
            }
        }
    }

    /// Run the insulation test
    pub fn run_insulation_test(&self, mode: CallMode) -> Result<Response<InsulationResult>> {
        self.query(self.creator.insulation_test(), "insulok", mode, |ev| match ev {
            DeviceEvent::InsulationOk => Some(InsulationResult::Passed),
            DeviceEvent::InsulationFailed { failed_channels } => {
                Some(InsulationResult::Failed(failed_channels.clone()))
            }
            _ => None,
        })
    }

    /// Ramp up the beam, optionally setting the filament current first
    /// (filament off, new set point, beam on)
    pub fn beam_on(&self, filament_milliamps: Option<f64>, mode: CallMode) -> Result<Response<()>> {
        if let Some(milliamps) = filament_milliamps {
            // Validate before the filament is touched
            self.creator.set_filament_current(milliamps, false)?;
            self.filament_off(mode)?;
            self.set_filament_current(milliamps, false, mode)?;
        }
        self.query(self.creator.beam_on(), "beamon", mode, |ev| {
            matches!(ev, DeviceEvent::BeamOn).then_some(())
        })
    }

    /// Switch everything off. Always waits for the off flush delay so the
    /// command leaves the serial buffer.
    pub fn off(&self, mode: CallMode) -> Result<Response<()>> {
        let response = self.query(self.creator.off(), "off", mode, |ev| {
            matches!(ev, DeviceEvent::Off).then_some(())
        })?;
        self.settle(self.config.off_flush);
        Ok(response)
    }

    /// Disable the controller's protection logic
    pub fn no_protection(&self) -> Result<()> {
        self.send(self.creator.no_protection())
    }

    /// Reboot the controller. Blocking mode waits for the reboot and
    /// returns the identity reported afterwards.
    pub fn reset(&self, mode: CallMode) -> Result<Response<Identity>> {
        self.send(self.creator.reset())?;
        if !mode.is_blocking() {
            return Ok(Response::Sent);
        }
        self.settle(self.config.reset_reboot);
        self.identify(CallMode::Blocking)
    }

    pub fn get_target_voltages(&self, mode: CallMode) -> Result<Response<TargetVoltages>> {
        self.query(self.creator.get_target_voltages(), "vtargets", mode, |ev| match ev {
            DeviceEvent::TargetVoltages(t) => Some(*t),
            _ => None,
        })
    }

    pub fn get_current_limit_beam(&self, mode: CallMode) -> Result<Response<SupplyLimits>> {
        self.query(
            self.creator.get_current_limits(LimitTable::Beam),
            "beamcurlim",
            mode,
            |ev| match ev {
                DeviceEvent::CurrentLimitBeam(l) => Some(*l),
                _ => None,
            },
        )
    }

    pub fn get_current_limit_insulation(&self, mode: CallMode) -> Result<Response<SupplyLimits>> {
        self.query(
            self.creator.get_current_limits(LimitTable::Insulation),
            "insulcurlim",
            mode,
            |ev| match ev {
                DeviceEvent::CurrentLimitInsulation(l) => Some(*l),
                _ => None,
            },
        )
    }

    pub fn get_ramp_steps(&self, mode: CallMode) -> Result<Response<RampSteps>> {
        self.query(self.creator.get_ramp_steps(), "rampsteps", mode, |ev| match ev {
            DeviceEvent::RampSteps(r) => Some(*r),
            _ => None,
        })
    }

    pub fn get_ramp_durations(&self, mode: CallMode) -> Result<Response<RampDurations>> {
        self.query(
            self.creator.get_ramp_durations(),
            "rampdurations",
            mode,
            |ev| match ev {
                DeviceEvent::RampDurations(r) => Some(*r),
                _ => None,
            },
        )
    }

    fn send_all(&self, commands: Vec<Vec<u8>>) -> Result<()> {
        for command in commands {
            self.send(command)?;
        }
        Ok(())
    }

    /// Store target voltages. All values are validated before the first
    /// write; the limits settle delay follows.
    pub fn set_target_voltages(&self, targets: &TargetVoltageSettings) -> Result<()> {
        let commands = [
            (VoltageTarget::Cathode, targets.cathode),
            (VoltageTarget::Wehnelt, targets.wehnelt),
            (VoltageTarget::WehneltBlank, targets.wehnelt_blank),
            (VoltageTarget::Focus, targets.focus),
            (VoltageTarget::Aux, targets.aux),
        ]
        .into_iter()
        .filter_map(|(target, value)| value.map(|v| self.creator.set_target_voltage(target, v)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
        self.send_all(commands)?;
        self.settle(self.config.limits_settle);
        Ok(())
    }

    fn set_current_limits(&self, table: LimitTable, limits: &CurrentLimits) -> Result<()> {
        let commands = [
            (Supply::Cathode, limits.cathode),
            (Supply::Wehnelt, limits.wehnelt),
            (Supply::Focus, limits.focus),
            (Supply::Aux, limits.aux),
        ]
        .into_iter()
        .filter_map(|(supply, value)| value.map(|v| self.creator.set_current_limit(table, supply, v)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
        self.send_all(commands)?;
        self.settle(self.config.limits_settle);
        Ok(())
    }

    /// Store the current limits used while the beam is on
    pub fn set_current_limit_beam(&self, limits: &CurrentLimits) -> Result<()> {
        self.set_current_limits(LimitTable::Beam, limits)
    }

    /// Store the current limits used during the insulation test
    pub fn set_current_limit_insulation(&self, limits: &CurrentLimits) -> Result<()> {
        self.set_current_limits(LimitTable::Insulation, limits)
    }

    pub fn set_ramp_voltage_step(&self, step: u32) -> Result<()> {
        self.send(self.creator.set_ramp_voltage_step(step)?)
    }

    pub fn set_ramp_filament_step(&self, step: u32) -> Result<()> {
        self.send(self.creator.set_ramp_filament_step(step)?)
    }

    /// Store ramp durations; every given value has to be positive
    pub fn set_ramp_durations(&self, durations: &RampDurationSettings) -> Result<()> {
        let commands = [
            (RampDuration::Init, durations.init),
            (RampDuration::VoltageStep, durations.voltage_step),
            (RampDuration::FilamentStep, durations.filament_step),
        ]
        .into_iter()
        .filter_map(|(which, value)| value.map(|v| self.creator.set_ramp_duration(which, v)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
        self.send_all(commands)
    }

    /// Persist the current settings in the controller's EEPROM
    pub fn store_settings(&self) -> Result<()> {
        self.send(self.creator.store_settings())
    }

    pub fn calibrate_adc_volts(&self) -> Result<()> {
        self.send(self.creator.calibrate_adc_volts())
    }

    pub fn calibrate_adc_amps(&self) -> Result<()> {
        self.send(self.creator.calibrate_adc_amps())
    }

    pub fn blank(&self) -> Result<()> {
        self.send(self.creator.blank())
    }

    pub fn unblank(&self) -> Result<()> {
        self.send(self.creator.unblank())
    }

    /// Collect identity, voltages, currents, modes and filament current
    /// with blocking calls
    pub fn status(&self) -> Result<DeviceStatus> {
        let mut status = DeviceStatus {
            identity: self.identify(CallMode::Blocking)?.value(),
            ..DeviceStatus::default()
        };
        for channel in Channel::ALL {
            status.voltages[channel.index()] =
                self.get_voltage(channel.number(), CallMode::Blocking)?.value();
            status.currents[channel.index()] =
                self.get_current(channel.number(), CallMode::Blocking)?.value();
        }
        status.modes = self.get_modes(CallMode::Blocking)?.value();
        status.filament_current = self.get_filament_current(CallMode::Blocking)?.value();
        Ok(status)
    }

    /// Rough beam current: cathode minus Wehnelt minus focus current.
    /// `None` if any of the three did not answer.
    pub fn estimate_beam_current(&self) -> Result<Option<f64>> {
        let mut currents = [0.0; 3];
        for (slot, channel) in currents.iter_mut().zip(1u8..) {
            match self.get_current(channel, CallMode::Blocking)?.value() {
                Some(v) => *slot = v,
                None => return Ok(None),
            }
        }
        Ok(Some(currents[0] - currents[1] - currents[2]))
    }
}

fn identity_of(event: &DeviceEvent) -> Option<Identity> {
    match event {
        DeviceEvent::Identify {
            version_date,
            version_rev,
        } => Some(Identity {
            version: version_date.clone(),
            revision: version_rev.clone(),
        }),
        _ => None,
    }
}

fn filament_set_point(event: &DeviceEvent) -> Option<Option<i64>> {
    match event {
        DeviceEvent::FilamentCurrentSet { value } => Some(*value),
        _ => None,
    }
}

impl RetryLink for CommandLayer {
    fn retransmit_last(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let Some(command) = self.last_command() else {
            return true;
        };
        match self.transport.write_all(&command) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Retransmission failed: {}", e);
                false
            }
        }
    }

    fn send_probe(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.transport.write_all(&self.creator.jabber()) {
            tracing::warn!("Recovery probe failed: {}", e);
        }
    }
}
