//! # egunctl Communication
//!
//! Device communication engine for the electron source controller:
//! - transports (serial line, simulated device)
//! - receive ring buffer and frame decoder
//! - reply parser, message dispatcher and synchronous request correlator
//! - the command layer and the connection that owns all of the above

pub mod communication;
pub mod device;

pub use communication::{
    frame_decoder::{FrameDecoder, SYNC_BYTE, SYNC_MARKER, TERMINATOR},
    ring_buffer::{OverflowPolicy, PushOutcome, RingBuffer, DEFAULT_CAPACITY},
    serial::{list_ports, SerialPortInfo, SerialTransport},
    simulated::{Responder, SimulatedTransport},
    ConnectionParams, ReadOutcome, SerialParity, Transport,
};

pub use device::{
    command_creator::{
        Channel, CommandCreator, LimitTable, Polarity, RampDuration, Supply, VoltageTarget,
        MAX_CURRENT_MICROAMPS, MAX_FILAMENT_MILLIAMPS, MAX_VOLTAGE, PROBE,
    },
    connection::{Connection, ConnectionConfig},
    controller::{
        CallMode, CommandLayer, CurrentLimits, DeviceStatus, Identity, InsulationResult,
        RampDurationSettings, Response, TargetVoltageSettings,
    },
    correlator::{Correlator, CorrelatorConfig, RetryLink, WaitOutcome, BEAM_ON_KEY},
    dispatcher::MessageDispatcher,
    response_parser::ResponseParser,
};
