//! # egunctl Core
//!
//! Core types shared by the electron source controller crates:
//! the device event model, the observer registry that fans events out to
//! interested parties, and the error taxonomy of the device link.

pub mod error;
pub mod event;
pub mod observers;
pub mod types;

pub use error::{ConnectionError, DeviceError, Error, Result};

pub use event::{
    DeviceEvent, EventKind, PsuMode, RampDurations, RampSteps, SupplyLimits, TargetVoltages,
};

pub use observers::{Observer, ObserverHandle, ObserverRegistry};

pub use types::{thread_safe_rw, ThreadSafeRw};
