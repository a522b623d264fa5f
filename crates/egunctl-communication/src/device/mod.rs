//! Electron source controller protocol
//!
//! Reply classification and dispatch, the single-slot request correlator,
//! wire command construction, the command layer and the connection that
//! owns the reader thread.

pub mod command_creator;
pub mod connection;
pub mod controller;
pub mod correlator;
pub mod dispatcher;
pub mod response_parser;
