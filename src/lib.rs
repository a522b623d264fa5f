//! # egunctl
//!
//! Host-side control of an electron source controller and an MQTT bridge
//! that publishes it on a message bus.
//!
//! ## Architecture
//!
//! egunctl is organized as a workspace with multiple crates:
//!
//! 1. **egunctl-core** - Device events, observer registry, errors
//! 2. **egunctl-communication** - Serial transport, framing, correlation, command layer
//! 3. **egunctl-settings** - Bridge configuration loading and validation
//! 4. **egunctl-bridge** - MQTT client, command queue and supervising loop
//! 5. **egunctl** - The `egun-mqtt-bridge` daemon binary

pub mod signals;

pub use egunctl_bridge::{
    BridgeState, ControlHandle, MqttBusConnector, Orchestrator, SerialDeviceConnector,
};
pub use egunctl_communication::{list_ports, CallMode, Connection, ConnectionParams};
pub use egunctl_core::{Error, Result};
pub use egunctl_settings::{BridgeConfig, FileConfigSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Output format of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, multi-line
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Parse a log level name. Accepts the tracing names plus `warning` and
/// `critical`.
pub fn parse_log_level(name: &str) -> std::result::Result<tracing::Level, String> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Ok(tracing::Level::TRACE),
        "debug" => Ok(tracing::Level::DEBUG),
        "info" => Ok(tracing::Level::INFO),
        "warn" | "warning" => Ok(tracing::Level::WARN),
        "error" | "critical" => Ok(tracing::Level::ERROR),
        _ => Err(format!("Unknown log level {}", name.to_ascii_uppercase())),
    }
}

/// Initialize logging
///
/// Sets up structured logging with:
/// - Output on stderr, pretty or JSON
/// - `level` as the default, RUST_LOG directives on top
/// - Thread names, since the bridge runs on several threads
pub fn init_logging(level: tracing::Level, format: LogFormat) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_thread_names(true)
                .with_line_number(true)
                .pretty();
            registry
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .json();
            registry
                .with(fmt_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug"), Ok(tracing::Level::DEBUG));
        assert_eq!(parse_log_level("WARNING"), Ok(tracing::Level::WARN));
        assert_eq!(parse_log_level("critical"), Ok(tracing::Level::ERROR));
        assert_eq!(
            parse_log_level("loud"),
            Err("Unknown log level LOUD".to_string())
        );
    }

    #[test]
    fn test_build_info() {
        assert!(!VERSION.is_empty());
        assert!(BUILD_DATE.ends_with("UTC"));
    }
}
