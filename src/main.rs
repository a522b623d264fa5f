use anyhow::anyhow;
use clap::Parser;
use egunctl::{
    init_logging, list_ports, parse_log_level, signals, FileConfigSource, LogFormat,
    MqttBusConnector, Orchestrator, SerialDeviceConnector, BUILD_DATE, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Publishes an electron source controller on an MQTT broker
#[derive(Parser)]
#[command(name = "egun-mqtt-bridge")]
#[command(version)]
#[command(about = "MQTT bridge for the electron source controller")]
struct Cli {
    /// Configuration file for the MQTT bridge
    #[arg(long, default_value = "/etc/egunmqtt.conf")]
    config: PathBuf,

    /// Log level (trace, debug, info, warning, error)
    #[arg(long, default_value = "error", value_parser = parse_log_level)]
    log_level: tracing::Level,

    /// Log one JSON object per line
    #[arg(long)]
    log_json: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging(cli.log_level, format)?;

    if cli.list_ports {
        for port in list_ports()? {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    tracing::info!("egun-mqtt-bridge {} (built {})", VERSION, BUILD_DATE);

    let bridge = Orchestrator::new(
        Box::new(FileConfigSource::new(cli.config)),
        Arc::new(MqttBusConnector),
        Box::new(SerialDeviceConnector::new()),
    );
    signals::install(bridge.control())?;

    bridge
        .spawn()?
        .join()
        .map_err(|_| anyhow!("Bridge thread panicked"))?;
    Ok(())
}
