//! Serial port transport
//!
//! Provides the serial line connection to the electron source controller
//! (USB-serial adapter or RS-232) and port discovery.
//!
//! The port is opened once and cloned: the reader thread owns the clone for
//! blocking single-byte reads, while command writes go through a separately
//! locked handle, so a write never waits for a pending read.

use crate::communication::{ConnectionParams, ReadOutcome, SerialParity, Transport};
use egunctl_core::{ConnectionError, Error, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyU0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set serial number
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports the controller may be attached to
///
/// Filters to USB-serial style devices:
/// - FreeBSD: /dev/ttyU*, /dev/cuaU*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
/// - Windows: COM*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => {
            let port_infos: Vec<SerialPortInfo> = ports
                .iter()
                .filter(|port| is_candidate_port(&port.port_name))
                .map(|port| {
                    let info = SerialPortInfo::new(&port.port_name, get_port_description(port));

                    match &port.port_type {
                        serialport::SerialPortType::UsbPort(usb_info) => {
                            let mut info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                            if let Some(ref mfg) = usb_info.manufacturer {
                                info = info.with_manufacturer(mfg);
                            }
                            if let Some(ref serial) = usb_info.serial_number {
                                info = info.with_serial_number(serial);
                            }
                            info
                        }
                        _ => info,
                    }
                })
                .collect();

            Ok(port_infos)
        }
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(Error::other(format!("Failed to enumerate ports: {}", e)))
        }
    }
}

fn is_candidate_port(port_name: &str) -> bool {
    if let Some(rest) = port_name.strip_prefix("COM") {
        return !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit());
    }

    const PREFIXES: [&str; 6] = [
        "/dev/ttyU",
        "/dev/cuaU",
        "/dev/ttyACM",
        "/dev/ttyUSB",
        "/dev/cu.usbserial-",
        "/dev/cu.usbmodem",
    ];
    PREFIXES.iter().any(|p| port_name.starts_with(p))
}

fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

/// Serial line transport backed by the `serialport` crate
pub struct SerialTransport {
    name: String,
    reader: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    writer: Mutex<Option<Box<dyn serialport::SerialPort>>>,
}

impl SerialTransport {
    /// Open a serial port with the given parameters
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        let data_bits = match params.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(ConnectionError::InvalidParameters {
                    reason: format!("Invalid data bits: {}", other),
                }
                .into())
            }
        };
        let stop_bits = match params.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(ConnectionError::InvalidParameters {
                    reason: format!("Invalid stop bits: {}", other),
                }
                .into())
            }
        };

        let builder = serialport::new(&params.port, params.baud_rate)
            .timeout(params.read_timeout)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(to_serialport_parity(params.parity))
            .flow_control(if params.flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            });

        let writer = builder.open().map_err(|e| {
            tracing::warn!("Failed to open serial port {}: {}", params.port, e);
            ConnectionError::FailedToOpen {
                port: params.port.clone(),
                reason: e.to_string(),
            }
        })?;
        let reader = writer.try_clone().map_err(|e| ConnectionError::FailedToOpen {
            port: params.port.clone(),
            reason: format!("cannot clone port handle: {}", e),
        })?;

        tracing::info!(
            "Opened serial port {} at {} baud",
            params.port,
            params.baud_rate
        );

        Ok(Self {
            name: params.port.clone(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }
}

impl Transport for SerialTransport {
    fn read_byte(&self) -> ReadOutcome {
        let mut guard = self.reader.lock();
        let Some(port) = guard.as_mut() else {
            return ReadOutcome::Closed;
        };

        let mut byte = [0u8; 1];
        match port.read(&mut byte) {
            Ok(1) => ReadOutcome::Byte(byte[0]),
            Ok(_) => ReadOutcome::Closed,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => ReadOutcome::Idle,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Idle,
            Err(e) => {
                tracing::debug!("Serial read on {} ended: {}", self.name, e);
                ReadOutcome::Closed
            }
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or_else(|| ConnectionError::ConnectionLost {
            reason: format!("{} is closed", self.name),
        })?;

        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| ConnectionError::SerialError {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn close(&self) {
        self.writer.lock().take();
        self.reader.lock().take();
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
