//! Serial port transport
//!
//! Talks to the printer over USB or a UART using the `serialport` crate. The
//! port handle is cloned once opened: the reader thread owns one half, the
//! queue writes through the other, so a blocking read never delays a write.
//! Closing never waits for a read in progress; the read half is dropped by
//! the reader once its current read returns.

use parking_lot::Mutex;
use printlink_core::{ConnectionError, Error, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::Transport;

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyACM0` or `COM3`
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout of one `read_line` call
    pub read_timeout: Duration,
    /// Delay between reopen attempts while the port is closed
    pub reopen_interval: Duration,
    /// How long DTR is held low when resetting the printer
    pub dtr_pulse: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(2),
            reopen_interval: Duration::from_secs(1),
            dtr_pulse: Duration::from_millis(100),
        }
    }
}

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,
    /// Port description (e.g., "USB Prusa Research Original Prusa i3 MK3")
    pub description: String,
    /// USB serial number if available
    pub serial_number: Option<String>,
    /// USB vendor ID if applicable
    pub vid: Option<u16>,
    /// USB product ID if applicable
    pub pid: Option<u16>,
}

/// List serial ports a printer could be attached to
///
/// Keeps USB CDC/serial adapters, Raspberry Pi UARTs and Windows COM ports.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_printer_port(&port.port_name))
        .map(|port| match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => SerialPortInfo {
                port_name: port.port_name.clone(),
                description: format!(
                    "USB {} {}",
                    usb.manufacturer.as_deref().unwrap_or("Device"),
                    usb.product.as_deref().unwrap_or("Serial Port")
                ),
                serial_number: usb.serial_number.clone(),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            },
            _ => SerialPortInfo {
                port_name: port.port_name.clone(),
                description: "Serial Port".to_string(),
                serial_number: None,
                vid: None,
                pid: None,
            },
        })
        .collect())
}

fn is_printer_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }
    ["/dev/ttyACM", "/dev/ttyUSB", "/dev/ttyAMA", "/dev/cu.usbmodem"]
        .iter()
        .any(|prefix| port_name.starts_with(prefix))
}

struct ReadHalf {
    port: BufReader<Box<dyn serialport::SerialPort>>,
    partial: Vec<u8>,
}

/// [`Transport`] over a local serial port
pub struct SerialTransport {
    config: SerialConfig,
    writer: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    reader: Mutex<Option<ReadHalf>>,
    read_half_stale: AtomicBool,
}

impl SerialTransport {
    /// Create a closed transport
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            read_half_stale: AtomicBool::new(false),
        }
    }

    /// The port settings
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn not_open(&self) -> Error {
        ConnectionError::NotOpen {
            port: self.config.port.clone(),
        }
        .into()
    }

    fn open_error(&self, e: serialport::Error) -> Error {
        let port = self.config.port.clone();
        match e.kind() {
            serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound { port }.into(),
            _ => ConnectionError::FailedToOpen {
                port,
                reason: e.to_string(),
            }
            .into(),
        }
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.config.port.clone()
    }

    fn open(&self) -> Result<()> {
        let writer = serialport::new(&self.config.port, self.config.baud_rate)
            .timeout(self.config.read_timeout)
            .open()
            .map_err(|e| self.open_error(e))?;
        let reader = writer.try_clone().map_err(|e| self.open_error(e))?;

        self.read_half_stale.store(false, Ordering::SeqCst);
        *self.writer.lock() = Some(writer);
        *self.reader.lock() = Some(ReadHalf {
            port: BufReader::new(reader),
            partial: Vec::new(),
        });
        tracing::info!(
            "Opened {} at {} baud",
            self.config.port,
            self.config.baud_rate
        );
        Ok(())
    }

    fn close(&self) {
        let was_open = self.writer.lock().take().is_some();
        match self.reader.try_lock() {
            Some(mut reader) => {
                reader.take();
            }
            None => self.read_half_stale.store(true, Ordering::SeqCst),
        }
        if was_open {
            tracing::info!("Closed {}", self.config.port);
        }
    }

    fn is_open(&self) -> bool {
        self.writer.lock().is_some()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let port = writer.as_mut().ok_or_else(|| self.not_open())?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read_line(&self) -> Result<Option<String>> {
        let mut reader = self.reader.lock();
        if self.read_half_stale.swap(false, Ordering::SeqCst) {
            reader.take();
        }
        let half = reader.as_mut().ok_or_else(|| self.not_open())?;

        match half.port.read_until(b'\n', &mut half.partial) {
            Ok(0) => Err(ConnectionError::ConnectionLost {
                reason: "end of stream".to_string(),
            }
            .into()),
            Ok(_) if half.partial.ends_with(b"\n") => {
                let raw = std::mem::take(&mut half.partial);
                let line = String::from_utf8_lossy(&raw);
                Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_printer(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let port = writer.as_mut().ok_or_else(|| self.not_open())?;
        let to_error = |e: serialport::Error| ConnectionError::SerialError {
            reason: e.to_string(),
        };
        tracing::info!("Resetting the printer on {} using DTR", self.config.port);
        port.write_data_terminal_ready(false).map_err(to_error)?;
        std::thread::sleep(self.config.dtr_pulse);
        port.write_data_terminal_ready(true).map_err(to_error)?;
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printer_port_patterns() {
        assert!(is_printer_port("/dev/ttyACM0"));
        assert!(is_printer_port("/dev/ttyAMA0"));
        assert!(is_printer_port("COM3"));
        assert!(!is_printer_port("COM"));
        assert!(!is_printer_port("/dev/ttyS0"));
    }

    #[test]
    fn test_closed_transport() {
        let transport = SerialTransport::new(SerialConfig {
            port: "/dev/printlink-does-not-exist".to_string(),
            ..Default::default()
        });
        assert!(!transport.is_open());
        assert!(transport.write(b"M105\n").is_err());
        assert!(transport.read_line().is_err());
        assert!(transport.open().is_err());
    }

    #[test]
    fn test_close_does_not_wait_for_reader() {
        let transport = SerialTransport::new(SerialConfig::default());
        let held = transport.reader.lock();
        transport.close();
        assert!(transport.read_half_stale.load(Ordering::SeqCst));
        drop(held);

        assert!(transport.read_line().is_err());
        assert!(!transport.read_half_stale.load(Ordering::SeqCst));
    }
}
