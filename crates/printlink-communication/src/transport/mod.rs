//! Transport layer
//!
//! The link talks to the printer through a [`Transport`]: something that
//! can be opened, written to and read from line by line, and closed and
//! reopened without tearing down the rest of the process. Reads and writes
//! happen on different threads, so implementations use interior mutability.

pub mod serial;

use printlink_core::Result;

pub use serial::{list_ports, SerialConfig, SerialPortInfo, SerialTransport};

/// Line-oriented, reopenable byte channel to the printer
pub trait Transport: Send + Sync {
    /// Human-readable port name
    fn name(&self) -> String;

    /// Open the underlying device
    fn open(&self) -> Result<()>;

    /// Close the underlying device; reads and writes fail until reopened
    fn close(&self);

    /// Whether the device is open
    fn is_open(&self) -> bool;

    /// Write one rendered payload
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Read one line without its terminator
    ///
    /// Blocks for at most the configured read timeout. `Ok(None)` means
    /// nothing complete arrived in time.
    fn read_line(&self) -> Result<Option<String>>;

    /// Reset the printer's controller
    fn reset_printer(&self) -> Result<()>;
}
