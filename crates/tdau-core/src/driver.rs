//! Driver traits for bench hardware.
//!
//! Sessions in `tdau-hardware` own a boxed driver and never talk to a port
//! directly, so a board or a bath can be swapped for another protocol or for an
//! in-memory simulation without touching the sequencing code.
//!
//! ```text
//! ┌──────────────┐  owns   ┌──────────────────────┐
//! │ DeviceSession│────────▶│ Box<dyn DeviceDriver>│──▶ TdauSerialDriver | MockTdau
//! └──────────────┘         └──────────────────────┘
//! ┌──────────────┐  owns   ┌──────────────────────┐
//! │ BathSession  │────────▶│ Box<dyn BathDriver>  │──▶ BathSerialDriver | MockBath
//! └──────────────┘         └──────────────────────┘
//! ```
//!
//! Every method reports failures as [`DriverError`]; sessions map them to
//! [`crate::BenchError::Connection`].

use crate::error::DriverError;
use async_trait::async_trait;

/// Firmware revision reported by a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Command surface of a TDAU measurement board.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Short protocol name used in errors and logs.
    fn driver_type(&self) -> &'static str;

    /// Open the transport to `address`.
    async fn connect(&mut self, address: &str) -> Result<(), DriverError>;

    /// Release the transport. Must tolerate being called when already closed.
    async fn disconnect(&mut self) -> Result<(), DriverError>;

    /// Read `count` bytes of device memory, in memory order.
    async fn read_memory(&self, address: u16, count: u8) -> Result<Vec<u8>, DriverError>;

    /// Read a 4-byte register as a big-endian hex word.
    async fn read_register_word(&self, address: u16) -> Result<String, DriverError> {
        let bytes = self.read_memory(address, 4).await?;
        let word: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
            DriverError::new(
                self.driver_type(),
                crate::DriverErrorKind::Communication,
                format!("expected 4 bytes at 0x{:04X}, got {}", address, bytes.len()),
            )
        })?;
        Ok(crate::codec::register_hex_from_le_bytes(word))
    }

    /// Write a single byte of device memory.
    async fn write_memory(&self, address: u16, value: u8) -> Result<(), DriverError>;

    async fn extended_calibration(&self) -> Result<(), DriverError>;

    /// Small-current-offset calibration.
    async fn sco_calibration(&self) -> Result<(), DriverError>;

    async fn serial_number(&self) -> Result<u32, DriverError>;

    async fn firmware_version(&self) -> Result<FirmwareVersion, DriverError>;
}

/// Command surface of a temperature bath.
///
/// The bath speaks a line protocol; parsing the reading out of the reply line is
/// left to the session.
#[async_trait]
pub trait BathDriver: Send + Sync {
    fn driver_type(&self) -> &'static str;

    async fn open(&mut self, address: &str, baud_rate: u32) -> Result<(), DriverError>;

    async fn close(&mut self) -> Result<(), DriverError>;

    fn is_open(&self) -> bool;

    /// Send a new set-point in °C.
    async fn send_set_point(&self, target: f64) -> Result<(), DriverError>;

    /// Ask for the current temperature and return the raw reply line.
    async fn query_temperature_line(&self) -> Result<String, DriverError>;
}
