//! Stateful session with one TDAU board.
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                  │
//!       └────────── error ───────┘◀──disconnect─────┘
//! ```
//!
//! The session owns its driver and performs the register arithmetic; the driver
//! only moves bytes. There is no retry: a failed connect leaves the session
//! Disconnected with the driver error surfaced as [`BenchError::Connection`].

use serde::{Deserialize, Serialize};
use std::fmt;
use tdau_core::codec::{
    channel_address, float_to_register_hex, register_hex_to_float, register_word_memory_bytes,
    RegisterStride, CONTROL_WORD_LEN, IDENTITY_REGISTER,
};
use tdau_core::driver::DeviceDriver;
use tdau_core::{AppResult, BenchError};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Measurement control word written to registers 0..8 after connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlProfile {
    NoLeakCompensation,
    #[default]
    LeakageEnabled,
    LeakagePlusIbCompensation,
}

impl ControlProfile {
    pub fn bytes(self) -> [u8; CONTROL_WORD_LEN] {
        match self {
            ControlProfile::NoLeakCompensation => [0x11, 0x11, 0x00, 0x38, 0x01, 0x00, 0x33, 0x33],
            ControlProfile::LeakageEnabled => [0x99, 0x99, 0x00, 0x38, 0x01, 0x00, 0xBB, 0xBB],
            ControlProfile::LeakagePlusIbCompensation => {
                [0x99, 0x99, 0xF0, 0x38, 0x01, 0x00, 0xBB, 0xBB]
            }
        }
    }
}

/// Session with one board.
pub struct DeviceSession {
    driver: Box<dyn DeviceDriver>,
    state: SessionState,
    address: Option<String>,
    identity: Option<f32>,
    serial_number: Option<u32>,
}

impl DeviceSession {
    pub fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            driver,
            state: SessionState::Disconnected,
            address: None,
            identity: None,
            serial_number: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Value of the identity register read on connect.
    pub fn identity(&self) -> Option<f32> {
        self.identity
    }

    pub fn serial_number(&self) -> Option<u32> {
        self.serial_number
    }

    fn ensure_connected(&self) -> AppResult<()> {
        match self.state {
            SessionState::Connected => Ok(()),
            other => Err(BenchError::NotConnected(format!(
                "TDAU session at {} is {}",
                self.address.as_deref().unwrap_or("<unassigned>"),
                other
            ))),
        }
    }

    /// Open the board at `address`, then read its identity word and serial number.
    #[instrument(skip(self), err)]
    pub async fn connect(&mut self, address: &str) -> AppResult<()> {
        if self.state == SessionState::Connected {
            return Ok(());
        }
        self.state = SessionState::Connecting;
        self.address = Some(address.to_string());

        match self.open_and_identify(address).await {
            Ok((identity, serial_number)) => {
                self.identity = Some(identity);
                self.serial_number = Some(serial_number);
                self.state = SessionState::Connected;
                info!(address, serial_number, identity, "TDAU connected");
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = self.driver.disconnect().await {
                    debug!(error = %close_err, "Cleanup after failed connect reported an error");
                }
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_and_identify(&mut self, address: &str) -> AppResult<(f32, u32)> {
        self.driver.connect(address).await?;
        let word = self.driver.read_register_word(IDENTITY_REGISTER).await?;
        let identity = register_hex_to_float(&word)?;
        let serial_number = self.driver.serial_number().await?;
        Ok((identity, serial_number))
    }

    /// Write the 8-byte control word, one register per write.
    #[instrument(skip(self), err)]
    pub async fn write_control_word(&self, profile: ControlProfile) -> AppResult<()> {
        self.ensure_connected()?;
        for (address, byte) in profile.bytes().iter().enumerate() {
            self.driver.write_memory(address as u16, *byte).await?;
        }
        debug!(?profile, "Control word written");
        Ok(())
    }

    /// Write a float to `base + 12·channel + 4·slot`, one byte per address.
    pub async fn write_channel_value(
        &self,
        base: u16,
        channel: u8,
        slot: u8,
        value: f32,
    ) -> AppResult<()> {
        self.ensure_connected()?;
        let address = channel_address(base, channel, slot, RegisterStride::CURRENT);
        let word = float_to_register_hex(value);
        let bytes = register_word_memory_bytes(&word)?;
        for (offset, byte) in (0u16..).zip(bytes) {
            self.driver.write_memory(address + offset, byte).await?;
        }
        debug!(address, channel, slot, value, %word, "Channel value written");
        Ok(())
    }

    /// Read and decode the float register at `address`.
    ///
    /// # Errors
    ///
    /// [`BenchError::Format`] if the word does not decode (recoverable),
    /// [`BenchError::Connection`] on a transport failure.
    pub async fn read_register_float(&self, address: u16) -> AppResult<f32> {
        self.ensure_connected()?;
        let word = self.driver.read_register_word(address).await?;
        Ok(register_hex_to_float(&word)?)
    }

    /// Raw memory dump starting at `address`.
    pub async fn read_memory(&self, address: u16, count: u8) -> AppResult<Vec<u8>> {
        self.ensure_connected()?;
        Ok(self.driver.read_memory(address, count).await?)
    }

    /// Extended calibration followed by small-current-offset calibration.
    #[instrument(skip(self), err)]
    pub async fn calibrate(&self) -> AppResult<()> {
        self.ensure_connected()?;
        self.driver.extended_calibration().await?;
        self.driver.sco_calibration().await?;
        Ok(())
    }

    /// Release the board. Idempotent: the driver is only asked once.
    pub async fn disconnect(&mut self) -> AppResult<()> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        self.state = SessionState::Disconnected;
        if let Err(e) = self.driver.disconnect().await {
            warn!(address = ?self.address, error = %e, "TDAU disconnect failed");
            return Err(e.into());
        }
        debug!(address = ?self.address, "TDAU disconnected");
        Ok(())
    }
}
