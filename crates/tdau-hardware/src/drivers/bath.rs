//! Thermal bath driver (ASCII line protocol)
//!
//! Protocol Overview:
//! - Format: ASCII commands terminated by CR
//! - Framing: 8N1, no handshake, 2000 ms read/write timeout
//! - Baud: configurable, 2400 on the bench controller
//! - Commands: `s=<value>` (set-point, no reply), `t` (query temperature)
//! - Response to `t`: one line containing the reading, e.g. `t: 25.013 C`
//!
//! Parsing the reading out of the reply is done by
//! [`crate::session::bath::BathSession`], so this driver only moves lines.

use crate::runtime::{DriverRuntime, PortClaim};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tdau_core::driver::BathDriver;
use tdau_core::serial::{drain_serial_buffer, open_serial_async, wrap_shared, SharedPort};
use tdau_core::{DriverError, DriverErrorKind};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

const DRIVER_TYPE: &str = "bath";

/// Fixed read/write timeout of the bath link.
pub const BATH_IO_TIMEOUT: Duration = Duration::from_millis(2000);

/// Driver for a temperature bath on a serial port.
pub struct BathSerialDriver {
    runtime: Arc<DriverRuntime>,
    port: Option<SharedPort>,
    claim: Option<PortClaim>,
    timeout: Duration,
}

impl BathSerialDriver {
    pub fn new(runtime: Arc<DriverRuntime>) -> Self {
        Self {
            runtime,
            port: None,
            claim: None,
            timeout: BATH_IO_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_test_port(port: tdau_core::serial::DynSerial) -> Self {
        let mut driver = Self::new(DriverRuntime::init());
        driver.port = Some(wrap_shared(port));
        driver.timeout = Duration::from_millis(200);
        driver
    }

    fn error(kind: DriverErrorKind, message: impl Into<String>) -> DriverError {
        DriverError::new(DRIVER_TYPE, kind, message)
    }

    fn port(&self) -> Result<&SharedPort, DriverError> {
        self.port
            .as_ref()
            .ok_or_else(|| Self::error(DriverErrorKind::Communication, "port is not open"))
    }

    async fn write_command(&self, port: &SharedPort, command: &str) -> Result<(), DriverError> {
        let mut guard = port.lock().await;
        let write = async {
            guard.get_mut().write_all(command.as_bytes()).await?;
            guard.get_mut().flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Self::error(
                DriverErrorKind::Communication,
                format!("write {:?} failed: {}", command.trim_end(), e),
            )),
            Err(_) => Err(Self::error(
                DriverErrorKind::Timeout,
                format!("write {:?} timed out", command.trim_end()),
            )),
        }
    }
}

#[async_trait]
impl BathDriver for BathSerialDriver {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    #[instrument(skip(self), err)]
    async fn open(&mut self, address: &str, baud_rate: u32) -> Result<(), DriverError> {
        if self.port.is_some() {
            return Ok(());
        }
        let claim = self.runtime.claim(address, DRIVER_TYPE)?;
        let stream = open_serial_async(address, baud_rate, self.timeout, "bath")
            .await
            .map_err(|e| Self::error(DriverErrorKind::Initialization, format!("{:#}", e)))?;
        self.port = Some(wrap_shared(Box::new(stream)));
        self.claim = Some(claim);
        debug!(address, baud_rate, "Bath port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if let Some(port) = self.port.take() {
            let mut guard = port.lock().await;
            if let Err(e) = guard.get_mut().shutdown().await {
                debug!(error = %e, "Bath port shutdown reported an error");
            }
        }
        self.claim = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn send_set_point(&self, target: f64) -> Result<(), DriverError> {
        let port = self.port()?;
        self.write_command(port, &format!("s={}\r", target)).await
    }

    async fn query_temperature_line(&self) -> Result<String, DriverError> {
        let port = self.port()?;
        {
            // Set-point writes are not answered, but some baths echo them.
            let mut guard = port.lock().await;
            let discarded = drain_serial_buffer(&mut *guard, 20).await;
            if discarded > 0 {
                debug!(discarded, "Discarded stale bath output");
            }
        }
        self.write_command(port, "t\r").await?;

        let mut guard = port.lock().await;
        let mut response = String::new();
        match tokio::time::timeout(self.timeout, guard.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(Self::error(DriverErrorKind::Communication, "port closed")),
            Ok(Ok(_)) => Ok(response.trim().to_string()),
            Ok(Err(e)) => Err(Self::error(
                DriverErrorKind::Communication,
                format!("read failed: {}", e),
            )),
            Err(_) => Err(Self::error(
                DriverErrorKind::Timeout,
                format!("no reply within {:?}", self.timeout),
            )),
        }
    }
}
