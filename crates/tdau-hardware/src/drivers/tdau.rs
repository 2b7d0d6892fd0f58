//! TDAU Thermal Diode Acquisition Unit Driver
//!
//! Protocol Overview:
//! - Format: binary frames, one slave per port
//! - Baud: 38400, 8N1, no flow control
//! - Request: `<slave> <command> [data] [checksum]`, slave address is always 0x01
//! - Reply: `<reply code> [data] <checksum>`; checksum is the low byte of the sum
//!   of every preceding reply byte
//!
//! | Command | Request bytes (after slave) | Reply |
//! |---------|-----------------------------|-------|
//! | VREQ    | `03`                        | `83 major minor cs` |
//! | RDSER   | `04`                        | `84 s0 s1 s2 s3 cs` (little-endian) |
//! | RDMEM   | `07 addrL addrH count`      | `87 data[count] cs` |
//! | WRMEM   | `08 addrL addrH 01 data cs` | `80 cond cs` |
//! | EXTC    | `0D`                        | `80 cond cs` |
//! | SCO     | `20`                        | `80 cond cs` |
//!
//! Any request may be answered with a condition reply (`80 cond cs`) instead of
//! its data reply. The WRMEM checksum covers the command, address, quantity and
//! data bytes but not the slave address.
//!
//! # Important Notes
//!
//! - Memory writes are one byte per frame; the board does not accept bursts
//! - Float registers are stored little-endian in board memory
//! - Calibration replies are not waited on beyond the calibration timeout; a
//!   missing reply is logged, a non-PASS condition fails the call
//!
//! # Example Usage
//!
//! ```no_run
//! use tdau_core::driver::DeviceDriver;
//! use tdau_hardware::drivers::tdau::TdauSerialDriver;
//! use tdau_hardware::runtime::DriverRuntime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = DriverRuntime::init();
//!     let mut board = TdauSerialDriver::new(runtime.clone());
//!     board.connect("/dev/ttyUSB0").await?;
//!
//!     let word = board.read_register_word(0x54).await?;
//!     println!("identity word: {}", word);
//!
//!     board.disconnect().await?;
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

use crate::runtime::{DriverRuntime, PortClaim};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tdau_core::driver::{DeviceDriver, FirmwareVersion};
use tdau_core::serial::{
    discard_pending, drain_serial_buffer, open_serial_async, wrap_shared_unbuffered, DynSerial,
    SharedPortUnbuffered,
};
use tdau_core::{DriverError, DriverErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

const DRIVER_TYPE: &str = "tdau";

/// Line rate of every TDAU board.
pub const TDAU_BAUD: u32 = 38_400;

/// Slave address prefixed to every request.
pub const SLAVE: u8 = 0x01;

/// Request command codes.
pub mod command {
    pub const VREQ: u8 = 0x03;
    pub const RDSER: u8 = 0x04;
    pub const RDMEM: u8 = 0x07;
    pub const WRMEM: u8 = 0x08;
    pub const EXTC: u8 = 0x0D;
    pub const SCO: u8 = 0x20;
}

/// Reply codes.
pub mod reply {
    pub const COND: u8 = 0x80;
    pub const FWVER: u8 = 0x83;
    pub const SER: u8 = 0x84;
    pub const MEM: u8 = 0x87;
}

/// Condition carried by a `0x80` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Pass,
    InvalidCommand,
    InactiveCommand,
    BadChecksum,
    Busy,
    Error,
    Range,
    NoData,
    Overflow,
    NoBootLoader,
    Unknown(u8),
}

impl Condition {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x41 => Condition::Pass,
            0x42 => Condition::InvalidCommand,
            0x43 => Condition::InactiveCommand,
            0x44 => Condition::BadChecksum,
            0x45 => Condition::Busy,
            0x46 => Condition::Error,
            0x47 => Condition::Range,
            0x48 => Condition::NoData,
            0x49 => Condition::Overflow,
            0x4A => Condition::NoBootLoader,
            other => Condition::Unknown(other),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Pass => write!(f, "PASS"),
            Condition::InvalidCommand => write!(f, "INVALID COMMAND"),
            Condition::InactiveCommand => write!(f, "INACTIVE COMMAND"),
            Condition::BadChecksum => write!(f, "BAD CHECKSUM"),
            Condition::Busy => write!(f, "BUSY"),
            Condition::Error => write!(f, "ERROR"),
            Condition::Range => write!(f, "RANGE"),
            Condition::NoData => write!(f, "END OF DATA"),
            Condition::Overflow => write!(f, "RX BUFFER FULL"),
            Condition::NoBootLoader => write!(f, "NO BOOT LOADER"),
            Condition::Unknown(code) => write!(f, "UNKNOWN (0x{:02X})", code),
        }
    }
}

/// Decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Condition(Condition),
    Data(Vec<u8>),
}

/// Low byte of the byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn read_memory_frame(address: u16, count: u8) -> Vec<u8> {
    let [lo, hi] = address.to_le_bytes();
    vec![SLAVE, command::RDMEM, lo, hi, count]
}

pub fn write_memory_frame(address: u16, value: u8) -> Vec<u8> {
    let [lo, hi] = address.to_le_bytes();
    let body = [command::WRMEM, lo, hi, 1, value];
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(SLAVE);
    frame.extend_from_slice(&body);
    frame.push(checksum(&body));
    frame
}

pub fn command_frame(code: u8) -> Vec<u8> {
    vec![SLAVE, code]
}

/// Driver for a TDAU board on a serial port.
///
/// Implements [`DeviceDriver`]. The port is opened by `connect` and claimed on
/// the shared [`DriverRuntime`] for as long as it stays open.
pub struct TdauSerialDriver {
    runtime: Arc<DriverRuntime>,
    port: Option<SharedPortUnbuffered>,
    claim: Option<PortClaim>,
    /// Per-reply timeout for memory and identity commands
    reply_timeout: Duration,
    /// How long to listen for a calibration reply
    calibration_timeout: Duration,
}

impl TdauSerialDriver {
    pub fn new(runtime: Arc<DriverRuntime>) -> Self {
        Self {
            runtime,
            port: None,
            claim: None,
            reply_timeout: Duration::from_millis(2000),
            calibration_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeouts(mut self, reply_timeout: Duration, calibration_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self.calibration_timeout = calibration_timeout;
        self
    }

    #[cfg(test)]
    fn with_test_port(port: DynSerial) -> Self {
        let mut driver = Self::new(DriverRuntime::init())
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        driver.port = Some(wrap_shared_unbuffered(port));
        driver
    }

    fn error(kind: DriverErrorKind, message: impl Into<String>) -> DriverError {
        DriverError::new(DRIVER_TYPE, kind, message)
    }

    fn port(&self) -> Result<&SharedPortUnbuffered, DriverError> {
        self.port
            .as_ref()
            .ok_or_else(|| Self::error(DriverErrorKind::Communication, "port is not open"))
    }

    /// Send one request and read its reply.
    ///
    /// `expected` is the data reply code and `payload_len` its data length; a
    /// condition reply is accepted in its place.
    async fn transact(
        &self,
        frame: &[u8],
        expected: u8,
        payload_len: usize,
        timeout: Duration,
    ) -> Result<Reply, DriverError> {
        let mut guard = self.port()?.lock().await;

        // A reply that arrived after its timeout would otherwise answer this request.
        let stale = discard_pending(&mut *guard).await;
        if stale > 0 {
            debug!(discarded = stale, "Discarded stale bytes before request");
        }

        guard
            .write_all(frame)
            .await
            .map_err(|e| Self::error(DriverErrorKind::Communication, format!("write failed: {}", e)))?;
        guard
            .flush()
            .await
            .map_err(|e| Self::error(DriverErrorKind::Communication, format!("flush failed: {}", e)))?;

        let result = Self::read_reply(&mut guard, expected, payload_len, timeout).await;
        if result.is_err() {
            let discarded = drain_serial_buffer(&mut *guard, 50).await;
            if discarded > 0 {
                debug!(discarded, "Discarded bytes after failed reply");
            }
        }
        result
    }

    async fn read_reply(
        port: &mut DynSerial,
        expected: u8,
        payload_len: usize,
        timeout: Duration,
    ) -> Result<Reply, DriverError> {
        let mut header = [0u8; 1];
        read_exact_timeout(port, &mut header, timeout).await?;

        match header[0] {
            reply::COND => {
                let mut rest = [0u8; 2];
                read_exact_timeout(port, &mut rest, timeout).await?;
                let calculated = checksum(&[reply::COND, rest[0]]);
                if calculated != rest[1] {
                    return Err(Self::error(
                        DriverErrorKind::Checksum,
                        format!(
                            "reply 0x{:02X} checksum 0x{:02X} != calculated 0x{:02X}",
                            reply::COND, rest[1], calculated
                        ),
                    ));
                }
                Ok(Reply::Condition(Condition::from_code(rest[0])))
            }
            code if code == expected => {
                let mut body = vec![0u8; payload_len + 1];
                read_exact_timeout(port, &mut body, timeout).await?;
                let received = body[payload_len];
                body.truncate(payload_len);

                let mut summed = Vec::with_capacity(payload_len + 1);
                summed.push(code);
                summed.extend_from_slice(&body);
                let calculated = checksum(&summed);
                if calculated != received {
                    return Err(Self::error(
                        DriverErrorKind::Checksum,
                        format!(
                            "reply 0x{:02X} checksum 0x{:02X} != calculated 0x{:02X}",
                            code, received, calculated
                        ),
                    ));
                }
                Ok(Reply::Data(body))
            }
            other => Err(Self::error(
                DriverErrorKind::Communication,
                format!("unexpected reply code 0x{:02X} (expected 0x{:02X})", other, expected),
            )),
        }
    }

    async fn expect_data(
        &self,
        frame: &[u8],
        expected: u8,
        payload_len: usize,
    ) -> Result<Vec<u8>, DriverError> {
        match self
            .transact(frame, expected, payload_len, self.reply_timeout)
            .await?
        {
            Reply::Data(data) => Ok(data),
            Reply::Condition(condition) => Err(Self::error(
                DriverErrorKind::Rejected,
                format!("command 0x{:02X} answered {}", frame[1], condition),
            )),
        }
    }

    async fn calibration_command(&self, code: u8, name: &str) -> Result<(), DriverError> {
        match self
            .transact(&command_frame(code), reply::COND, 0, self.calibration_timeout)
            .await
        {
            Ok(Reply::Condition(Condition::Pass)) => {
                debug!(calibration = name, "Calibration acknowledged");
                Ok(())
            }
            Ok(Reply::Condition(condition)) => {
                warn!(calibration = name, %condition, "Calibration refused");
                Err(Self::error(
                    DriverErrorKind::Rejected,
                    format!("{} calibration answered {}", name, condition),
                ))
            }
            Ok(Reply::Data(_)) => Err(Self::error(
                DriverErrorKind::Communication,
                format!("data reply to {} calibration", name),
            )),
            Err(e) if e.kind == DriverErrorKind::Timeout => {
                debug!(calibration = name, "No calibration reply within timeout");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn read_exact_timeout(
    port: &mut DynSerial,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), DriverError> {
    match tokio::time::timeout(timeout, port.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(TdauSerialDriver::error(
            DriverErrorKind::Communication,
            format!("read failed: {}", e),
        )),
        Err(_) => Err(TdauSerialDriver::error(
            DriverErrorKind::Timeout,
            format!("no reply within {:?}", timeout),
        )),
    }
}

#[async_trait]
impl DeviceDriver for TdauSerialDriver {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    #[instrument(skip(self), err)]
    async fn connect(&mut self, address: &str) -> Result<(), DriverError> {
        if self.port.is_some() {
            return Ok(());
        }
        let claim = self.runtime.claim(address, DRIVER_TYPE)?;

        let stream = open_serial_async(address, TDAU_BAUD, self.reply_timeout, "TDAU")
            .await
            .map_err(|e| Self::error(DriverErrorKind::Initialization, format!("{:#}", e)))?;
        self.port = Some(wrap_shared_unbuffered(Box::new(stream)));

        // Boards answer VREQ as soon as they are powered; no answer means wrong port.
        match self.firmware_version().await {
            Ok(version) => {
                debug!(%version, address, "TDAU responded");
                self.claim = Some(claim);
                Ok(())
            }
            Err(e) => {
                self.port = None;
                Err(Self::error(
                    DriverErrorKind::Initialization,
                    format!("unable to communicate on {}: {}", address, e.message),
                ))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        if let Some(port) = self.port.take() {
            let mut guard = port.lock().await;
            if let Err(e) = guard.shutdown().await {
                debug!(error = %e, "Port shutdown reported an error");
            }
        }
        self.claim = None;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn read_memory(&self, address: u16, count: u8) -> Result<Vec<u8>, DriverError> {
        self.expect_data(&read_memory_frame(address, count), reply::MEM, usize::from(count))
            .await
    }

    async fn write_memory(&self, address: u16, value: u8) -> Result<(), DriverError> {
        match self
            .transact(&write_memory_frame(address, value), reply::COND, 0, self.reply_timeout)
            .await?
        {
            Reply::Condition(Condition::Pass) => Ok(()),
            Reply::Condition(condition) => Err(Self::error(
                DriverErrorKind::Rejected,
                format!("write to 0x{:04X} answered {}", address, condition),
            )),
            Reply::Data(_) => Err(Self::error(
                DriverErrorKind::Communication,
                "data reply to a memory write",
            )),
        }
    }

    #[instrument(skip(self), err)]
    async fn extended_calibration(&self) -> Result<(), DriverError> {
        self.calibration_command(command::EXTC, "extended").await
    }

    #[instrument(skip(self), err)]
    async fn sco_calibration(&self) -> Result<(), DriverError> {
        self.calibration_command(command::SCO, "sco").await
    }

    async fn serial_number(&self) -> Result<u32, DriverError> {
        let data = self
            .expect_data(&command_frame(command::RDSER), reply::SER, 4)
            .await?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    async fn firmware_version(&self) -> Result<FirmwareVersion, DriverError> {
        let data = self
            .expect_data(&command_frame(command::VREQ), reply::FWVER, 2)
            .await?;
        Ok(FirmwareVersion {
            major: data[0],
            minor: data[1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn with_cs(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        frame.push(checksum(bytes));
        frame
    }

    async fn expect_request(device: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    fn driver_pair() -> (TdauSerialDriver, DuplexStream) {
        let (host, device) = tokio::io::duplex(256);
        (TdauSerialDriver::with_test_port(Box::new(host)), device)
    }

    #[test]
    fn write_frame_checksum_excludes_slave() {
        let frame = write_memory_frame(0x0044, 0x3F);
        assert_eq!(frame, vec![0x01, 0x08, 0x44, 0x00, 0x01, 0x3F, 0x8C]);

        let frame = write_memory_frame(1100, 0xFF);
        let [lo, hi] = 1100u16.to_le_bytes();
        assert_eq!(&frame[..6], &[0x01, 0x08, lo, hi, 0x01, 0xFF]);
        assert_eq!(frame[6], checksum(&frame[1..6]));
    }

    #[test]
    fn condition_codes() {
        assert_eq!(Condition::from_code(0x41), Condition::Pass);
        assert_eq!(Condition::from_code(0x47).to_string(), "RANGE");
        assert_eq!(Condition::from_code(0x99), Condition::Unknown(0x99));
    }

    #[tokio::test]
    async fn reads_register_word_from_little_endian_memory() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &[0x01, 0x07, 0x54, 0x00, 0x04]).await;
            device
                .write_all(&with_cs(&[0x87, 0x00, 0x00, 0x80, 0x3F]))
                .await
                .unwrap();
            device
        });

        let word = driver.read_register_word(0x54).await.unwrap();
        assert_eq!(word, "3F800000");
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_reply_checksum() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &read_memory_frame(1124, 4)).await;
            device
                .write_all(&[0x87, 0x01, 0x02, 0x03, 0x04, 0x00])
                .await
                .unwrap();
            device
        });

        let err = driver.read_memory(1124, 4).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Checksum);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn condition_reply_checksum_is_verified() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &write_memory_frame(3, 0x38)).await;
            device.write_all(&[0x80, 0x41, 0x00]).await.unwrap();
            device
        });

        let err = driver.write_memory(3, 0x38).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Checksum);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn condition_reply_to_read_is_rejected() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &read_memory_frame(0xFFF0, 4)).await;
            device.write_all(&with_cs(&[0x80, 0x47])).await.unwrap();
            device
        });

        let err = driver.read_memory(0xFFF0, 4).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Rejected);
        assert!(err.message.contains("RANGE"));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn write_memory_requires_pass() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &write_memory_frame(3, 0x38)).await;
            device.write_all(&with_cs(&[0x80, 0x41])).await.unwrap();
            expect_request(&mut device, &write_memory_frame(4, 0x01)).await;
            device.write_all(&with_cs(&[0x80, 0x45])).await.unwrap();
            device
        });

        driver.write_memory(3, 0x38).await.unwrap();
        let err = driver.write_memory(4, 0x01).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Rejected);
        assert!(err.message.contains("BUSY"));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn identity_commands() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &[0x01, 0x04]).await;
            device
                .write_all(&with_cs(&[0x84, 0x39, 0x30, 0x00, 0x00]))
                .await
                .unwrap();
            expect_request(&mut device, &[0x01, 0x03]).await;
            device.write_all(&with_cs(&[0x83, 0x80, 0x18])).await.unwrap();
            device
        });

        assert_eq!(driver.serial_number().await.unwrap(), 12345);
        let version = driver.firmware_version().await.unwrap();
        assert_eq!(version, FirmwareVersion { major: 0x80, minor: 0x18 });
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn calibration_sends_commands_and_tolerates_silence() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &[0x01, 0x0D]).await;
            device.write_all(&with_cs(&[0x80, 0x41])).await.unwrap();
            // SCO gets no reply at all
            expect_request(&mut device, &[0x01, 0x20]).await;
            device
        });

        driver.extended_calibration().await.unwrap();
        driver.sco_calibration().await.unwrap();
        device_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_calibration_reply_does_not_shift_next_read() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &[0x01, 0x0D]).await;
            // PASS arrives well after the calibration timeout
            tokio::time::sleep(Duration::from_millis(400)).await;
            device.write_all(&with_cs(&[0x80, 0x41])).await.unwrap();
            expect_request(&mut device, &read_memory_frame(1124, 4)).await;
            device
                .write_all(&with_cs(&[0x87, 0x00, 0x00, 0x80, 0x3F]))
                .await
                .unwrap();
            device
        });

        driver.extended_calibration().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let data = driver.read_memory(1124, 4).await.unwrap();
        assert_eq!(data, vec![0x00, 0x00, 0x80, 0x3F]);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn busy_calibration_is_rejected() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &[0x01, 0x0D]).await;
            device.write_all(&with_cs(&[0x80, 0x45])).await.unwrap();
            device
        });

        let err = driver.extended_calibration().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Rejected);
        assert!(err.message.contains("BUSY"));
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn read_times_out_without_reply() {
        let (driver, mut device) = driver_pair();

        let device_task = tokio::spawn(async move {
            expect_request(&mut device, &read_memory_frame(896, 4)).await;
            device
        });

        let err = driver.read_memory(896, 4).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_is_a_communication_error() {
        let (host, device) = tokio::io::duplex(64);
        drop(device);
        let driver = TdauSerialDriver::with_test_port(Box::new(host));

        let err = driver.write_memory(0, 0x11).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (mut driver, _device) = driver_pair();
        driver.disconnect().await.unwrap();
        driver.disconnect().await.unwrap();
        let err = driver.read_memory(0, 4).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
    }
}
