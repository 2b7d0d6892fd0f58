//! Serial port abstractions shared by the bench drivers.
//!
//! Requires the `serial` feature.
//!
//! - [`SerialPortIO`]: any `AsyncRead + AsyncWrite` usable as a port
//! - [`SharedPort`]: line-buffered port for ASCII instruments (the bath)
//! - [`SharedPortUnbuffered`]: byte-level port for binary framing (TDAU boards)
//! - [`open_serial_async`]: open an 8N1 port without blocking the runtime
//! - [`drain_serial_buffer`]: discard stale bytes before a request

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Trait alias for async serial port I/O.
///
/// Implemented by `tokio_serial::SerialStream`, `tokio::io::DuplexStream`
/// and the mock ports used in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered reading.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Thread-safe shared serial port without buffering.
pub type SharedPortUnbuffered = Arc<Mutex<DynSerial>>;

pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

pub fn wrap_shared_unbuffered(port: DynSerial) -> SharedPortUnbuffered {
    Arc::new(Mutex::new(port))
}

/// Open a serial port with 8N1 framing and no flow control.
///
/// The open runs on the blocking pool; `timeout` becomes the port's
/// read/write timeout.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    timeout: Duration,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read and discard whatever is immediately available, for at most `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total_discarded
}

/// Discard bytes that are already buffered, without waiting for more.
///
/// Returns the number of bytes discarded.
pub async fn discard_pending<R: AsyncRead + Unpin>(port: &mut R) -> usize {
    let mut discard = [0u8; 256];
    let mut total_discarded = 0usize;

    // A zero timeout still polls the read once before giving up.
    while let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, port.read(&mut discard)).await {
        if n == 0 {
            break;
        }
        total_discarded += n;
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, device) = tokio::io::duplex(64);
        let port = wrap_shared_unbuffered(Box::new(device));

        host.write_all(&[0x80, 0x41, 0xC1, 0xFF]).await.unwrap();

        let mut guard = port.lock().await;
        let discarded = drain_serial_buffer(&mut *guard, 50).await;
        assert_eq!(discarded, 4);

        let again = drain_serial_buffer(&mut *guard, 20).await;
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn discard_pending_does_not_wait() {
        let (mut host, mut device) = tokio::io::duplex(64);

        assert_eq!(discard_pending(&mut device).await, 0);

        host.write_all(&[0x80, 0x41, 0xC1]).await.unwrap();
        assert_eq!(discard_pending(&mut device).await, 3);
        assert_eq!(discard_pending(&mut device).await, 0);
    }
}
