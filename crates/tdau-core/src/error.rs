//! Error taxonomy for the bench.
//!
//! [`BenchError`] is the single error type returned across crate boundaries.
//! Its variants fall into two classes that the orchestrator treats differently:
//!
//! - **Recoverable** (`Format`, `Computation`): a single value or a single row is
//!   bad. The error is logged, the affected field stays unset and the batch
//!   continues.
//! - **Fatal** (`Connection`, `NotConnected`, `BathTimeout`, `Storage`): a
//!   transport or store failure. It propagates out of the run without retry.
//!
//! `Configuration` errors are raised before any device is touched.
//!
//! Drivers report failures as [`DriverError`], which carries the driver type and a
//! [`DriverErrorKind`] so callers can tell a timeout from a rejected command.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Communication,
    Timeout,
    Checksum,
    Rejected,
    Shutdown,
    InvalidParameter,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Checksum => "checksum",
            DriverErrorKind::Rejected => "rejected",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Field and Row Errors
// =============================================================================

/// A malformed numeric or hex value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("register word must be 8 hex characters, got {len}: {input:?}")]
    WrongLength { len: usize, input: String },

    #[error("register word contains non-hex characters: {0:?}")]
    NotHex(String),

    #[error("no numeric literal in response: {0:?}")]
    NoNumber(String),
}

/// A row whose RS/ideality cannot be computed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputationError {
    #[error("test {test_id}: field {field} has not been measured")]
    MissingField { test_id: i64, field: &'static str },

    #[error("test {test_id}: log argument {ratio} is not positive ({value})")]
    NonPositiveLog {
        test_id: i64,
        ratio: &'static str,
        value: f64,
    },

    #[error("test {test_id}: denominator of {quantity} is zero")]
    ZeroDenominator { test_id: i64, quantity: &'static str },

    #[error("test {test_id}: {quantity} is not finite ({value})")]
    NonFinite {
        test_id: i64,
        quantity: &'static str,
        value: f64,
    },
}

// =============================================================================
// Bench Error
// =============================================================================

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

/// Primary error type for the bench.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Transport open/read/write failure on a TDAU board or the bath.
    ///
    /// **Error Type**: Fatal to the run. Not retried; the device stays unusable
    /// until a fresh connect.
    #[error("Connection error: {0}")]
    Connection(#[from] DriverError),

    /// A session was used before `connect`/`open` or after it was released.
    #[error("Session not connected: {0}")]
    NotConnected(String),

    /// The bath did not settle within the configured maximum wait.
    ///
    /// **Error Type**: Fatal to the run, treated like a transport failure.
    #[error("Bath did not reach {target:.2}°C within {waited_secs}s (last reading: {last:?})")]
    BathTimeout {
        target: f64,
        last: Option<f64>,
        waited_secs: u64,
    },

    /// Malformed numeric or hex data.
    ///
    /// **Error Type**: Recoverable. The field is left unset and the run continues.
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// Invalid derived-parameter math for one row.
    ///
    /// **Error Type**: Recoverable per row.
    #[error("Computation error: {0}")]
    Computation(#[from] ComputationError),

    /// Missing or contradictory run parameters.
    ///
    /// Raised while validating the configuration snapshot, before a run starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistent store failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BenchError {
    /// Whether the error only invalidates a field or a row.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BenchError::Format(_) | BenchError::Computation(_))
    }

    /// Shorthand for a driver-level transport failure.
    pub fn connection(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        BenchError::Connection(DriverError::new(driver_type, kind, message))
    }
}
