//! `tdau-core`
//!
//! Core definitions shared by every crate of the TDAU characterization bench.
//!
//! ## Layers
//!
//! - **Codec**: IEEE-754 register words and channel/slot address arithmetic
//! - **Driver traits**: the command surface a TDAU board or a thermal bath exposes
//! - **Model**: plan rows, current combinations, diode units and raw measurements
//! - **Errors**: the [`BenchError`] taxonomy with its recover/abort policy
//!
//! Wire protocols live in `tdau-hardware`, persistence in `tdau-storage` and
//! sequencing in `tdau-experiment`; this crate only defines what they exchange.

pub mod codec;
pub mod driver;
pub mod error;
pub mod model;
#[cfg(feature = "serial")]
pub mod serial;

pub use error::{AppResult, BenchError, ComputationError, DriverError, DriverErrorKind, FormatError};
