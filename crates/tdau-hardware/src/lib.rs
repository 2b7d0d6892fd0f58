//! # tdau-hardware
//!
//! Hardware layer of the bench:
//!
//! - **[`runtime::DriverRuntime`]** - process-wide driver lifecycle and port claims
//! - **[`drivers`]** - TDAU and bath protocol drivers, plus an in-memory bench
//! - **[`session`]** - device and bath sessions used by the run engine
//! - **[`port_resolver`]** - available device addresses
//!
//! ## Feature Flags
//!
//! - `serial` (default) - serial drivers via tokio-serial and port enumeration

pub mod drivers;
pub mod port_resolver;
pub mod runtime;
pub mod session;

pub use runtime::{DriverRuntime, PortClaim};
pub use session::{BathPolicy, BathSession, ControlProfile, DeviceSession, SessionState};
