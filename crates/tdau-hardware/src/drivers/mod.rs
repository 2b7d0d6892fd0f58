//! Driver implementations.
//!
//! - [`tdau`]: TDAU board binary protocol over a serial link
//! - [`bath`]: thermal bath ASCII protocol over a serial link
//! - [`mock`]: in-memory board and bath for rehearsals and tests

#[cfg(feature = "serial")]
pub mod bath;
#[cfg(feature = "serial")]
pub mod tdau;

pub mod mock;

#[cfg(feature = "serial")]
pub use bath::BathSerialDriver;
#[cfg(feature = "serial")]
pub use tdau::TdauSerialDriver;

pub use mock::{Chamber, MockBath, MockFault, MockTdau};
