//! Stateful sessions over the driver traits.
//!
//! A session adds what a bare driver does not know about: connection state,
//! register arithmetic for the boards, and the set-and-wait policy of the bath.

pub mod bath;
pub mod device;

pub use bath::{parse_first_float, BathPolicy, BathSession, DEFAULT_TEMPERATURE};
pub use device::{ControlProfile, DeviceSession, SessionState};
