//! `tdau-experiment`
//!
//! Everything between a configuration file and a finished project in the store:
//!
//! - [`config`]: the immutable run configuration and its validation
//! - [`plans`]: temperature sweep, current combinations and the test matrix
//! - [`run_engine`]: the Idle → Initializing → Running → Finalizing state machine
//! - [`derive`]: collector current, series resistance and ideality passes
//! - [`factory`]: serial or simulated drivers for the engine

pub mod config;
pub mod derive;
pub mod factory;
pub mod plans;
pub mod run_engine;

pub use config::{BenchConfig, ConfigLoadError, DeviceConfig, DeviceFamily};
pub use derive::{compute_derived, derive_project, DeriveSummary};
#[cfg(feature = "serial")]
pub use factory::SerialDriverFactory;
pub use factory::{DriverFactory, MockDriverFactory};
pub use plans::{SweepMode, TestPlan};
pub use run_engine::{EngineState, RunEngine, RunSummary};
