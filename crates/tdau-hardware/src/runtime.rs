//! Process-wide driver runtime.
//!
//! One [`DriverRuntime`] is created by the top-level run and handed to every
//! driver constructor. It owns the lifecycle that individual drivers must not:
//!
//! - `init` before the first port is opened
//! - port claims, so two sessions can never hold the same address
//! - `shutdown` once every session is released
//!
//! A driver claims its address on connect and drops the [`PortClaim`] on
//! disconnect. Claims still held at shutdown are reported and force-released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tdau_core::{DriverError, DriverErrorKind};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RuntimeState {
    running: bool,
    /// address -> driver type holding it
    claims: HashMap<String, &'static str>,
}

/// Shared handle for driver lifecycle and port ownership.
#[derive(Debug)]
pub struct DriverRuntime {
    state: Mutex<RuntimeState>,
}

impl DriverRuntime {
    /// Start a runtime. Drivers may claim ports until [`DriverRuntime::shutdown`].
    pub fn init() -> Arc<Self> {
        info!("Driver runtime started");
        Arc::new(Self {
            state: Mutex::new(RuntimeState {
                running: true,
                claims: HashMap::new(),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Claim exclusive use of `address` for `driver_type`.
    ///
    /// # Errors
    ///
    /// `Initialization` if the runtime is shut down, `InvalidParameter` if the
    /// address is already claimed.
    pub fn claim(
        self: &Arc<Self>,
        address: &str,
        driver_type: &'static str,
    ) -> Result<PortClaim, DriverError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Initialization,
                "driver runtime is shut down",
            ));
        }
        if let Some(holder) = state.claims.get(address) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::InvalidParameter,
                format!("port {} is already held by a {} driver", address, holder),
            ));
        }
        state.claims.insert(address.to_string(), driver_type);
        debug!(address, driver_type, "Port claimed");
        Ok(PortClaim {
            runtime: Arc::clone(self),
            address: address.to_string(),
        })
    }

    /// Addresses currently claimed, sorted.
    pub fn claimed_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.state.lock().claims.keys().cloned().collect();
        ports.sort();
        ports
    }

    /// Stop the runtime. Returns the addresses that were still claimed.
    ///
    /// Idempotent.
    pub fn shutdown(&self) -> Vec<String> {
        let mut state = self.state.lock();
        if !state.running {
            return Vec::new();
        }
        state.running = false;
        let mut leaked: Vec<String> = state.claims.drain().map(|(addr, _)| addr).collect();
        leaked.sort();
        if leaked.is_empty() {
            info!("Driver runtime shut down");
        } else {
            warn!(ports = ?leaked, "Driver runtime shut down with ports still claimed");
        }
        leaked
    }

    fn release(&self, address: &str) {
        if self.state.lock().claims.remove(address).is_some() {
            debug!(address, "Port released");
        }
    }
}

/// Exclusive hold on a port address; released on drop.
#[derive(Debug)]
pub struct PortClaim {
    runtime: Arc<DriverRuntime>,
    address: String,
}

impl PortClaim {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        self.runtime.release(&self.address);
    }
}
