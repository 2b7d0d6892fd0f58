//! Driver construction for a run.
//!
//! The run engine never names a concrete driver. It asks a [`DriverFactory`] for
//! one board driver per roster address and one bath driver, so the same engine
//! runs against serial hardware or the in-process mock bench.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tdau_core::driver::{BathDriver, DeviceDriver};
use tdau_hardware::drivers::mock::{
    Chamber, DiodeModel, MockBath, MockBathHandle, MockFault, MockTdau, MockTdauHandle,
};
use tdau_hardware::DriverRuntime;

pub trait DriverFactory: Send + Sync {
    fn device(&self, runtime: &Arc<DriverRuntime>, address: &str) -> Box<dyn DeviceDriver>;

    fn bath(&self, runtime: &Arc<DriverRuntime>) -> Box<dyn BathDriver>;
}

/// Real hardware over serial ports.
#[cfg(feature = "serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialDriverFactory;

#[cfg(feature = "serial")]
impl DriverFactory for SerialDriverFactory {
    fn device(&self, runtime: &Arc<DriverRuntime>, _address: &str) -> Box<dyn DeviceDriver> {
        Box::new(tdau_hardware::drivers::TdauSerialDriver::new(Arc::clone(runtime)))
    }

    fn bath(&self, runtime: &Arc<DriverRuntime>) -> Box<dyn BathDriver> {
        Box::new(tdau_hardware::drivers::BathSerialDriver::new(Arc::clone(runtime)))
    }
}

/// Simulated boards and bath sharing one [`Chamber`].
///
/// Serial numbers are assigned from `first_serial` in creation order. Handles
/// to every driver handed out are kept for inspection.
#[derive(Default)]
pub struct MockDriverFactory {
    chamber: Chamber,
    model: DiodeModel,
    first_serial: u32,
    bath_ramp: Option<f64>,
    device_faults: HashMap<String, Vec<MockFault>>,
    bath_faults: Vec<MockFault>,
    devices: Mutex<Vec<(String, MockTdauHandle)>>,
    baths: Mutex<Vec<MockBathHandle>>,
}

impl MockDriverFactory {
    pub fn new(chamber: Chamber) -> Self {
        Self {
            chamber,
            first_serial: 0x1000,
            ..Self::default()
        }
    }

    pub fn chamber(&self) -> &Chamber {
        &self.chamber
    }

    pub fn with_model(mut self, model: DiodeModel) -> Self {
        self.model = model;
        self
    }

    /// Degrees moved per bath temperature query.
    pub fn with_bath_ramp(mut self, ramp_per_query: f64) -> Self {
        self.bath_ramp = Some(ramp_per_query);
        self
    }

    pub fn with_device_fault(mut self, address: &str, fault: MockFault) -> Self {
        self.device_faults
            .entry(address.to_string())
            .or_default()
            .push(fault);
        self
    }

    pub fn with_bath_fault(mut self, fault: MockFault) -> Self {
        self.bath_faults.push(fault);
        self
    }

    /// Handle of the most recent board created for `address`.
    pub fn device_handle(&self, address: &str) -> Option<MockTdauHandle> {
        self.devices
            .lock()
            .iter()
            .rev()
            .find(|(a, _)| a == address)
            .map(|(_, handle)| handle.clone())
    }

    pub fn bath_handle(&self) -> Option<MockBathHandle> {
        self.baths.lock().last().cloned()
    }
}

impl DriverFactory for MockDriverFactory {
    fn device(&self, runtime: &Arc<DriverRuntime>, address: &str) -> Box<dyn DeviceDriver> {
        let mut devices = self.devices.lock();
        let serial = self.first_serial + devices.len() as u32;
        let mut board = MockTdau::new(Arc::clone(runtime), self.chamber.clone(), serial)
            .with_model(self.model);
        for fault in self.device_faults.get(address).into_iter().flatten() {
            board = board.with_fault(fault.clone());
        }
        devices.push((address.to_string(), board.handle()));
        Box::new(board)
    }

    fn bath(&self, runtime: &Arc<DriverRuntime>) -> Box<dyn BathDriver> {
        let mut bath = MockBath::new(Arc::clone(runtime), self.chamber.clone());
        if let Some(ramp) = self.bath_ramp {
            bath = bath.with_ramp(ramp);
        }
        for fault in &self.bath_faults {
            bath = bath.with_fault(fault.clone());
        }
        self.baths.lock().push(bath.handle());
        Box::new(bath)
    }
}
