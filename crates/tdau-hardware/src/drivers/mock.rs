//! In-memory bench simulation.
//!
//! [`MockTdau`] and [`MockBath`] implement the driver traits without a port so
//! that a full run can be rehearsed (`tdau-bench run --mock`) and the run engine
//! can be tested end to end.
//!
//! Both share a [`Chamber`]: the bath moves the chamber temperature toward its
//! set-point a fixed step per query, and the board computes its readings from
//! the chamber temperature at calibration time.
//!
//! The board simulates one silicon diode per channel:
//!
//! ```text
//! Ib   = Ie / (beta + 1)
//! Ic   = Ie - Ib
//! Vbe  = n * kT/q * ln(Ic / Is) + Ie * Rs
//! ```
//!
//! Every mock hands out a cloneable handle for inspecting what the code under
//! test did to it, and accepts [`MockFault`] scenarios for failure injection.

use crate::runtime::{DriverRuntime, PortClaim};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tdau_core::codec::{
    channel_address, float_to_register_hex, register_hex_from_le_bytes, RegisterStride,
    COMMANDED_CURRENT_BASE, IDENTITY_REGISTER,
};
use tdau_core::driver::{BathDriver, DeviceDriver, FirmwareVersion};
use tdau_core::model::MeasuredField;
use tdau_core::{DriverError, DriverErrorKind};
use tracing::debug;

const BOLTZMANN: f64 = 1.380649e-23;
const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;

const MEMORY_SIZE: usize = 2048;
const MOCK_TDAU: &str = "mock_tdau";
const MOCK_BATH: &str = "mock_bath";

// =============================================================================
// Shared chamber and fault scenarios
// =============================================================================

/// Temperature of the chamber holding the units under test, in °C.
#[derive(Debug, Clone)]
pub struct Chamber {
    temperature: Arc<Mutex<f64>>,
}

impl Chamber {
    pub fn new(initial: f64) -> Self {
        Self {
            temperature: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn temperature(&self) -> f64 {
        *self.temperature.lock()
    }

    pub fn set_temperature(&self, value: f64) {
        *self.temperature.lock() = value;
    }
}

impl Default for Chamber {
    fn default() -> Self {
        Self::new(25.0)
    }
}

/// Failure scenario for a mock driver.
#[derive(Debug, Clone)]
pub enum MockFault {
    /// Let `count` calls of `operation` succeed, fail every later one.
    FailAfterN { operation: &'static str, count: u32 },
    /// `operation` always times out.
    Timeout { operation: &'static str },
    /// Register reads at `address` return a word that is not hex.
    MalformedWord { address: u16 },
    /// The first `count` temperature queries return a line without a number.
    GarbageReplies { count: u32 },
    /// The bath accepts set-points but the chamber never moves.
    StuckBath,
}

#[derive(Debug, Default)]
struct FaultState {
    scenarios: Vec<MockFault>,
    counts: HashMap<&'static str, u32>,
}

impl FaultState {
    fn check(&mut self, driver_type: &str, operation: &'static str) -> Result<(), DriverError> {
        let calls = {
            let entry = self.counts.entry(operation).or_insert(0);
            *entry += 1;
            *entry
        };
        for scenario in &self.scenarios {
            match scenario {
                MockFault::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation && calls > *count => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        format!("injected failure on {} call {}", operation, calls),
                    ));
                }
                MockFault::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("operation '{}' timed out", operation),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn malformed(&self, address: u16) -> bool {
        self.scenarios
            .iter()
            .any(|s| matches!(s, MockFault::MalformedWord { address: a } if *a == address))
    }

    fn stuck(&self) -> bool {
        self.scenarios
            .iter()
            .any(|s| matches!(s, MockFault::StuckBath))
    }

    fn take_garbage(&mut self) -> bool {
        for scenario in &mut self.scenarios {
            if let MockFault::GarbageReplies { count } = scenario {
                if *count > 0 {
                    *count -= 1;
                    return true;
                }
            }
        }
        false
    }
}

fn not_open(driver_type: &str) -> DriverError {
    DriverError::new(driver_type, DriverErrorKind::Communication, "port is not open")
}

// =============================================================================
// MockTdau
// =============================================================================

/// Diode parameters used by [`MockTdau`] to synthesize readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiodeModel {
    pub ideality: f64,
    pub series_resistance: f64,
    pub saturation_current: f64,
    pub beta: f64,
    pub emitter_leakage: f64,
    pub base_leakage: f64,
}

impl Default for DiodeModel {
    fn default() -> Self {
        Self {
            ideality: 1.008,
            series_resistance: 2.5,
            saturation_current: 1.0e-14,
            beta: 120.0,
            emitter_leakage: 2.0e-9,
            base_leakage: 3.0e-10,
        }
    }
}

impl DiodeModel {
    /// Register values for one channel given the commanded emitter currents.
    fn readings(&self, currents: [f64; 3], temperature: f64) -> Vec<(MeasuredField, f64)> {
        let thermal_voltage = BOLTZMANN * (temperature + 273.15) / ELEMENTARY_CHARGE;
        let mut values = Vec::with_capacity(15);
        for (i, ie) in currents.iter().copied().enumerate() {
            let slot = (i + 1) as u8;
            let (vbe, ib) = if ie > 0.0 {
                let ib = ie / (self.beta + 1.0);
                let ic = ie - ib;
                let vbe = self.ideality * thermal_voltage * (ic / self.saturation_current).ln()
                    + ie * self.series_resistance;
                (vbe, ib)
            } else {
                (0.0, 0.0)
            };
            values.push((MeasuredField::Vbe(slot), vbe));
            values.push((MeasuredField::Ib(slot), ib));
            values.push((MeasuredField::IeMeasured(slot), ie));
            values.push((MeasuredField::IeLeak(slot), self.emitter_leakage));
            values.push((MeasuredField::IbLeak(slot), self.base_leakage));
        }
        values
    }
}

#[derive(Debug)]
struct MockTdauState {
    memory: Vec<u8>,
    address: Option<String>,
    writes: Vec<(u16, u8)>,
    extended_calibrations: u32,
    sco_calibrations: u32,
    disconnect_calls: u32,
    serial_number: u32,
    firmware: FirmwareVersion,
    faults: FaultState,
}

impl MockTdauState {
    fn store_float(&mut self, address: u16, value: f32) {
        let start = usize::from(address);
        self.memory[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn load_float(&self, address: u16) -> f32 {
        let start = usize::from(address);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.memory[start..start + 4]);
        f32::from_le_bytes(bytes)
    }

    fn commanded_currents(&self, channel: u8) -> [f64; 3] {
        let mut currents = [0.0; 3];
        for (i, current) in currents.iter_mut().enumerate() {
            let address = channel_address(
                COMMANDED_CURRENT_BASE,
                channel,
                (i + 1) as u8,
                RegisterStride::CURRENT,
            );
            *current = f64::from(self.load_float(address));
        }
        currents
    }

    fn in_range(address: u16, count: usize) -> Result<(), DriverError> {
        if usize::from(address) + count > MEMORY_SIZE {
            return Err(DriverError::new(
                MOCK_TDAU,
                DriverErrorKind::Rejected,
                format!("address 0x{:04X}+{} answered RANGE", address, count),
            ));
        }
        Ok(())
    }
}

/// Simulated TDAU board.
pub struct MockTdau {
    runtime: Arc<DriverRuntime>,
    claim: Option<PortClaim>,
    chamber: Chamber,
    model: DiodeModel,
    state: Arc<Mutex<MockTdauState>>,
}

/// Inspection handle for a [`MockTdau`].
#[derive(Debug, Clone)]
pub struct MockTdauHandle {
    state: Arc<Mutex<MockTdauState>>,
}

impl MockTdau {
    pub fn new(runtime: Arc<DriverRuntime>, chamber: Chamber, serial_number: u32) -> Self {
        let mut state = MockTdauState {
            memory: vec![0; MEMORY_SIZE],
            address: None,
            writes: Vec::new(),
            extended_calibrations: 0,
            sco_calibrations: 0,
            disconnect_calls: 0,
            serial_number,
            firmware: FirmwareVersion {
                major: 0x80,
                minor: 0x18,
            },
            faults: FaultState::default(),
        };
        state.store_float(IDENTITY_REGISTER, 1.0);
        Self {
            runtime,
            claim: None,
            chamber,
            model: DiodeModel::default(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_model(mut self, model: DiodeModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_fault(self, fault: MockFault) -> Self {
        self.state.lock().faults.scenarios.push(fault);
        self
    }

    pub fn handle(&self) -> MockTdauHandle {
        MockTdauHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn connected(&self) -> Result<parking_lot::MutexGuard<'_, MockTdauState>, DriverError> {
        let state = self.state.lock();
        if state.address.is_none() {
            return Err(not_open(MOCK_TDAU));
        }
        Ok(state)
    }
}

impl MockTdauHandle {
    /// Every `(address, byte)` written, in order.
    pub fn writes(&self) -> Vec<(u16, u8)> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn extended_calibrations(&self) -> u32 {
        self.state.lock().extended_calibrations
    }

    pub fn sco_calibrations(&self) -> u32 {
        self.state.lock().sco_calibrations
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.lock().disconnect_calls
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().address.is_some()
    }

    /// Commanded Ie1..3 of `channel` as currently held in board memory.
    pub fn commanded_currents(&self, channel: u8) -> [f64; 3] {
        self.state.lock().commanded_currents(channel)
    }

    /// The 8 control-word bytes.
    pub fn control_word(&self) -> Vec<u8> {
        self.state.lock().memory[..8].to_vec()
    }

    pub fn set_register(&self, address: u16, value: f32) {
        self.state.lock().store_float(address, value);
    }
}

#[async_trait]
impl DeviceDriver for MockTdau {
    fn driver_type(&self) -> &'static str {
        MOCK_TDAU
    }

    async fn connect(&mut self, address: &str) -> Result<(), DriverError> {
        self.state.lock().faults.check(MOCK_TDAU, "connect")?;
        if self.claim.is_none() {
            self.claim = Some(self.runtime.claim(address, MOCK_TDAU)?);
        }
        self.state.lock().address = Some(address.to_string());
        debug!(address, "Mock TDAU connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        state.address = None;
        self.claim = None;
        Ok(())
    }

    async fn read_memory(&self, address: u16, count: u8) -> Result<Vec<u8>, DriverError> {
        let mut state = self.connected()?;
        state.faults.check(MOCK_TDAU, "read_memory")?;
        MockTdauState::in_range(address, usize::from(count))?;
        let start = usize::from(address);
        Ok(state.memory[start..start + usize::from(count)].to_vec())
    }

    async fn read_register_word(&self, address: u16) -> Result<String, DriverError> {
        let mut state = self.connected()?;
        state.faults.check(MOCK_TDAU, "read_memory")?;
        if state.faults.malformed(address) {
            return Ok("ERR!ERR!".to_string());
        }
        MockTdauState::in_range(address, 4)?;
        let start = usize::from(address);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&state.memory[start..start + 4]);
        Ok(register_hex_from_le_bytes(bytes))
    }

    async fn write_memory(&self, address: u16, value: u8) -> Result<(), DriverError> {
        let mut state = self.connected()?;
        state.faults.check(MOCK_TDAU, "write_memory")?;
        MockTdauState::in_range(address, 1)?;
        state.memory[usize::from(address)] = value;
        state.writes.push((address, value));
        Ok(())
    }

    async fn extended_calibration(&self) -> Result<(), DriverError> {
        let temperature = self.chamber.temperature();
        let mut state = self.connected()?;
        state.faults.check(MOCK_TDAU, "extended_calibration")?;
        state.extended_calibrations += 1;

        for channel in 1..=4u8 {
            let currents = state.commanded_currents(channel);
            for (field, value) in self.model.readings(currents, temperature) {
                state.store_float(field.address(channel), value as f32);
            }
        }
        debug!(
            temperature,
            word = %float_to_register_hex(state.load_float(MeasuredField::Vbe(1).address(1))),
            "Mock TDAU calibrated"
        );
        Ok(())
    }

    async fn sco_calibration(&self) -> Result<(), DriverError> {
        let mut state = self.connected()?;
        state.faults.check(MOCK_TDAU, "sco_calibration")?;
        state.sco_calibrations += 1;
        Ok(())
    }

    async fn serial_number(&self) -> Result<u32, DriverError> {
        let mut state = self.connected()?;
        state.faults.check(MOCK_TDAU, "serial_number")?;
        Ok(state.serial_number)
    }

    async fn firmware_version(&self) -> Result<FirmwareVersion, DriverError> {
        let state = self.connected()?;
        Ok(state.firmware)
    }
}

// =============================================================================
// MockBath
// =============================================================================

#[derive(Debug, Default)]
struct MockBathState {
    address: Option<String>,
    set_points: Vec<f64>,
    queries: u32,
    close_calls: u32,
    faults: FaultState,
}

/// Simulated temperature bath.
pub struct MockBath {
    runtime: Arc<DriverRuntime>,
    claim: Option<PortClaim>,
    chamber: Chamber,
    /// Largest temperature change per query, in °C.
    ramp_per_query: f64,
    state: Arc<Mutex<MockBathState>>,
}

/// Inspection handle for a [`MockBath`].
#[derive(Debug, Clone)]
pub struct MockBathHandle {
    state: Arc<Mutex<MockBathState>>,
}

impl MockBath {
    pub fn new(runtime: Arc<DriverRuntime>, chamber: Chamber) -> Self {
        Self {
            runtime,
            claim: None,
            chamber,
            ramp_per_query: 5.0,
            state: Arc::new(Mutex::new(MockBathState::default())),
        }
    }

    pub fn with_ramp(mut self, ramp_per_query: f64) -> Self {
        self.ramp_per_query = ramp_per_query;
        self
    }

    pub fn with_fault(self, fault: MockFault) -> Self {
        self.state.lock().faults.scenarios.push(fault);
        self
    }

    pub fn handle(&self) -> MockBathHandle {
        MockBathHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl MockBathHandle {
    pub fn set_points(&self) -> Vec<f64> {
        self.state.lock().set_points.clone()
    }

    pub fn queries(&self) -> u32 {
        self.state.lock().queries
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().address.is_some()
    }
}

#[async_trait]
impl BathDriver for MockBath {
    fn driver_type(&self) -> &'static str {
        MOCK_BATH
    }

    async fn open(&mut self, address: &str, baud_rate: u32) -> Result<(), DriverError> {
        self.state.lock().faults.check(MOCK_BATH, "open")?;
        if self.claim.is_none() {
            self.claim = Some(self.runtime.claim(address, MOCK_BATH)?);
        }
        self.state.lock().address = Some(address.to_string());
        debug!(address, baud_rate, "Mock bath opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.address = None;
        self.claim = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().address.is_some()
    }

    async fn send_set_point(&self, target: f64) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.address.is_none() {
            return Err(not_open(MOCK_BATH));
        }
        state.faults.check(MOCK_BATH, "send_set_point")?;
        state.set_points.push(target);
        Ok(())
    }

    async fn query_temperature_line(&self) -> Result<String, DriverError> {
        let mut state = self.state.lock();
        if state.address.is_none() {
            return Err(not_open(MOCK_BATH));
        }
        state.faults.check(MOCK_BATH, "query_temperature")?;
        state.queries += 1;
        if state.faults.take_garbage() {
            return Ok("ERR".to_string());
        }

        let mut current = self.chamber.temperature();
        if let Some(target) = state.set_points.last().copied() {
            if !state.faults.stuck() {
                let delta = (target - current).clamp(-self.ramp_per_query, self.ramp_per_query);
                current += delta;
                self.chamber.set_temperature(current);
            }
        }
        Ok(format!("t: {:.3} C", current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdau_core::codec::register_hex_to_float;

    fn write_current(state: &mut MockTdauState, channel: u8, slot: u8, value: f32) {
        let address = channel_address(COMMANDED_CURRENT_BASE, channel, slot, RegisterStride::CURRENT);
        state.store_float(address, value);
    }

    #[tokio::test]
    async fn calibration_synthesizes_readings_from_commanded_currents() {
        let runtime = DriverRuntime::init();
        let mut board = MockTdau::new(runtime, Chamber::new(25.0), 7);
        board.connect("MOCK1").await.unwrap();
        {
            let mut state = board.state.lock();
            write_current(&mut state, 2, 1, 1e-6);
            write_current(&mut state, 2, 2, 10e-6);
            write_current(&mut state, 2, 3, 100e-6);
        }
        board.extended_calibration().await.unwrap();

        let read = |field: MeasuredField| {
            let board = &board;
            async move {
                let word = board.read_register_word(field.address(2)).await.unwrap();
                register_hex_to_float(&word).unwrap()
            }
        };
        let vbe1 = read(MeasuredField::Vbe(1)).await;
        let vbe3 = read(MeasuredField::Vbe(3)).await;
        assert!(vbe1 > 0.3 && vbe1 < 0.8, "vbe1 = {}", vbe1);
        assert!(vbe3 > vbe1);
        assert!((read(MeasuredField::IeMeasured(2)).await - 10e-6).abs() < 1e-9);
        // channel 3 had no commanded current
        let idle = board.read_register_word(MeasuredField::Vbe(1).address(3)).await.unwrap();
        assert_eq!(idle, "00000000");
    }

    #[tokio::test]
    async fn fail_after_n_calibrations() {
        let runtime = DriverRuntime::init();
        let mut board = MockTdau::new(runtime, Chamber::default(), 1).with_fault(
            MockFault::FailAfterN {
                operation: "extended_calibration",
                count: 2,
            },
        );
        board.connect("MOCK1").await.unwrap();
        board.extended_calibration().await.unwrap();
        board.extended_calibration().await.unwrap();
        assert!(board.extended_calibration().await.is_err());
        assert_eq!(board.handle().extended_calibrations(), 2);
    }

    #[tokio::test]
    async fn malformed_word_is_not_hex() {
        let runtime = DriverRuntime::init();
        let mut board = MockTdau::new(runtime, Chamber::default(), 1)
            .with_fault(MockFault::MalformedWord { address: 1124 });
        board.connect("MOCK1").await.unwrap();
        let word = board.read_register_word(1124).await.unwrap();
        assert!(register_hex_to_float(&word).is_err());
    }

    #[tokio::test]
    async fn board_requires_connection_and_claims_port() {
        let runtime = DriverRuntime::init();
        let mut board = MockTdau::new(runtime.clone(), Chamber::default(), 1);
        assert!(board.write_memory(0, 1).await.is_err());

        board.connect("COM7").await.unwrap();
        assert_eq!(runtime.claimed_ports(), vec!["COM7".to_string()]);
        board.disconnect().await.unwrap();
        assert!(runtime.claimed_ports().is_empty());
        assert_eq!(board.handle().disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn bath_ramps_toward_set_point() {
        let runtime = DriverRuntime::init();
        let chamber = Chamber::new(25.0);
        let mut bath = MockBath::new(runtime, chamber.clone()).with_ramp(10.0);
        bath.open("COM3", 2400).await.unwrap();
        bath.send_set_point(-10.0).await.unwrap();

        assert_eq!(bath.query_temperature_line().await.unwrap(), "t: 15.000 C");
        assert_eq!(bath.query_temperature_line().await.unwrap(), "t: 5.000 C");
        bath.query_temperature_line().await.unwrap();
        assert_eq!(bath.query_temperature_line().await.unwrap(), "t: -10.000 C");
        assert_eq!(chamber.temperature(), -10.0);
        assert_eq!(bath.handle().set_points(), vec![-10.0]);
    }

    #[tokio::test]
    async fn bath_garbage_then_numbers() {
        let runtime = DriverRuntime::init();
        let mut bath = MockBath::new(runtime, Chamber::new(25.0))
            .with_fault(MockFault::GarbageReplies { count: 1 });
        bath.open("COM3", 2400).await.unwrap();
        assert_eq!(bath.query_temperature_line().await.unwrap(), "ERR");
        assert_eq!(bath.query_temperature_line().await.unwrap(), "t: 25.000 C");
    }
}
