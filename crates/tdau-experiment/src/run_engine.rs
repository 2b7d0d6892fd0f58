//! RunEngine - sequencing of one characterization run.
//!
//! The engine turns a validated [`BenchConfig`] into a persisted test plan, then
//! walks the plan against the hardware and stores the raw readings row by row.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   run()   ┌──────────────┐  plan stored,   ┌─────────┐
//! │ Idle │──────────▶│ Initializing │────────────────▶│ Running │
//! └──────┘           └──────┬───────┘  devices ready  └────┬────┘
//!    ▲                      │ error                        │ done, error
//!    │                      ▼                              │ or abort()
//!    │               ┌────────────┐                        │
//!    └───────────────│ Finalizing │◀───────────────────────┘
//!                    └────────────┘
//! ```
//!
//! Finalizing always runs: the bath is parked at 25 °C and closed, every board
//! is disconnected and the driver runtime is shut down. When the run itself
//! failed, finalization is best effort and the run's error is returned.
//!
//! Rows are measured in (temperature, test_id) order and each row is stored as
//! soon as it is read, so a failed run keeps every row completed before the
//! failure.

use crate::config::{BenchConfig, DeviceConfig};
use crate::factory::DriverFactory;
use crate::plans::TestPlan;
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;
use tdau_core::codec::COMMANDED_CURRENT_BASE;
use tdau_core::model::{MeasuredField, PlanRow, RawMeasurements};
use tdau_core::{AppResult, BenchError};
use tdau_hardware::{BathSession, DeviceSession, DriverRuntime};
use tdau_storage::TestStore;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run in progress
    Idle,
    /// Validating, storing the plan and opening devices
    Initializing,
    /// Walking plan rows
    Running,
    /// Releasing the bath, boards and runtime
    Finalizing,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Initializing => write!(f, "initializing"),
            EngineState::Running => write!(f, "running"),
            EngineState::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Outcome of a completed (or aborted) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub proj_id: i64,
    pub rows_total: usize,
    pub rows_measured: usize,
    /// Rows on channels the device family does not populate.
    pub rows_skipped: usize,
    /// Register reads that did not decode and were stored as NULL.
    pub fields_failed: usize,
    pub aborted: bool,
}

struct Board {
    config: DeviceConfig,
    session: DeviceSession,
}

/// Sessions opened for one run.
struct Bench {
    runtime: Arc<DriverRuntime>,
    bath: BathSession,
    boards: Vec<Board>,
}

impl Bench {
    fn new(config: &BenchConfig, factory: &dyn DriverFactory) -> Self {
        let runtime = DriverRuntime::init();
        let bath = BathSession::new(factory.bath(&runtime), config.bath.policy);
        let boards = config
            .devices
            .iter()
            .map(|device| Board {
                config: device.clone(),
                session: DeviceSession::new(factory.device(&runtime, &device.address)),
            })
            .collect();
        Self {
            runtime,
            bath,
            boards,
        }
    }

    fn board(&self, address: &str) -> AppResult<&Board> {
        self.boards
            .iter()
            .find(|b| b.config.address == address)
            .ok_or_else(|| {
                BenchError::Configuration(format!("plan references unknown board {}", address))
            })
    }

    /// Park and close the bath, disconnect every board, stop the runtime.
    /// Every step is attempted; the first error is returned.
    async fn release(&mut self) -> AppResult<()> {
        let mut first_error = None;
        let mut keep = |result: AppResult<()>, step: &str| {
            if let Err(e) = result {
                warn!(step, error = %e, "Finalization step failed");
                first_error.get_or_insert(e);
            }
        };

        if self.bath.is_open() {
            keep(self.bath.set_default().await, "park bath");
        }
        keep(self.bath.close().await, "close bath");
        for board in &mut self.boards {
            keep(board.session.disconnect().await, "disconnect board");
        }

        let leaked = self.runtime.shutdown();
        if !leaked.is_empty() {
            warn!(?leaked, "Ports still claimed at shutdown");
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Orchestrates runs against a store and a driver factory.
pub struct RunEngine {
    state: RwLock<EngineState>,
    store: Arc<dyn TestStore>,
    factory: Arc<dyn DriverFactory>,
    abort_requested: watch::Sender<bool>,
}

impl RunEngine {
    pub fn new(store: Arc<dyn TestStore>, factory: Arc<dyn DriverFactory>) -> Self {
        let (abort_requested, _) = watch::channel(false);
        Self {
            state: RwLock::new(EngineState::Idle),
            store,
            factory,
            abort_requested,
        }
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    async fn set_state(&self, next: EngineState) {
        let mut state = self.state.write().await;
        debug!(from = %*state, to = %next, "Engine state change");
        *state = next;
    }

    /// Stop the current run before its next row or bath move.
    ///
    /// The run still finalizes and returns a summary with `aborted` set.
    pub fn abort(&self) {
        info!("Abort requested");
        self.abort_requested.send_replace(true);
    }

    fn is_abort_requested(&self) -> bool {
        *self.abort_requested.borrow()
    }

    /// Execute one full run.
    ///
    /// # Errors
    ///
    /// [`BenchError::Configuration`] before any I/O if the configuration is
    /// invalid or a run is already in progress; otherwise the first fatal error
    /// of initialization or measurement.
    pub async fn run(&self, config: &BenchConfig) -> AppResult<RunSummary> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Idle {
                return Err(BenchError::Configuration(format!(
                    "run engine is {}",
                    *state
                )));
            }
            *state = EngineState::Initializing;
        }
        self.abort_requested.send_replace(false);

        if let Err(e) = config.validate() {
            self.set_state(EngineState::Idle).await;
            return Err(e);
        }

        let mut bench = Bench::new(config, self.factory.as_ref());
        let outcome = match self.initialize(config, &mut bench).await {
            Ok(summary) => {
                self.set_state(EngineState::Running).await;
                self.measure(&bench, summary).await
            }
            Err(e) => Err(e),
        };

        self.set_state(EngineState::Finalizing).await;
        let released = bench.release().await;
        self.set_state(EngineState::Idle).await;

        match (outcome, released) {
            (Ok(summary), Ok(())) => {
                info!(
                    proj_id = summary.proj_id,
                    measured = summary.rows_measured,
                    skipped = summary.rows_skipped,
                    fields_failed = summary.fields_failed,
                    aborted = summary.aborted,
                    "Run finished"
                );
                Ok(summary)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, "Finalization after failed run reported an error");
                }
                error!(error = %e, "Run failed");
                Err(e)
            }
        }
    }

    /// Store the plan, open the bath and prepare every board.
    async fn initialize(&self, config: &BenchConfig, bench: &mut Bench) -> AppResult<RunSummary> {
        let proj_id = self.store.next_proj_id().await?;
        let plan = TestPlan::build(config, proj_id, Local::now())?;

        self.store.insert_project(&plan.project).await?;
        self.store
            .insert_combinations(proj_id, &plan.combinations)
            .await?;
        self.store.insert_units(proj_id, &plan.units).await?;
        self.store.insert_rows(&plan.rows).await?;
        info!(
            proj_id,
            temperatures = plan.sweep.len(),
            combinations = plan.combinations.len(),
            units = plan.units.len(),
            rows = plan.rows.len(),
            "Test plan stored"
        );

        bench
            .bath
            .open(&config.bath.address, config.bath.baud_rate)
            .await?;

        for board in &mut bench.boards {
            let address = board.config.address.clone();
            board.session.connect(&address).await?;
            if let Some(serial) = board.session.serial_number() {
                self.store
                    .update_unit_serial(proj_id, &address, serial)
                    .await?;
            }
            board
                .session
                .write_control_word(board.config.profile)
                .await?;
        }

        Ok(RunSummary {
            proj_id,
            rows_total: plan.rows.len(),
            ..RunSummary::default()
        })
    }

    async fn measure(&self, bench: &Bench, mut summary: RunSummary) -> AppResult<RunSummary> {
        let proj_id = summary.proj_id;
        let rows = self.store.plan_rows(proj_id).await?;
        let mut abort_rx = self.abort_requested.subscribe();
        let mut current_temperature: Option<f64> = None;

        for row in &rows {
            if self.is_abort_requested() {
                summary.aborted = true;
                break;
            }

            let board = bench.board(&row.address)?;
            if board.config.family.skips(row.channel) {
                debug!(test_id = row.test_id, address = %row.address, channel = row.channel, "Channel not populated, skipping row");
                summary.rows_skipped += 1;
                continue;
            }

            if current_temperature != Some(row.temperature) {
                info!(temperature = row.temperature, "Moving bath");
                tokio::select! {
                    result = bench.bath.set_temperature(row.temperature) => result?,
                    _ = abort_rx.wait_for(|aborted| *aborted) => {
                        summary.aborted = true;
                        break;
                    }
                }
                current_temperature = Some(row.temperature);
            }

            summary.fields_failed += measure_row(&board.session, row, self.store.as_ref()).await?;
            summary.rows_measured += 1;
        }

        if summary.aborted {
            warn!(
                proj_id,
                measured = summary.rows_measured,
                "Run aborted before the last row"
            );
        }
        Ok(summary)
    }
}

/// Drive, calibrate and read one row, then store it. Returns the number of
/// fields that did not decode.
async fn measure_row(
    session: &DeviceSession,
    row: &PlanRow,
    store: &dyn TestStore,
) -> AppResult<usize> {
    for (slot, current) in (1u8..).zip(row.currents) {
        session
            .write_channel_value(COMMANDED_CURRENT_BASE, row.channel, slot, current as f32)
            .await?;
    }
    session.calibrate().await?;

    let mut raw = RawMeasurements::default();
    let mut failed = 0;
    for field in MeasuredField::ALL {
        match session.read_register_float(field.address(row.channel)).await {
            Ok(value) => raw.set(field, f64::from(value)),
            Err(e) if e.is_recoverable() => {
                warn!(test_id = row.test_id, field = field.column(), error = %e, "Register did not decode, storing NULL");
                failed += 1;
            }
            Err(e) => return Err(e),
        }
    }

    store
        .update_measurements(row.proj_id, row.test_id, &raw)
        .await?;
    debug!(test_id = row.test_id, channel = row.channel, failed, "Row stored");
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::factory::MockDriverFactory;
    use serial_test::serial;
    use tdau_hardware::drivers::mock::{Chamber, MockFault};
    use tdau_storage::SqliteStore;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    #[serial]
    async fn undecodable_register_is_stored_as_null() {
        let config = BenchConfig::from_toml_str(SAMPLE).unwrap();
        let bad_address = MeasuredField::Vbe(2).address(1);
        let factory = Arc::new(
            MockDriverFactory::new(Chamber::new(25.0))
                .with_device_fault("COM5", MockFault::MalformedWord { address: bad_address }),
        );
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let engine = RunEngine::new(store.clone(), factory);

        let summary = engine.run(&config).await.unwrap();
        // COM5 channel 1: three temperatures × two combinations.
        assert_eq!(summary.fields_failed, 6);
        // COM4 channel 4 is not populated on a three-diode board.
        assert_eq!(summary.rows_skipped, 6);
        assert_eq!(summary.rows_measured, summary.rows_total - 6);
        assert!(logs_contain("storing NULL"));

        for row in store.project_rows(summary.proj_id).await.unwrap() {
            let vbe2 = row.raw.get(MeasuredField::Vbe(2));
            match (row.address.as_str(), row.channel) {
                ("COM5", 1) | ("COM4", 4) => assert_eq!(vbe2, None),
                _ => assert!(vbe2.is_some()),
            }
        }
    }

    #[test]
    fn state_display() {
        let labels: Vec<String> = [
            EngineState::Idle,
            EngineState::Initializing,
            EngineState::Running,
            EngineState::Finalizing,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(labels, ["idle", "initializing", "running", "finalizing"]);
    }
}
