//! Store interface consumed by the run engine and the derivation pass.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tdau_core::model::{
    CurrentCombination, DerivationInput, DiodeUnit, PlanRow, ProjectInfo, RawMeasurements,
    TestRow,
};
use tdau_core::AppResult;

/// A fully joined Test row, as exported by the project view.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRow {
    pub test_id: i64,
    pub diode_id: i64,
    pub address: String,
    pub channel: u8,
    pub serial_number: Option<u32>,
    pub current_com: i64,
    pub temperature: f64,
    pub voltage: Option<f64>,
    pub currents: [f64; 3],
    pub raw: RawMeasurements,
    pub ic: [Option<f64>; 3],
    pub rs: Option<f64>,
    pub idea: Option<f64>,
}

/// Persistent store for projects, plans and measurements.
///
/// Every method is a single statement or a single batch; the run engine relies
/// on rows written before a failure staying written.
#[async_trait]
pub trait TestStore: Send + Sync {
    /// Highest project id in the store, `None` when empty.
    async fn max_proj_id(&self) -> AppResult<Option<i64>>;

    /// Id for a new project: max + 1, or 0 for an empty store.
    async fn next_proj_id(&self) -> AppResult<i64> {
        Ok(self.max_proj_id().await?.map_or(0, |max| max + 1))
    }

    async fn insert_project(&self, info: &ProjectInfo) -> AppResult<()>;

    async fn project_info(&self, proj_id: i64) -> AppResult<Option<ProjectInfo>>;

    async fn insert_combinations(
        &self,
        proj_id: i64,
        combinations: &[CurrentCombination],
    ) -> AppResult<()>;

    async fn insert_units(&self, proj_id: i64, units: &[DiodeUnit]) -> AppResult<()>;

    /// Record a board's serial number on all of its units. Returns the unit count.
    async fn update_unit_serial(&self, proj_id: i64, address: &str, serial: u32)
        -> AppResult<u64>;

    async fn insert_rows(&self, rows: &[TestRow]) -> AppResult<()>;

    /// Plan rows joined with their currents and unit, ordered by
    /// (temperature, test_id).
    async fn plan_rows(&self, proj_id: i64) -> AppResult<Vec<PlanRow>>;

    /// Write the 15 raw fields of one row. `None` values are stored as NULL.
    async fn update_measurements(
        &self,
        proj_id: i64,
        test_id: i64,
        raw: &RawMeasurements,
    ) -> AppResult<()>;

    /// `Ic_n = Ie_n_measured - Ib_n` where both are present. Returns the number
    /// of rows with at least one such pair.
    async fn update_ic(&self, proj_id: i64) -> AppResult<u64>;

    async fn derivation_rows(&self, proj_id: i64) -> AppResult<Vec<DerivationInput>>;

    async fn update_derived(&self, proj_id: i64, test_id: i64, rs: f64, idea: f64)
        -> AppResult<()>;

    /// Create the flat view `{name}_{yyyyMMdd_HHmm}` for a project and return
    /// its name.
    async fn create_project_view(
        &self,
        proj_id: i64,
        name: &str,
        at: DateTime<Local>,
    ) -> AppResult<String>;

    async fn project_rows(&self, proj_id: i64) -> AppResult<Vec<ProjectRow>>;
}
