//! SQLite implementation of [`TestStore`].

use crate::schema::init_schema;
use crate::store::{ProjectRow, TestStore};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tdau_core::model::{
    CurrentCombination, DerivationInput, DiodeUnit, MeasuredField, PlanRow, ProjectInfo,
    RawMeasurements, TestRow,
};
use tdau_core::{AppResult, BenchError};
use tracing::{debug, info};

fn storage(e: sqlx::Error) -> BenchError {
    BenchError::Storage(e.to_string())
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

/// Store backed by a SQLite database file or an in-memory database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a store from a URL: `sqlite::memory:`, `sqlite://path`, or a bare path.
    pub async fn connect(url: &str) -> AppResult<Self> {
        if url == ":memory:" || url.starts_with("sqlite::memory:") {
            return Self::in_memory().await;
        }
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        Self::open(path).await
    }

    /// Open (and create if missing) a database file.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BenchError::Storage(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;

        info!(path = %path.display(), "SQLite store opened");
        Self::from_pool(pool).await
    }

    /// Private in-memory database. Lives as long as the store.
    pub async fn in_memory() -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(storage)?
            .foreign_keys(true);
        // Every connection to :memory: is a separate database; keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the tables if needed.
    pub async fn from_pool(pool: SqlitePool) -> AppResult<Self> {
        init_schema(&pool).await.map_err(storage)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `{name}_{yyyyMMdd_HHmm}` with everything but ASCII alphanumerics replaced by `_`.
pub fn view_name(name: &str, at: DateTime<Local>) -> String {
    let mut base: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if base.is_empty() {
        base.push_str("project");
    }
    format!("{}_{}", base, at.format("%Y%m%d_%H%M"))
}

const PROJECT_ROW_SELECT: &str = r#"
    SELECT t.Test_Id, t.Diode_Id, u.com_port, u.channel, u.SN, t.Current_Com,
           t.Temperature, t.Voltage, c.Ie1, c.Ie2, c.Ie3,
           t.Vbe1, t.Vbe2, t.Vbe3, t.Ib1, t.Ib2, t.Ib3,
           t.Ie1_measured, t.Ie2_measured, t.Ie3_measured,
           t.Ie1_leak, t.Ie2_leak, t.Ie3_leak, t.Ib1_leak, t.Ib2_leak, t.Ib3_leak,
           t.Ic1, t.Ic2, t.Ic3, t.RS, t.Idea
    FROM Test t
    JOIN Current_Combination c ON c.Current_Com = t.Current_Com AND c.Proj_Id = t.Proj_Id
    JOIN TDAU u ON u.Diode_Id = t.Diode_Id AND u.Proj_Id = t.Proj_Id
    WHERE t.Proj_Id = ?
    ORDER BY t.Test_Id
"#;

fn channel_of(row: &SqliteRow, column: &str) -> Result<u8, sqlx::Error> {
    let channel: i64 = row.try_get(column)?;
    u8::try_from(channel).map_err(|_| decode_error(format!("channel {} out of range", channel)))
}

fn serial_of(row: &SqliteRow, column: &str) -> Result<Option<u32>, sqlx::Error> {
    let serial: Option<i64> = row.try_get(column)?;
    serial
        .map(|sn| u32::try_from(sn).map_err(|_| decode_error(format!("SN {} out of range", sn))))
        .transpose()
}

fn project_info_from(row: &SqliteRow) -> Result<ProjectInfo, sqlx::Error> {
    let stamp: String = row.try_get("Date_Time")?;
    let date_time = DateTime::parse_from_rfc3339(&stamp)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
        .with_timezone(&Local);
    Ok(ProjectInfo {
        proj_id: row.try_get("Proj_Id")?,
        date_time,
        name: row.try_get("Name")?,
        step: row.try_get::<Option<String>, _>("Step")?.unwrap_or_default(),
        user_name: row.try_get::<Option<String>, _>("User_Name")?.unwrap_or_default(),
        user_email: row.try_get::<Option<String>, _>("User_Email")?.unwrap_or_default(),
    })
}

fn plan_row_from(row: &SqliteRow) -> Result<PlanRow, sqlx::Error> {
    Ok(PlanRow {
        test_id: row.try_get("Test_Id")?,
        proj_id: row.try_get("Proj_Id")?,
        diode_id: row.try_get("Diode_Id")?,
        address: row.try_get("com_port")?,
        channel: channel_of(row, "channel")?,
        temperature: row.try_get("Temperature")?,
        currents: [row.try_get("Ie1")?, row.try_get("Ie2")?, row.try_get("Ie3")?],
    })
}

fn derivation_input_from(row: &SqliteRow) -> Result<DerivationInput, sqlx::Error> {
    Ok(DerivationInput {
        test_id: row.try_get("Test_Id")?,
        temperature: row.try_get("Temperature")?,
        vbe: [row.try_get("Vbe1")?, row.try_get("Vbe2")?, row.try_get("Vbe3")?],
        ie_measured: [
            row.try_get("Ie1_measured")?,
            row.try_get("Ie2_measured")?,
            row.try_get("Ie3_measured")?,
        ],
        ic: [row.try_get("Ic1")?, row.try_get("Ic2")?, row.try_get("Ic3")?],
    })
}

fn project_row_from(row: &SqliteRow) -> Result<ProjectRow, sqlx::Error> {
    let mut raw = RawMeasurements::default();
    for field in MeasuredField::ALL {
        if let Some(value) = row.try_get::<Option<f64>, _>(field.column())? {
            raw.set(field, value);
        }
    }
    Ok(ProjectRow {
        test_id: row.try_get("Test_Id")?,
        diode_id: row.try_get("Diode_Id")?,
        address: row.try_get("com_port")?,
        channel: channel_of(row, "channel")?,
        serial_number: serial_of(row, "SN")?,
        current_com: row.try_get("Current_Com")?,
        temperature: row.try_get("Temperature")?,
        voltage: row.try_get("Voltage")?,
        currents: [row.try_get("Ie1")?, row.try_get("Ie2")?, row.try_get("Ie3")?],
        raw,
        ic: [row.try_get("Ic1")?, row.try_get("Ic2")?, row.try_get("Ic3")?],
        rs: row.try_get("RS")?,
        idea: row.try_get("Idea")?,
    })
}

#[async_trait]
impl TestStore for SqliteStore {
    async fn max_proj_id(&self) -> AppResult<Option<i64>> {
        let row = sqlx::query("SELECT MAX(Proj_Id) AS max_id FROM Project_Info")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        row.try_get("max_id").map_err(storage)
    }

    async fn insert_project(&self, info: &ProjectInfo) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO Project_Info (Proj_Id, Date_Time, Name, Step, User_Name, User_Email)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(info.proj_id)
        .bind(info.date_time.to_rfc3339())
        .bind(&info.name)
        .bind(&info.step)
        .bind(&info.user_name)
        .bind(&info.user_email)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        debug!(proj_id = info.proj_id, name = %info.name, "Project inserted");
        Ok(())
    }

    async fn project_info(&self, proj_id: i64) -> AppResult<Option<ProjectInfo>> {
        let row = sqlx::query("SELECT * FROM Project_Info WHERE Proj_Id = ?")
            .bind(proj_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref()
            .map(project_info_from)
            .transpose()
            .map_err(storage)
    }

    async fn insert_combinations(
        &self,
        proj_id: i64,
        combinations: &[CurrentCombination],
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for combination in combinations {
            sqlx::query(
                r#"INSERT INTO Current_Combination (Current_Com, Proj_Id, Ie1, Ie2, Ie3)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(combination.id)
            .bind(proj_id)
            .bind(combination.ie1)
            .bind(combination.ie2)
            .bind(combination.ie3)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn insert_units(&self, proj_id: i64, units: &[DiodeUnit]) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for unit in units {
            sqlx::query(
                r#"INSERT INTO TDAU (Diode_Id, Proj_Id, com_port, channel, SN)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(unit.diode_id)
            .bind(proj_id)
            .bind(&unit.address)
            .bind(i64::from(unit.channel))
            .bind(unit.serial_number.map(i64::from))
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn update_unit_serial(
        &self,
        proj_id: i64,
        address: &str,
        serial: u32,
    ) -> AppResult<u64> {
        let result = sqlx::query("UPDATE TDAU SET SN = ? WHERE Proj_Id = ? AND com_port = ?")
            .bind(i64::from(serial))
            .bind(proj_id)
            .bind(address)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn insert_rows(&self, rows: &[TestRow]) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for row in rows {
            sqlx::query(
                r#"INSERT INTO Test (Test_Id, Proj_Id, Diode_Id, Current_Com, Temperature, Voltage)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(row.test_id)
            .bind(row.proj_id)
            .bind(row.diode_id)
            .bind(row.current_com)
            .bind(row.temperature)
            .bind(row.voltage)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        debug!(rows = rows.len(), "Plan rows inserted");
        Ok(())
    }

    async fn plan_rows(&self, proj_id: i64) -> AppResult<Vec<PlanRow>> {
        let rows = sqlx::query(
            r#"SELECT t.Test_Id, t.Proj_Id, t.Diode_Id, u.com_port, u.channel,
                      c.Ie1, c.Ie2, c.Ie3, t.Temperature
               FROM Test t
               JOIN Current_Combination c ON c.Current_Com = t.Current_Com AND c.Proj_Id = t.Proj_Id
               JOIN TDAU u ON u.Diode_Id = t.Diode_Id AND u.Proj_Id = t.Proj_Id
               WHERE t.Proj_Id = ?
               ORDER BY t.Temperature, t.Test_Id"#,
        )
        .bind(proj_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter()
            .map(plan_row_from)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn update_measurements(
        &self,
        proj_id: i64,
        test_id: i64,
        raw: &RawMeasurements,
    ) -> AppResult<()> {
        let assignments: Vec<String> = MeasuredField::ALL
            .iter()
            .map(|field| format!("{} = ?", field.column()))
            .collect();
        let sql = format!(
            "UPDATE Test SET {} WHERE Proj_Id = ? AND Test_Id = ?",
            assignments.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in raw.iter() {
            query = query.bind(value);
        }
        let result = query
            .bind(proj_id)
            .bind(test_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(BenchError::Storage(format!(
                "no Test row {} in project {}",
                test_id, proj_id
            )));
        }
        Ok(())
    }

    async fn update_ic(&self, proj_id: i64) -> AppResult<u64> {
        let result = sqlx::query(
            r#"UPDATE Test SET
                 Ic1 = CASE WHEN Ie1_measured IS NOT NULL AND Ib1 IS NOT NULL
                            THEN Ie1_measured - Ib1 ELSE Ic1 END,
                 Ic2 = CASE WHEN Ie2_measured IS NOT NULL AND Ib2 IS NOT NULL
                            THEN Ie2_measured - Ib2 ELSE Ic2 END,
                 Ic3 = CASE WHEN Ie3_measured IS NOT NULL AND Ib3 IS NOT NULL
                            THEN Ie3_measured - Ib3 ELSE Ic3 END
               WHERE Proj_Id = ?
                 AND ((Ie1_measured IS NOT NULL AND Ib1 IS NOT NULL)
                   OR (Ie2_measured IS NOT NULL AND Ib2 IS NOT NULL)
                   OR (Ie3_measured IS NOT NULL AND Ib3 IS NOT NULL))"#,
        )
        .bind(proj_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn derivation_rows(&self, proj_id: i64) -> AppResult<Vec<DerivationInput>> {
        let rows = sqlx::query(
            r#"SELECT Test_Id, Temperature, Vbe1, Vbe2, Vbe3,
                      Ie1_measured, Ie2_measured, Ie3_measured, Ic1, Ic2, Ic3
               FROM Test WHERE Proj_Id = ? ORDER BY Test_Id"#,
        )
        .bind(proj_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter()
            .map(derivation_input_from)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }

    async fn update_derived(
        &self,
        proj_id: i64,
        test_id: i64,
        rs: f64,
        idea: f64,
    ) -> AppResult<()> {
        sqlx::query("UPDATE Test SET RS = ?, Idea = ? WHERE Proj_Id = ? AND Test_Id = ?")
            .bind(rs)
            .bind(idea)
            .bind(proj_id)
            .bind(test_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn create_project_view(
        &self,
        proj_id: i64,
        name: &str,
        at: DateTime<Local>,
    ) -> AppResult<String> {
        let view = view_name(name, at);
        // Views cannot take bound parameters; proj_id is an integer and the
        // name is restricted to [A-Za-z0-9_].
        let sql = format!(
            r#"CREATE VIEW "{view}" AS
               SELECT t.Test_Id, t.Proj_Id, u.SN, u.com_port AS Unit, u.channel, t.Diode_Id,
                      t.Current_Com, t.Temperature, t.Voltage, c.Ie1, c.Ie2, c.Ie3,
                      t.Vbe1, t.Ib1, t.Vbe2, t.Ib2, t.Vbe3, t.Ib3,
                      t.Ie1_measured, t.Ie2_measured, t.Ie3_measured, t.Ic1, t.Ic2, t.Ic3,
                      t.Ie1_leak, t.Ie2_leak, t.Ie3_leak, t.Ib1_leak, t.Ib2_leak, t.Ib3_leak,
                      t.RS, t.Idea
               FROM Test t
               JOIN Current_Combination c ON c.Current_Com = t.Current_Com AND c.Proj_Id = t.Proj_Id
               JOIN TDAU u ON u.Diode_Id = t.Diode_Id AND u.Proj_Id = t.Proj_Id
               WHERE t.Proj_Id = {proj_id}"#
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        info!(proj_id, view = %view, "Project view created");
        Ok(view)
    }

    async fn project_rows(&self, proj_id: i64) -> AppResult<Vec<ProjectRow>> {
        let rows = sqlx::query(PROJECT_ROW_SELECT)
            .bind(proj_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter()
            .map(project_row_from)
            .collect::<Result<_, _>>()
            .map_err(storage)
    }
}
