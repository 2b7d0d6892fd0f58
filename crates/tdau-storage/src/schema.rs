//! Table definitions.
//!
//! Column names follow the bench database that operators already query by
//! hand, so views and exports keep working across versions.

use sqlx::SqlitePool;

pub const PROJECT_INFO_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS Project_Info (
        Proj_Id INTEGER NOT NULL PRIMARY KEY,
        Date_Time TEXT NOT NULL,
        Name TEXT NOT NULL,
        Step TEXT,
        User_Name TEXT,
        User_Email TEXT
    )
"#;

pub const CURRENT_COMBINATION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS Current_Combination (
        Current_Com INTEGER NOT NULL,
        Proj_Id INTEGER NOT NULL REFERENCES Project_Info(Proj_Id),
        Ie1 REAL NOT NULL,
        Ie2 REAL NOT NULL,
        Ie3 REAL NOT NULL,
        PRIMARY KEY (Current_Com, Proj_Id)
    )
"#;

/// One row per diode channel; `com_port` is the owning board's address.
pub const TDAU_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS TDAU (
        Diode_Id INTEGER NOT NULL,
        Proj_Id INTEGER NOT NULL REFERENCES Project_Info(Proj_Id),
        com_port TEXT NOT NULL,
        channel INTEGER NOT NULL,
        SN INTEGER,
        PRIMARY KEY (Diode_Id, Proj_Id)
    )
"#;

pub const TEST_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS Test (
        Test_Id INTEGER NOT NULL,
        Proj_Id INTEGER NOT NULL REFERENCES Project_Info(Proj_Id),
        Diode_Id INTEGER NOT NULL,
        Current_Com INTEGER NOT NULL,
        Temperature REAL NOT NULL,
        Voltage REAL,
        Vbe1 REAL, Ib1 REAL, Vbe2 REAL, Ib2 REAL, Vbe3 REAL, Ib3 REAL,
        Ie1_measured REAL, Ie2_measured REAL, Ie3_measured REAL,
        Ic1 REAL, Ic2 REAL, Ic3 REAL,
        Ie1_leak REAL, Ie2_leak REAL, Ie3_leak REAL,
        Ib1_leak REAL, Ib2_leak REAL, Ib3_leak REAL,
        RS REAL, Idea REAL,
        PRIMARY KEY (Test_Id, Proj_Id)
    )
"#;

/// Create every table in dependency order. Safe to run on an existing store.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for ddl in [
        PROJECT_INFO_TABLE,
        CURRENT_COMBINATION_TABLE,
        TDAU_TABLE,
        TEST_TABLE,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
