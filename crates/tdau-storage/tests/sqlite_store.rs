use chrono::{Local, TimeZone};
use tdau_core::model::{
    CurrentCombination, DiodeUnit, MeasuredField, ProjectInfo, RawMeasurements, TestRow,
};
use tdau_core::BenchError;
use tdau_storage::{SqliteStore, TestStore};

fn project(proj_id: i64) -> ProjectInfo {
    ProjectInfo {
        proj_id,
        date_time: Local.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap(),
        name: "lot42".into(),
        step: "qual".into(),
        user_name: "bench".into(),
        user_email: "bench@example.com".into(),
    }
}

fn unit(diode_id: i64, address: &str, channel: u8) -> DiodeUnit {
    DiodeUnit {
        diode_id,
        address: address.into(),
        channel,
        serial_number: None,
    }
}

fn row(test_id: i64, diode_id: i64, current_com: i64, temperature: f64) -> TestRow {
    TestRow {
        test_id,
        proj_id: 0,
        diode_id,
        current_com,
        temperature,
        voltage: 3.3,
    }
}

/// Project 0 with two combinations, two units on one board and 4 rows over two
/// temperatures, inserted with test ids out of temperature order.
async fn seeded() -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert_project(&project(0)).await.unwrap();
    store
        .insert_combinations(
            0,
            &[
                CurrentCombination { id: 1, ie1: 1e-6, ie2: 10e-6, ie3: 100e-6 },
                CurrentCombination { id: 2, ie1: 2e-6, ie2: 20e-6, ie3: 200e-6 },
            ],
        )
        .await
        .unwrap();
    store
        .insert_units(0, &[unit(1, "COM4", 1), unit(2, "COM4", 2)])
        .await
        .unwrap();
    store
        .insert_rows(&[
            row(1, 1, 1, 50.0),
            row(2, 2, 2, 50.0),
            row(3, 1, 1, -10.0),
            row(4, 2, 1, -10.0),
        ])
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn project_ids_increment() {
    let store = seeded().await;
    assert_eq!(store.max_proj_id().await.unwrap(), Some(0));
    assert_eq!(store.next_proj_id().await.unwrap(), 1);

    let info = store.project_info(0).await.unwrap().unwrap();
    assert_eq!(info, project(0));
    assert!(store.project_info(9).await.unwrap().is_none());
}

#[tokio::test]
async fn plan_rows_are_ordered_by_temperature_then_test_id() {
    let store = seeded().await;
    let rows = store.plan_rows(0).await.unwrap();

    let order: Vec<i64> = rows.iter().map(|r| r.test_id).collect();
    assert_eq!(order, vec![3, 4, 1, 2]);
    assert_eq!(rows[0].address, "COM4");
    assert_eq!(rows[1].channel, 2);
    assert_eq!(rows[3].currents, [2e-6, 20e-6, 200e-6]);
}

#[tokio::test]
async fn measurements_update_by_key_and_keep_nulls() {
    let store = seeded().await;
    let mut raw = RawMeasurements::default();
    raw.set(MeasuredField::Vbe(1), 0.61);
    raw.set(MeasuredField::IeMeasured(1), 1.0e-6);
    raw.set(MeasuredField::Ib(1), 1.0e-8);
    store.update_measurements(0, 3, &raw).await.unwrap();

    let rows = store.project_rows(0).await.unwrap();
    let measured = rows.iter().find(|r| r.test_id == 3).unwrap();
    assert_eq!(measured.raw.get(MeasuredField::Vbe(1)), Some(0.61));
    assert_eq!(measured.raw.get(MeasuredField::Vbe(2)), None);
    assert_eq!(measured.raw.missing(), 12);
    assert!(rows.iter().filter(|r| r.test_id != 3).all(|r| r.raw.missing() == 15));

    let err = store.update_measurements(0, 99, &raw).await.unwrap_err();
    assert!(matches!(err, BenchError::Storage(_)));
}

#[tokio::test]
async fn ic_is_only_set_where_inputs_exist() {
    let store = seeded().await;
    let mut raw = RawMeasurements::default();
    raw.set(MeasuredField::IeMeasured(1), 1.0e-6);
    raw.set(MeasuredField::Ib(1), 1.0e-8);
    raw.set(MeasuredField::IeMeasured(2), 1.0e-5);
    store.update_measurements(0, 1, &raw).await.unwrap();

    assert_eq!(store.update_ic(0).await.unwrap(), 1);
    let inputs = store.derivation_rows(0).await.unwrap();
    let first = inputs.iter().find(|r| r.test_id == 1).unwrap();
    assert!((first.ic[0].unwrap() - 0.99e-6).abs() < 1e-15);
    assert_eq!(first.ic[1], None);
    assert_eq!(first.ic[2], None);
    assert_eq!(first.temperature, 50.0);
}

#[tokio::test]
async fn serial_numbers_are_recorded_per_board() {
    let store = seeded().await;
    assert_eq!(store.update_unit_serial(0, "COM4", 0xBEEF).await.unwrap(), 2);
    assert_eq!(store.update_unit_serial(0, "COM9", 1).await.unwrap(), 0);

    let rows = store.project_rows(0).await.unwrap();
    assert!(rows.iter().all(|r| r.serial_number == Some(0xBEEF)));
}

#[tokio::test]
async fn derived_values_and_view() {
    let store = seeded().await;
    store.update_derived(0, 2, 2.5, 1.008).await.unwrap();

    let at = Local.with_ymd_and_hms(2024, 5, 2, 17, 45, 0).unwrap();
    let view = store.create_project_view(0, "lot42", at).await.unwrap();
    assert_eq!(view, "lot42_20240502_1745");

    let count: i64 = sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM "{}""#, view))
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 4);
    let (rs, idea): (Option<f64>, Option<f64>) =
        sqlx::query_as(&format!(r#"SELECT RS, Idea FROM "{}" WHERE Test_Id = 2"#, view))
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(rs, Some(2.5));
    assert_eq!(idea, Some(1.008));
}

#[tokio::test]
async fn file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("bench.db");

    {
        let store = SqliteStore::open(&path).await.unwrap();
        store.insert_project(&project(0)).await.unwrap();
        store.pool().close().await;
    }
    let url = format!("sqlite://{}", path.display());
    let store = SqliteStore::connect(&url).await.unwrap();
    assert_eq!(store.next_proj_id().await.unwrap(), 1);
}
