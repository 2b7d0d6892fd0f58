//! End-to-end runs against the simulated bench and an in-memory store.

use std::sync::Arc;
use std::time::Duration;
use tdau_core::codec::{channel_address, RegisterStride, COMMANDED_CURRENT_BASE};
use tdau_core::BenchError;
use tdau_experiment::config::{
    BathConfig, LoggingConfig, PlanConfig, ProjectConfig, StorageConfig, SweepConfig,
};
use tdau_experiment::{
    derive_project, BenchConfig, DeviceConfig, DeviceFamily, EngineState, MockDriverFactory,
    RunEngine, SweepMode,
};
use tdau_hardware::drivers::mock::{Chamber, MockFault};
use tdau_hardware::{BathPolicy, ControlProfile};
use tdau_storage::{SqliteStore, TestStore};

fn device(address: &str, family: DeviceFamily, channels: &[u8]) -> DeviceConfig {
    DeviceConfig {
        address: address.into(),
        family,
        channels: channels.to_vec(),
        profile: ControlProfile::LeakageEnabled,
    }
}

fn config(
    sweep: (f64, f64, f64),
    ie1_ua: &[f64],
    devices: Vec<DeviceConfig>,
) -> BenchConfig {
    BenchConfig {
        project: ProjectConfig {
            name: "lot42".into(),
            step: "qual".into(),
            user_name: "bench".into(),
            user_email: "bench@example.com".into(),
        },
        plan: PlanConfig {
            vcc: 3.3,
            ie1_ua: ie1_ua.to_vec(),
            ie2_ua: vec![10.0],
            ie3_ua: vec![100.0],
            temperature: SweepConfig {
                low: sweep.0,
                high: sweep.1,
                step: sweep.2,
                mode: SweepMode::Single,
            },
        },
        devices,
        bath: BathConfig {
            address: "COM3".into(),
            baud_rate: 2400,
            policy: BathPolicy {
                tolerance: 0.5,
                poll_interval: Duration::from_secs(1),
                max_wait: Duration::from_secs(120),
                settle_time: Duration::from_secs(2),
            },
        },
        storage: StorageConfig::default(),
        logging: LoggingConfig::default(),
    }
}

async fn engine(factory: MockDriverFactory) -> (RunEngine, Arc<SqliteStore>, Arc<MockDriverFactory>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let factory = Arc::new(factory);
    let engine = RunEngine::new(store.clone(), factory.clone());
    (engine, store, factory)
}

fn relative(a: f64, b: f64) -> f64 {
    ((a - b) / b).abs()
}

#[tokio::test(start_paused = true)]
async fn full_run_skips_unpopulated_channel_and_derives() {
    let (engine, store, factory) = engine(MockDriverFactory::new(Chamber::new(25.0))).await;
    let config = config(
        (25.0, 35.0, 10.0),
        &[1.0],
        vec![
            device("COM4", DeviceFamily::ThreeDiode, &[1, 2, 3, 4]),
            device("COM5", DeviceFamily::FourChannel, &[2]),
        ],
    );

    let summary = engine.run(&config).await.unwrap();
    assert_eq!(summary.proj_id, 0);
    assert_eq!(summary.rows_total, 10);
    assert_eq!(summary.rows_measured, 8);
    assert_eq!(summary.rows_skipped, 2);
    assert_eq!(summary.fields_failed, 0);
    assert!(!summary.aborted);
    assert_eq!(engine.state().await, EngineState::Idle);

    let json = serde_json::to_value(summary).unwrap();
    assert_eq!(json["rows_skipped"], 2);

    // Channel 4 of the three-diode board is never driven.
    let com4 = factory.device_handle("COM4").unwrap();
    let channel4 = channel_address(COMMANDED_CURRENT_BASE, 4, 1, RegisterStride::CURRENT)
        ..=channel_address(COMMANDED_CURRENT_BASE, 4, 3, RegisterStride::CURRENT) + 3;
    assert!(com4.writes().iter().all(|(addr, _)| !channel4.contains(addr)));
    assert_eq!(com4.control_word(), ControlProfile::LeakageEnabled.bytes().to_vec());
    assert_eq!(com4.extended_calibrations(), 6);
    assert_eq!(com4.sco_calibrations(), 6);
    assert!(!com4.is_connected());

    let bath = factory.bath_handle().unwrap();
    assert_eq!(bath.set_points(), vec![25.0, 35.0, 25.0]);
    assert!(!bath.is_open());

    let rows = store.project_rows(0).await.unwrap();
    assert_eq!(rows.len(), 10);
    for row in &rows {
        if row.address == "COM4" && row.channel == 4 {
            assert_eq!(row.raw.missing(), 15);
        } else {
            assert_eq!(row.raw.missing(), 0, "test {}", row.test_id);
        }
        let expected_serial = if row.address == "COM4" { 0x1000 } else { 0x1001 };
        assert_eq!(row.serial_number, Some(expected_serial));
    }

    let derived = derive_project(store.as_ref(), 0).await.unwrap();
    assert_eq!(derived.ic_rows, 8);
    assert_eq!(derived.updated, 8);
    assert_eq!(derived.failed, 2);

    for row in store.project_rows(0).await.unwrap() {
        if row.channel == 4 && row.address == "COM4" {
            assert_eq!(row.rs, None);
            continue;
        }
        let rs = row.rs.unwrap();
        let idea = row.idea.unwrap();
        assert!(relative(rs, 2.5) < 0.02, "rs {} at test {}", rs, row.test_id);
        assert!(relative(idea, 1.008) < 0.005, "idea {} at test {}", idea, row.test_id);
    }
}

#[tokio::test(start_paused = true)]
async fn calibration_failure_keeps_completed_rows() {
    let factory = MockDriverFactory::new(Chamber::new(25.0)).with_device_fault(
        "COM4",
        MockFault::FailAfterN {
            operation: "extended_calibration",
            count: 2,
        },
    );
    let (engine, store, factory) = engine(factory).await;
    let config = config(
        (25.0, 25.0, 1.0),
        &[1.0, 2.0],
        vec![device("COM4", DeviceFamily::FourChannel, &[1, 2])],
    );

    let err = engine.run(&config).await.unwrap_err();
    assert!(matches!(err, BenchError::Connection(_)), "{err}");
    assert_eq!(engine.state().await, EngineState::Idle);

    let rows = store.project_rows(0).await.unwrap();
    let missing: Vec<(i64, usize)> = rows.iter().map(|r| (r.test_id, r.raw.missing())).collect();
    assert_eq!(missing, vec![(1, 0), (2, 0), (3, 15), (4, 15)]);

    let board = factory.device_handle("COM4").unwrap();
    assert!(!board.is_connected());
    assert_eq!(board.disconnect_calls(), 1);
    let bath = factory.bath_handle().unwrap();
    assert_eq!(bath.set_points().last(), Some(&25.0));
    assert!(!bath.is_open());
}

#[tokio::test(start_paused = true)]
async fn stuck_bath_times_out() {
    let factory = MockDriverFactory::new(Chamber::new(25.0)).with_bath_fault(MockFault::StuckBath);
    let (engine, store, factory) = engine(factory).await;
    let config = config(
        (25.0, 45.0, 20.0),
        &[1.0],
        vec![device("COM4", DeviceFamily::FourChannel, &[1])],
    );

    let err = engine.run(&config).await.unwrap_err();
    match err {
        BenchError::BathTimeout {
            target,
            last,
            waited_secs,
        } => {
            assert_eq!(target, 45.0);
            assert_eq!(last, Some(25.0));
            assert!(waited_secs >= 120);
        }
        other => panic!("expected bath timeout, got {other}"),
    }

    let rows = store.project_rows(0).await.unwrap();
    assert_eq!(rows[0].raw.missing(), 0);
    assert_eq!(rows[1].raw.missing(), 15);
    assert!(!factory.device_handle("COM4").unwrap().is_connected());
}

#[tokio::test]
async fn invalid_configuration_touches_nothing() {
    let (engine, store, factory) = engine(MockDriverFactory::new(Chamber::default())).await;
    let mut config = config(
        (25.0, 25.0, 1.0),
        &[1.0],
        vec![device("COM4", DeviceFamily::FourChannel, &[1])],
    );
    config.plan.ie3_ua.clear();

    let err = engine.run(&config).await.unwrap_err();
    assert!(matches!(err, BenchError::Configuration(_)));
    assert_eq!(store.max_proj_id().await.unwrap(), None);
    assert!(factory.device_handle("COM4").is_none());
    assert!(factory.bath_handle().is_none());
    assert_eq!(engine.state().await, EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn abort_during_bath_wait_finalizes() {
    let (engine, store, factory) = engine(MockDriverFactory::new(Chamber::new(25.0))).await;
    let config = config(
        (25.0, 45.0, 20.0),
        &[1.0],
        vec![device("COM4", DeviceFamily::FourChannel, &[1])],
    );

    let (summary, ()) = tokio::join!(engine.run(&config), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.abort();
    });
    let summary = summary.unwrap();
    assert!(summary.aborted);
    assert_eq!(summary.rows_measured, 0);
    assert_eq!(summary.rows_total, 2);

    assert!(!factory.bath_handle().unwrap().is_open());
    assert!(!factory.device_handle("COM4").unwrap().is_connected());

    // The next run starts a new project and is not aborted.
    let summary = engine.run(&config).await.unwrap();
    assert_eq!(summary.proj_id, 1);
    assert_eq!(summary.rows_measured, 2);
    assert_eq!(store.next_proj_id().await.unwrap(), 2);
}
