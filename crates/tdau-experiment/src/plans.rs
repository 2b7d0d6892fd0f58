//! Test plan construction.
//!
//! A plan is the cartesian product of three axes, materialized as rows before
//! any hardware is touched:
//!
//! ```text
//! for temperature in sweep            (outer)
//!   for combination in currents       (middle)
//!     for diode in roster             (inner)
//!       row(test_id = 1, 2, 3, ...)
//! ```
//!
//! The run engine later walks the rows ordered by (temperature, test_id), so the
//! bath only moves when the outer axis advances.

use crate::config::{BenchConfig, DeviceConfig};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tdau_core::model::{CurrentCombination, DiodeUnit, ProjectInfo, TestRow};
use tdau_core::{AppResult, BenchError};

/// Upper bound on sweep points, guarding against a mistyped step.
pub const MAX_SWEEP_POINTS: usize = 10_000;

/// How `low == high` sweeps are expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// A degenerate sweep is a single point.
    #[default]
    Single,
    /// A degenerate sweep yields the point twice, as older bench databases
    /// expect. Duplicates are still collapsed when rows are generated.
    LegacyDuplicate,
}

/// Temperature points `low, low+step, ..., <= high`.
///
/// Points are computed as `low + i·step` so that no rounding error
/// accumulates; the upper bound is accepted within `step·1e-9`.
///
/// # Errors
///
/// [`BenchError::Configuration`] for non-finite inputs, `low > high`, a
/// non-positive step on a non-degenerate sweep, or more than
/// [`MAX_SWEEP_POINTS`] points.
pub fn build_temperature_sweep(
    low: f64,
    high: f64,
    step: f64,
    mode: SweepMode,
) -> AppResult<Vec<f64>> {
    if !low.is_finite() || !high.is_finite() || !step.is_finite() {
        return Err(BenchError::Configuration(format!(
            "temperature sweep ({}, {}, {}) is not finite",
            low, high, step
        )));
    }
    if low > high {
        return Err(BenchError::Configuration(format!(
            "temperature sweep low {} is above high {}",
            low, high
        )));
    }
    if low == high {
        return Ok(match mode {
            SweepMode::Single => vec![low],
            SweepMode::LegacyDuplicate => vec![low, low],
        });
    }
    if step <= 0.0 {
        return Err(BenchError::Configuration(format!(
            "temperature step {} must be positive",
            step
        )));
    }

    let intervals = ((high - low) / step + 1e-9).floor();
    if intervals >= MAX_SWEEP_POINTS as f64 {
        return Err(BenchError::Configuration(format!(
            "temperature sweep ({}, {}, {}) exceeds {} points",
            low, high, step, MAX_SWEEP_POINTS
        )));
    }
    let count = intervals as usize + 1;
    Ok((0..count).map(|i| low + i as f64 * step).collect())
}

/// Every (Ie1, Ie2, Ie3) triple, Ie1 outermost, with ids from 1.
pub fn build_current_combinations(
    ie1s: &[f64],
    ie2s: &[f64],
    ie3s: &[f64],
) -> AppResult<Vec<CurrentCombination>> {
    for (name, list) in [("Ie1", ie1s), ("Ie2", ie2s), ("Ie3", ie3s)] {
        if list.is_empty() {
            return Err(BenchError::Configuration(format!(
                "{} current list is empty",
                name
            )));
        }
    }

    let mut combinations = Vec::with_capacity(ie1s.len() * ie2s.len() * ie3s.len());
    for &ie1 in ie1s {
        for &ie2 in ie2s {
            for &ie3 in ie3s {
                combinations.push(CurrentCombination {
                    id: combinations.len() as i64 + 1,
                    ie1,
                    ie2,
                    ie3,
                });
            }
        }
    }
    Ok(combinations)
}

/// Diode units in roster order, enabled channels ascending, ids from 1.
///
/// Channels the device family skips still get a unit; their rows are consumed
/// without measurement by the run engine.
pub fn assign_diode_units(roster: &[DeviceConfig]) -> Vec<DiodeUnit> {
    let mut units = Vec::new();
    for device in roster {
        let mut channels = device.channels.clone();
        channels.sort_unstable();
        channels.dedup();
        for channel in channels {
            units.push(DiodeUnit {
                diode_id: units.len() as i64 + 1,
                address: device.address.clone(),
                channel,
                serial_number: None,
            });
        }
    }
    units
}

/// Plan rows for the product sweep × combinations × diodes.
///
/// Repeated temperatures are collapsed to their first occurrence.
pub fn build_test_matrix(
    proj_id: i64,
    sweep: &[f64],
    combinations: &[CurrentCombination],
    diode_ids: &[i64],
    voltage: f64,
) -> Vec<TestRow> {
    let mut temperatures: Vec<f64> = Vec::with_capacity(sweep.len());
    for &t in sweep {
        if !temperatures.contains(&t) {
            temperatures.push(t);
        }
    }

    let mut rows =
        Vec::with_capacity(temperatures.len() * combinations.len() * diode_ids.len());
    for &temperature in &temperatures {
        for combination in combinations {
            for &diode_id in diode_ids {
                rows.push(TestRow {
                    test_id: rows.len() as i64 + 1,
                    proj_id,
                    diode_id,
                    current_com: combination.id,
                    temperature,
                    voltage,
                });
            }
        }
    }
    rows
}

/// Everything persisted before the first measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPlan {
    pub project: ProjectInfo,
    pub sweep: Vec<f64>,
    pub combinations: Vec<CurrentCombination>,
    pub units: Vec<DiodeUnit>,
    pub rows: Vec<TestRow>,
}

impl TestPlan {
    /// Build the plan for project `proj_id` from a validated configuration.
    pub fn build(config: &BenchConfig, proj_id: i64, now: DateTime<Local>) -> AppResult<Self> {
        let sweep_config = config.plan.temperature;
        let sweep = build_temperature_sweep(
            sweep_config.low,
            sweep_config.high,
            sweep_config.step,
            sweep_config.mode,
        )?;
        let [ie1s, ie2s, ie3s] = config.currents_amps();
        let combinations = build_current_combinations(&ie1s, &ie2s, &ie3s)?;
        let units = assign_diode_units(&config.devices);
        let diode_ids: Vec<i64> = units.iter().map(|u| u.diode_id).collect();
        let rows = build_test_matrix(proj_id, &sweep, &combinations, &diode_ids, config.plan.vcc);

        Ok(Self {
            project: ProjectInfo {
                proj_id,
                date_time: now,
                name: config.project.name.clone(),
                step: config.project.step.clone(),
                user_name: config.project.user_name.clone(),
                user_email: config.project.user_email.clone(),
            },
            sweep,
            combinations,
            units,
            rows,
        })
    }
}
