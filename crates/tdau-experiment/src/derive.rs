//! Derived diode parameters.
//!
//! Runs after a project has been measured, as two passes over the store:
//!
//! 1. `Ic_n = Ie_n_measured - Ib_n` for every row where both are present
//! 2. series resistance (RS) and ideality factor (Idea) per row
//!
//! The three-current method cancels the saturation current:
//!
//! ```text
//! k    = ln(Ic3/Ic2) / ln(Ic2/Ic1)
//! RS   = ((Vbe3-Vbe2) - (Vbe2-Vbe1)·k) / ((Ie3-Ie2) - (Ie2-Ie1)·k)
//! Idea = q·((Vbe2-Vbe1) - (Ie2-Ie1)·RS) / ((T+273.15)·kB·ln(Ic2/Ic1))
//! ```
//!
//! A row that cannot be computed is logged and skipped; the pass continues.

use serde::Serialize;
use tdau_core::model::DerivationInput;
use tdau_core::{AppResult, ComputationError};
use tdau_storage::TestStore;
use tracing::{info, instrument, warn};

/// Elementary charge, C.
pub const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;
/// Boltzmann constant, J/K.
pub const BOLTZMANN: f64 = 1.380_649e-23;
pub const ZERO_CELSIUS_KELVIN: f64 = 273.15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeriveSummary {
    /// Rows with Ic written by the first pass.
    pub ic_rows: u64,
    pub updated: usize,
    pub failed: usize,
}

/// RS (Ω) and ideality factor for one row.
///
/// # Errors
///
/// [`ComputationError`] when an input is missing, a log argument is not
/// positive, a denominator is zero or the result is not finite.
pub fn compute_derived(input: &DerivationInput) -> Result<(f64, f64), ComputationError> {
    let test_id = input.test_id;
    let require = |value: Option<f64>, field: &'static str| {
        value.ok_or(ComputationError::MissingField { test_id, field })
    };

    let vbe1 = require(input.vbe[0], "Vbe1")?;
    let vbe2 = require(input.vbe[1], "Vbe2")?;
    let vbe3 = require(input.vbe[2], "Vbe3")?;
    let ie1 = require(input.ie_measured[0], "Ie1_measured")?;
    let ie2 = require(input.ie_measured[1], "Ie2_measured")?;
    let ie3 = require(input.ie_measured[2], "Ie3_measured")?;
    let ic1 = require(input.ic[0], "Ic1")?;
    let ic2 = require(input.ic[1], "Ic2")?;
    let ic3 = require(input.ic[2], "Ic3")?;

    for (ratio, value) in [("Ic1", ic1), ("Ic2", ic2), ("Ic3", ic3)] {
        if !(value > 0.0) {
            return Err(ComputationError::NonPositiveLog {
                test_id,
                ratio,
                value,
            });
        }
    }

    let ln_32 = (ic3 / ic2).ln();
    let ln_21 = (ic2 / ic1).ln();
    if ln_21 == 0.0 {
        return Err(ComputationError::ZeroDenominator {
            test_id,
            quantity: "ln(Ic2/Ic1)",
        });
    }
    let k = ln_32 / ln_21;

    let rs_denominator = (ie3 - ie2) - (ie2 - ie1) * k;
    if rs_denominator == 0.0 {
        return Err(ComputationError::ZeroDenominator {
            test_id,
            quantity: "RS",
        });
    }
    let rs = ((vbe3 - vbe2) - (vbe2 - vbe1) * k) / rs_denominator;

    let kelvin = input.temperature + ZERO_CELSIUS_KELVIN;
    if kelvin == 0.0 {
        return Err(ComputationError::ZeroDenominator {
            test_id,
            quantity: "Idea",
        });
    }
    let idea =
        ELEMENTARY_CHARGE * ((vbe2 - vbe1) - (ie2 - ie1) * rs) / (kelvin * BOLTZMANN * ln_21);

    for (quantity, value) in [("RS", rs), ("Idea", idea)] {
        if !value.is_finite() {
            return Err(ComputationError::NonFinite {
                test_id,
                quantity,
                value,
            });
        }
    }
    Ok((rs, idea))
}

/// First pass: fill Ic1..Ic3 for the project.
pub async fn update_ic(store: &dyn TestStore, proj_id: i64) -> AppResult<u64> {
    let rows = store.update_ic(proj_id).await?;
    info!(proj_id, rows, "Collector currents updated");
    Ok(rows)
}

/// Second pass: RS and Idea for every row of the project.
///
/// Rows that fail to compute keep NULL RS/Idea and are counted in
/// [`DeriveSummary::failed`]; store failures abort the pass.
pub async fn update_rs_idea(store: &dyn TestStore, proj_id: i64) -> AppResult<DeriveSummary> {
    let mut summary = DeriveSummary::default();
    for input in store.derivation_rows(proj_id).await? {
        match compute_derived(&input) {
            Ok((rs, idea)) => {
                store.update_derived(proj_id, input.test_id, rs, idea).await?;
                summary.updated += 1;
            }
            Err(e) => {
                warn!(proj_id, error = %e, "Skipping RS/Idea for row");
                summary.failed += 1;
            }
        }
    }
    info!(proj_id, updated = summary.updated, failed = summary.failed, "RS/Idea updated");
    Ok(summary)
}

/// Both passes, in order.
#[instrument(skip(store), err)]
pub async fn derive_project(store: &dyn TestStore, proj_id: i64) -> AppResult<DeriveSummary> {
    let ic_rows = update_ic(store, proj_id).await?;
    let summary = update_rs_idea(store, proj_id).await?;
    Ok(DeriveSummary { ic_rows, ..summary })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ideal diode with series resistance: Vbe = n·kT/q·ln(Ic/Is) + Ie·Rs.
    fn synthetic(temperature: f64, n: f64, rs: f64, beta: f64) -> DerivationInput {
        let vt = BOLTZMANN * (temperature + ZERO_CELSIUS_KELVIN) / ELEMENTARY_CHARGE;
        let saturation = 1e-14;
        let currents = [1e-6, 10e-6, 100e-6];
        let mut input = DerivationInput {
            test_id: 1,
            temperature,
            ..DerivationInput::default()
        };
        for (i, ie) in currents.into_iter().enumerate() {
            let ic = ie * beta / (beta + 1.0);
            input.ie_measured[i] = Some(ie);
            input.ic[i] = Some(ic);
            input.vbe[i] = Some(n * vt * (ic / saturation).ln() + ie * rs);
        }
        input
    }

    fn relative(a: f64, b: f64) -> f64 {
        ((a - b) / b).abs()
    }

    #[test]
    fn recovers_model_parameters() {
        for temperature in [-40.0, 25.0, 125.0] {
            let (rs, idea) = compute_derived(&synthetic(temperature, 1.008, 2.5, 120.0)).unwrap();
            assert!(relative(rs, 2.5) < 1e-6, "rs {rs} at {temperature}");
            assert!(relative(idea, 1.008) < 1e-9, "idea {idea} at {temperature}");
        }
    }

    #[test]
    fn matches_closed_form() {
        let input = DerivationInput {
            test_id: 4,
            temperature: 30.0,
            vbe: [Some(0.55), Some(0.61), Some(0.68)],
            ie_measured: [Some(2e-6), Some(20e-6), Some(200e-6)],
            ic: [Some(1.9e-6), Some(19.5e-6), Some(198e-6)],
        };
        let k = (198e-6f64 / 19.5e-6).ln() / (19.5e-6f64 / 1.9e-6).ln();
        let rs = ((0.68 - 0.61) - (0.61 - 0.55) * k) / ((200e-6 - 20e-6) - (20e-6 - 2e-6) * k);
        let idea = ELEMENTARY_CHARGE * ((0.61 - 0.55) - (20e-6 - 2e-6) * rs)
            / (303.15 * BOLTZMANN * (19.5e-6f64 / 1.9e-6).ln());

        let (got_rs, got_idea) = compute_derived(&input).unwrap();
        assert!(relative(got_rs, rs) < 1e-9);
        assert!(relative(got_idea, idea) < 1e-9);
    }

    #[test]
    fn missing_field_is_reported() {
        let mut input = synthetic(25.0, 1.0, 1.0, 100.0);
        input.vbe[1] = None;
        assert_eq!(
            compute_derived(&input).unwrap_err(),
            ComputationError::MissingField {
                test_id: 1,
                field: "Vbe2"
            }
        );
    }

    #[test]
    fn degenerate_inputs() {
        let mut input = synthetic(25.0, 1.0, 1.0, 100.0);
        input.ic[0] = Some(-1e-9);
        assert!(matches!(
            compute_derived(&input),
            Err(ComputationError::NonPositiveLog { ratio: "Ic1", .. })
        ));

        let mut input = synthetic(25.0, 1.0, 1.0, 100.0);
        input.ic[1] = input.ic[0];
        assert!(matches!(
            compute_derived(&input),
            Err(ComputationError::ZeroDenominator {
                quantity: "ln(Ic2/Ic1)",
                ..
            })
        ));

        let mut input = synthetic(25.0, 1.0, 1.0, 100.0);
        input.temperature = -ZERO_CELSIUS_KELVIN;
        assert!(matches!(
            compute_derived(&input),
            Err(ComputationError::ZeroDenominator { quantity: "Idea", .. })
        ));
    }
}
