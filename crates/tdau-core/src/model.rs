//! Records exchanged between the plan builder, the run engine and the store.

use crate::codec::{
    channel_address, RegisterStride, IB_BASE, IB_LEAK_BASE, IE_LEAK_BASE, IE_MEASURED_BASE,
    VBE_BASE,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Project header, written once when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub proj_id: i64,
    pub date_time: DateTime<Local>,
    pub name: String,
    pub step: String,
    pub user_name: String,
    pub user_email: String,
}

/// One (Ie1, Ie2, Ie3) triple in amperes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentCombination {
    pub id: i64,
    pub ie1: f64,
    pub ie2: f64,
    pub ie3: f64,
}

impl CurrentCombination {
    pub fn currents(&self) -> [f64; 3] {
        [self.ie1, self.ie2, self.ie3]
    }
}

/// A diode channel on a TDAU board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiodeUnit {
    pub diode_id: i64,
    /// Port address of the owning board.
    pub address: String,
    /// Board channel, 1..=4.
    pub channel: u8,
    /// Filled in once the board has been connected.
    pub serial_number: Option<u32>,
}

/// Plan row skeleton as produced by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestRow {
    pub test_id: i64,
    pub proj_id: i64,
    pub diode_id: i64,
    pub current_com: i64,
    pub temperature: f64,
    pub voltage: f64,
}

/// A plan row joined with its currents and unit, as the run engine walks it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRow {
    pub test_id: i64,
    pub proj_id: i64,
    pub diode_id: i64,
    pub address: String,
    pub channel: u8,
    pub temperature: f64,
    pub currents: [f64; 3],
}

/// One of the 15 raw registers read back after calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasuredField {
    Vbe(u8),
    Ib(u8),
    IeMeasured(u8),
    IeLeak(u8),
    IbLeak(u8),
}

impl MeasuredField {
    /// Read-back order used by the run engine.
    pub const ALL: [MeasuredField; 15] = [
        MeasuredField::Vbe(1),
        MeasuredField::Vbe(2),
        MeasuredField::Vbe(3),
        MeasuredField::Ib(1),
        MeasuredField::Ib(2),
        MeasuredField::Ib(3),
        MeasuredField::IeMeasured(1),
        MeasuredField::IeMeasured(2),
        MeasuredField::IeMeasured(3),
        MeasuredField::IeLeak(1),
        MeasuredField::IeLeak(2),
        MeasuredField::IeLeak(3),
        MeasuredField::IbLeak(1),
        MeasuredField::IbLeak(2),
        MeasuredField::IbLeak(3),
    ];

    pub fn slot(self) -> u8 {
        match self {
            MeasuredField::Vbe(s)
            | MeasuredField::Ib(s)
            | MeasuredField::IeMeasured(s)
            | MeasuredField::IeLeak(s)
            | MeasuredField::IbLeak(s) => s,
        }
    }

    /// Position in [`MeasuredField::ALL`].
    pub fn index(self) -> usize {
        let group = match self {
            MeasuredField::Vbe(_) => 0,
            MeasuredField::Ib(_) => 1,
            MeasuredField::IeMeasured(_) => 2,
            MeasuredField::IeLeak(_) => 3,
            MeasuredField::IbLeak(_) => 4,
        };
        group * 3 + usize::from(self.slot().saturating_sub(1))
    }

    /// Register address of this field on `channel`.
    pub fn address(self, channel: u8) -> u16 {
        let (base, stride) = match self {
            MeasuredField::Vbe(_) => (VBE_BASE, RegisterStride::VOLTAGE),
            MeasuredField::Ib(_) => (IB_BASE, RegisterStride::VOLTAGE),
            MeasuredField::IeMeasured(_) => (IE_MEASURED_BASE, RegisterStride::CURRENT),
            MeasuredField::IeLeak(_) => (IE_LEAK_BASE, RegisterStride::CURRENT),
            MeasuredField::IbLeak(_) => (IB_LEAK_BASE, RegisterStride::CURRENT),
        };
        channel_address(base, channel, self.slot(), stride)
    }

    /// Column name in the Test table.
    pub fn column(self) -> &'static str {
        const COLUMNS: [&str; 15] = [
            "Vbe1",
            "Vbe2",
            "Vbe3",
            "Ib1",
            "Ib2",
            "Ib3",
            "Ie1_measured",
            "Ie2_measured",
            "Ie3_measured",
            "Ie1_leak",
            "Ie2_leak",
            "Ie3_leak",
            "Ib1_leak",
            "Ib2_leak",
            "Ib3_leak",
        ];
        COLUMNS[self.index()]
    }
}

/// Raw register values for one row. `None` means the read failed to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawMeasurements {
    values: [Option<f64>; 15],
}

impl RawMeasurements {
    pub fn set(&mut self, field: MeasuredField, value: f64) {
        self.values[field.index()] = Some(value);
    }

    pub fn get(&self, field: MeasuredField) -> Option<f64> {
        self.values[field.index()]
    }

    /// Values in [`MeasuredField::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (MeasuredField, Option<f64>)> + '_ {
        MeasuredField::ALL.iter().map(|f| (*f, self.get(*f)))
    }

    pub fn missing(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }
}

/// Inputs of the RS/ideality computation for one row.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DerivationInput {
    pub test_id: i64,
    pub temperature: f64,
    pub vbe: [Option<f64>; 3],
    pub ie_measured: [Option<f64>; 3],
    pub ic: [Option<f64>; 3],
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn field_indices_match_declaration_order() {
        for (i, field) in MeasuredField::ALL.iter().enumerate() {
            assert_eq!(field.index(), i);
        }
        let columns: HashSet<_> = MeasuredField::ALL.iter().map(|f| f.column()).collect();
        assert_eq!(columns.len(), 15);
    }

    #[test]
    fn field_addresses() {
        assert_eq!(MeasuredField::Vbe(1).address(2), 1090 + 52 + 8);
        assert_eq!(MeasuredField::Ib(3).address(1), 1094 + 26 + 24);
        assert_eq!(MeasuredField::IeMeasured(2).address(3), 1036 + 36 + 8);
        assert_eq!(MeasuredField::IeLeak(1).address(1), 944 + 12 + 4);
        assert_eq!(MeasuredField::IbLeak(3).address(4), 896 + 48 + 12);
    }

    #[test]
    fn raw_measurements_track_missing() {
        let mut raw = RawMeasurements::default();
        assert_eq!(raw.missing(), 15);
        raw.set(MeasuredField::IbLeak(2), 1.5e-9);
        assert_eq!(raw.get(MeasuredField::IbLeak(2)), Some(1.5e-9));
        assert_eq!(raw.missing(), 14);
    }
}
