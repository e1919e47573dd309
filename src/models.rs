//! Data models for the gasflow pipeline.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Reading labels as they appear on the provider's balance-detail page.
pub const KEY_METER_BALANCE: &str = "表端余额";
pub const KEY_ACCOUNT_BALANCE: &str = "账户余额";
pub const KEY_ARREARS: &str = "欠费金额";
pub const KEY_CUMULATIVE_USAGE: &str = "累计用气量";
pub const KEY_VALVE_STATUS: &str = "阀门状态";

/// One successful scrape of the balance-detail page, cached wholesale.
///
/// A snapshot is immutable once captured; the next successful fetch replaces
/// it as a unit. Keys are the provider's own labels, values the first decimal
/// number found in each cell (non-numeric cells such as the valve glyph are
/// simply absent).
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    // ---
    pub readings: HashMap<String, f64>,
    pub captured_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    // ---
    pub fn get(&self, key: &str) -> Option<f64> {
        // ---
        self.readings.get(key).copied()
    }

    /// The meter-side balance, the field the cost accrual anchors on.
    pub fn meter_balance(&self) -> Option<f64> {
        // ---
        self.get(KEY_METER_BALANCE)
    }
}

/// Total recharge amount posted on one settled day.
///
/// The provider only exposes settled prior-day transactions, so `date` is
/// always the day before the fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RechargeTotal {
    // ---
    pub total: f64,
    pub date: NaiveDate,
    pub captured_at: DateTime<Utc>,
}

/// The only state that must survive a restart: the balance recorded at the
/// start of the current accounting day and the date it was recorded on.
///
/// Either field restores to `None` individually if its stored form fails to
/// parse; the engine re-anchors on its next tick with balance data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccrualState {
    // ---
    pub anchor_balance: Option<f64>,
    pub anchor_date: Option<NaiveDate>,
}

impl AccrualState {
    /// Whether a usable anchor exists (restored or established live).
    pub fn is_initialized(&self) -> bool {
        // ---
        self.anchor_date.is_some() && self.anchor_balance.is_some()
    }
}

/// Derived net cost for the current accounting day. Recomputed on every
/// engine tick, never persisted.
///
/// `available` distinguishes a real zero from "no balance data yet": the
/// value is always computable (missing inputs degrade to 0) but callers that
/// care can tell the two apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostReading {
    // ---
    pub value: f64,
    pub available: bool,
}

// ---

/// Unit tag for an exported reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Unit {
    #[serde(rename = "CNY")]
    Yuan,
    #[serde(rename = "m3")]
    CubicMeters,
}

/// How a reading accumulates over time: a point-in-time level or a
/// monotonically increasing lifetime total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationKind {
    Measurement,
    TotalIncreasing,
}

/// Descriptor for one exported reading. One table of these drives the whole
/// presentation surface instead of a type per reading.
#[derive(Debug, Clone, Copy)]
pub struct ReadingSpec {
    // ---
    pub name: &'static str,
    pub unit: Option<Unit>,
    pub kind: AccumulationKind,
}

impl ReadingSpec {
    // ---
    pub fn with_value(&self, value: Option<f64>) -> Reading {
        // ---
        Reading {
            name: self.name,
            value,
            unit: self.unit,
            kind: self.kind,
            available: value.is_some(),
        }
    }
}

/// One entry of the exported reading set, as served by `/readings`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Reading {
    // ---
    pub name: &'static str,
    pub value: Option<f64>,
    pub unit: Option<Unit>,
    pub kind: AccumulationKind,
    pub available: bool,
}

/// The five balance-page readings, paired with the provider label each one
/// is looked up under.
pub const BALANCE_READINGS: &[(&str, ReadingSpec)] = &[
    (
        KEY_METER_BALANCE,
        ReadingSpec {
            name: "meter_balance",
            unit: Some(Unit::Yuan),
            kind: AccumulationKind::Measurement,
        },
    ),
    (
        KEY_ACCOUNT_BALANCE,
        ReadingSpec {
            name: "account_balance",
            unit: Some(Unit::Yuan),
            kind: AccumulationKind::Measurement,
        },
    ),
    (
        KEY_ARREARS,
        ReadingSpec {
            name: "arrears",
            unit: Some(Unit::Yuan),
            kind: AccumulationKind::Measurement,
        },
    ),
    (
        KEY_CUMULATIVE_USAGE,
        ReadingSpec {
            name: "cumulative_usage",
            unit: Some(Unit::CubicMeters),
            kind: AccumulationKind::TotalIncreasing,
        },
    ),
    (
        KEY_VALVE_STATUS,
        ReadingSpec {
            name: "valve_status",
            unit: None,
            kind: AccumulationKind::Measurement,
        },
    ),
];

/// Yesterday's settled recharge total.
pub const RECHARGE_READING: ReadingSpec = ReadingSpec {
    name: "recharge_total",
    unit: Some(Unit::Yuan),
    kind: AccumulationKind::Measurement,
};

/// The derived daily cost.
pub const COST_READING: ReadingSpec = ReadingSpec {
    name: "daily_cost",
    unit: Some(Unit::Yuan),
    kind: AccumulationKind::Measurement,
};

// ---

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn snapshot_with(entries: &[(&str, f64)]) -> BalanceSnapshot {
        // ---
        BalanceSnapshot {
            readings: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn meter_balance_reads_the_provider_key() {
        // ---
        let snap = snapshot_with(&[(KEY_METER_BALANCE, 123.45), (KEY_ARREARS, 0.0)]);
        assert_eq!(snap.meter_balance(), Some(123.45));
        assert_eq!(snap.get(KEY_ARREARS), Some(0.0));

        // A page without the meter cell yields no reading, not a default
        let partial = snapshot_with(&[(KEY_ACCOUNT_BALANCE, 50.0)]);
        assert_eq!(partial.meter_balance(), None);
    }

    #[test]
    fn accrual_state_initialization() {
        // ---
        assert!(!AccrualState::default().is_initialized());

        let half = AccrualState {
            anchor_balance: None,
            anchor_date: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        };
        assert!(!half.is_initialized());

        let full = AccrualState {
            anchor_balance: Some(42.5),
            anchor_date: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        };
        assert!(full.is_initialized());
    }

    #[test]
    fn reading_availability_follows_value() {
        // ---
        let present = RECHARGE_READING.with_value(Some(80.0));
        assert!(present.available);
        assert_eq!(present.value, Some(80.0));

        let missing = RECHARGE_READING.with_value(None);
        assert!(!missing.available);
        assert_eq!(missing.value, None);
    }

    #[test]
    fn reading_serializes_with_tagged_unit_and_kind() {
        // ---
        let usage = BALANCE_READINGS[3].1.with_value(Some(210.3));
        let json = serde_json::to_value(usage).unwrap();

        assert_eq!(json["name"], "cumulative_usage");
        assert_eq!(json["unit"], "m3");
        assert_eq!(json["kind"], "total_increasing");
        assert_eq!(json["available"], true);

        let cost = COST_READING.with_value(Some(30.0));
        let json = serde_json::to_value(cost).unwrap();
        assert_eq!(json["unit"], "CNY");
        assert_eq!(json["kind"], "measurement");
    }

    #[test]
    fn exported_reading_names_are_unique() {
        // ---
        let mut names: Vec<&str> = BALANCE_READINGS.iter().map(|(_, s)| s.name).collect();
        names.push(RECHARGE_READING.name);
        names.push(COST_READING.name);
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
