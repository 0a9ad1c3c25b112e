//! Row and interval types for the aggregation tables

use super::fields::{FieldMergeSpec, FieldValue};

/// Half-open epoch interval `[epoch_start, epoch_end)` a row summarizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitBounds {
    pub epoch_start: u64,
    pub epoch_end: u64,
}

impl UnitBounds {
    pub fn new(epoch_start: u64, epoch_end: u64) -> Self {
        Self {
            epoch_start,
            epoch_end,
        }
    }

    /// Last unit inside the interval
    pub fn last_unit(&self) -> u64 {
        self.epoch_end.saturating_sub(1).max(self.epoch_start)
    }

    pub fn contains(&self, unit: u64) -> bool {
        self.epoch_start <= unit && unit < self.epoch_end
    }
}

/// Balance at window start and at window end. Boundary snapshot, never summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceEndpoints {
    pub balance_start: Option<i64>,
    pub balance_end: Option<i64>,
}

/// One `(unit, validator)` row written by the ingester
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub bounds: UnitBounds,
    pub validator_index: u64,
    pub balance_start: i64,
    pub balance_end: i64,
    /// Values in the order of the family's [`FieldMergeSpec`]
    pub values: Vec<FieldValue>,
}

impl SourceRow {
    /// A unit-level row with every field at zero
    pub fn zeroed(unit: u64, validator_index: u64, spec: &FieldMergeSpec) -> Self {
        let values = spec
            .fields()
            .iter()
            .map(|f| match f.kind {
                super::fields::FieldKind::Integer => FieldValue::Integer(0),
                super::fields::FieldKind::Real => FieldValue::Real(0.0),
                super::fields::FieldKind::Bool => FieldValue::Bool(false),
            })
            .collect();
        Self {
            bounds: UnitBounds::new(unit, unit + 1),
            validator_index,
            balance_start: 0,
            balance_end: 0,
            values,
        }
    }

    /// Set a field by name; unknown names are ignored
    pub fn with(mut self, spec: &FieldMergeSpec, name: &str, value: FieldValue) -> Self {
        if let Some(idx) = spec.fields().iter().position(|f| f.name == name) {
            if let Some(slot) = self.values.get_mut(idx) {
                *slot = value;
            }
        }
        self
    }

    pub fn with_balances(mut self, start: i64, end: i64) -> Self {
        self.balance_start = start;
        self.balance_end = end;
        self
    }
}

/// Merged row as stored in the rolling table (one per validator) or in the
/// fixed-bucket table (one per bucket and validator).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    /// Bucket start as unix seconds; `None` for rolling rows
    pub bucket: Option<i64>,
    pub bounds: UnitBounds,
    pub validator_index: u64,
    pub balances: BalanceEndpoints,
    pub values: Vec<FieldValue>,
}

impl AggregateRow {
    pub fn value(&self, spec: &FieldMergeSpec, name: &str) -> Option<FieldValue> {
        spec.fields()
            .iter()
            .position(|f| f.name == name)
            .and_then(|idx| self.values.get(idx).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::fields::FieldMergeSpec;

    #[test]
    fn test_unit_bounds_half_open() {
        let bounds = UnitBounds::new(225, 450);
        assert!(bounds.contains(225));
        assert!(bounds.contains(449));
        assert!(!bounds.contains(450));
        assert_eq!(bounds.last_unit(), 449);
    }

    #[test]
    fn test_source_row_builder() {
        let spec = FieldMergeSpec::validator_dashboard();
        let row = SourceRow::zeroed(7, 42, &spec)
            .with(&spec, "blocks_proposed", FieldValue::Integer(1))
            .with_balances(32_000_000_000, 32_000_010_000);

        assert_eq!(row.bounds, UnitBounds::new(7, 8));
        assert_eq!(row.values.len(), spec.len());
        assert_eq!(row.balance_end, 32_000_010_000);
        let idx = spec
            .fields()
            .iter()
            .position(|f| f.name == "blocks_proposed")
            .unwrap();
        assert_eq!(row.values[idx], FieldValue::Integer(1));
    }

    #[test]
    fn test_with_ignores_missing_slot() {
        let spec = FieldMergeSpec::validator_dashboard();
        let mut row = SourceRow::zeroed(7, 42, &spec);
        row.values.clear();
        let row = row.with(&spec, "blocks_proposed", FieldValue::Integer(1));
        assert!(row.values.is_empty());
    }
}
