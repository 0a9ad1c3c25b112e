//! Merge-field table shared by every aggregation width
//!
//! Each accumulable column declares how multiple source rows collapse into
//! one destination row. The same table drives the SQL aggregate expressions,
//! the destination DDL and the upsert assignments, so the epoch→day and
//! day→week rollups run the same engine code.

use super::error::{AggregationError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOp {
    Sum,
    BoolOr,
    Max,
}

impl MergeOp {
    /// SQL aggregate over `column`
    ///
    /// SQLite has no `bool_or`; booleans are stored as 0/1 so MAX is equivalent.
    pub fn sql_aggregate(&self, column: &str) -> String {
        match self {
            MergeOp::Sum => format!("SUM({column})"),
            MergeOp::BoolOr => format!("MAX({column})"),
            MergeOp::Max => format!("MAX({column})"),
        }
    }

    /// Merge two values in memory with the same semantics as the SQL side
    pub fn merge(&self, a: FieldValue, b: FieldValue) -> FieldValue {
        match (self, a, b) {
            (MergeOp::Sum, FieldValue::Integer(x), FieldValue::Integer(y)) => {
                FieldValue::Integer(x.saturating_add(y))
            }
            (MergeOp::Sum, x, y) => FieldValue::Real(x.as_f64() + y.as_f64()),
            (MergeOp::BoolOr, x, y) => FieldValue::Bool(x.as_bool() || y.as_bool()),
            (MergeOp::Max, FieldValue::Integer(x), FieldValue::Integer(y)) => {
                FieldValue::Integer(x.max(y))
            }
            (MergeOp::Max, x, y) => FieldValue::Real(x.as_f64().max(y.as_f64())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Real,
    Bool,
}

impl FieldKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Integer | FieldKind::Bool => "INTEGER",
            FieldKind::Real => "REAL",
        }
    }
}

/// A value of one accumulable field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::Integer(v) => v as f64,
            FieldValue::Real(v) => v,
            FieldValue::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            FieldValue::Integer(v) => v != 0,
            FieldValue::Real(v) => v != 0.0,
            FieldValue::Bool(v) => v,
        }
    }
}

impl rusqlite::ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match *self {
            FieldValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(v)),
            FieldValue::Real(v) => ToSqlOutput::Owned(Value::Real(v)),
            FieldValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(v as i64)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub op: MergeOp,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind, op: MergeOp) -> Self {
        Self {
            name: name.to_string(),
            kind,
            op,
        }
    }

    /// Decode this field from a row column
    pub fn read(&self, row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<FieldValue> {
        // NULL shows up for SUM over no rows and for missing MAX values
        Ok(match self.kind {
            FieldKind::Integer => FieldValue::Integer(row.get::<_, Option<i64>>(idx)?.unwrap_or(0)),
            FieldKind::Real => FieldValue::Real(row.get::<_, Option<f64>>(idx)?.unwrap_or(0.0)),
            FieldKind::Bool => {
                FieldValue::Bool(row.get::<_, Option<i64>>(idx)?.unwrap_or(0) != 0)
            }
        })
    }
}

/// Ordered set of accumulable fields with their merge operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMergeSpec {
    fields: Vec<FieldSpec>,
}

impl FieldMergeSpec {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        if fields.is_empty() {
            return Err(AggregationError::Config(
                "field merge spec needs at least one field".to_string(),
            ));
        }
        for (i, field) in fields.iter().enumerate() {
            super::db::validate_identifier(&field.name)?;
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(AggregationError::Config(format!(
                    "duplicate merge field {}",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Load a merge table from JSON: `{"fields": [{"name", "kind", "op"}, ...]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let parsed: FieldMergeSpec = serde_json::from_str(json)
            .map_err(|e| AggregationError::Config(format!("invalid field spec json: {e}")))?;
        Self::new(parsed.fields)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `name1, name2, ...`
    pub fn column_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `SUM(a) AS a, MAX(b) AS b, ...`
    pub fn aggregate_list(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{} AS {}", f.op.sql_aggregate(&f.name), f.name))
            .collect::<Vec<_>>()
            .join(",\n                ")
    }

    /// Column definitions for CREATE TABLE
    pub fn column_ddl(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{} {} NOT NULL DEFAULT 0", f.name, f.kind.sql_type()))
            .collect::<Vec<_>>()
            .join(",\n                ")
    }

    /// `a = excluded.a, ...` for ON CONFLICT DO UPDATE
    pub fn upsert_assignments(&self) -> String {
        self.fields
            .iter()
            .map(|f| format!("{0} = excluded.{0}", f.name))
            .collect::<Vec<_>>()
            .join(",\n                ")
    }

    /// Validator dashboard metric set
    pub fn validator_dashboard() -> Self {
        use FieldKind::*;
        use MergeOp::*;

        let sums = [
            "attestations_source_reward",
            "attestations_target_reward",
            "attestations_head_reward",
            "attestations_inactivity_reward",
            "attestations_inclusion_reward",
            "attestations_reward",
            "attestations_ideal_source_reward",
            "attestations_ideal_target_reward",
            "attestations_ideal_head_reward",
            "attestations_ideal_inactivity_reward",
            "attestations_ideal_inclusion_reward",
            "attestations_ideal_reward",
            "blocks_scheduled",
            "blocks_proposed",
            "blocks_cl_reward",
            "sync_scheduled",
            "sync_executed",
            "sync_rewards",
            "deposits_count",
            "deposits_amount",
            "withdrawals_count",
            "withdrawals_amount",
            "inclusion_delay_sum",
            "attestations_scheduled",
            "attestations_executed",
            "attestation_head_executed",
            "attestation_source_executed",
            "attestation_target_executed",
            "optimal_inclusion_delay_sum",
            "slasher_reward",
        ];

        let mut fields: Vec<FieldSpec> = sums
            .iter()
            .map(|name| FieldSpec::new(name, Integer, Sum))
            .collect();
        fields.push(FieldSpec::new("sync_chance", Real, Sum));
        fields.push(FieldSpec::new("block_chance", Real, Sum));
        fields.push(FieldSpec::new("slashed", Bool, BoolOr));
        fields.push(FieldSpec::new("slashed_by", Integer, Max));
        fields.push(FieldSpec::new("slashed_violation", Integer, Max));
        fields.push(FieldSpec::new("last_executed_duty_epoch", Integer, Max));

        Self { fields }
    }
}
