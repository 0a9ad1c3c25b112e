//! Aggregation configuration from environment variables

use super::clock::TimeUnitClock;
use super::db::validate_identifier;
use super::error::{AggregationError, Result};
use super::fields::FieldMergeSpec;
use std::env;
use std::sync::Arc;

/// Mainnet beacon chain genesis, 2020-12-01 12:00:23 UTC
pub const MAINNET_GENESIS_TIMESTAMP: i64 = 1_606_824_023;

/// Configuration for the aggregation runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Path to SQLite database file
    pub db_path: String,

    pub genesis_timestamp: i64,

    /// 12s slots x 32 slots per epoch
    pub seconds_per_unit: u64,

    /// Days per fixed-bucket partition
    pub buckets_per_partition: u64,

    /// Aggregation tasks allowed to run at once, across all families
    pub parallelism: usize,

    /// Units the rolling table may lag before it is rebuilt instead of slid
    pub rolling_bootstrap_threshold: u64,

    /// Interval between aggregation passes in milliseconds
    pub interval_ms: u64,

    pub source_table: String,
    pub rolling_table: String,
    pub fixed_table: String,

    /// Optional JSON field merge table replacing the validator dashboard one
    pub field_spec_path: Option<String>,
}

/// Rolling destination of a family
#[derive(Debug, Clone)]
pub struct RollingTarget {
    pub table: String,
    pub window_units: u64,
    pub bootstrap_threshold: u64,
}

/// Everything one orchestrator needs: which table feeds which destinations,
/// at what width and with which merge table.
#[derive(Debug, Clone)]
pub struct AggregationFamily {
    pub name: String,
    pub clock: TimeUnitClock,
    pub fields: Arc<FieldMergeSpec>,
    pub source_table: String,
    pub rolling: Option<RollingTarget>,
    pub fixed_table: String,
}

impl AggregationConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EPOCHFLOW_DB_PATH` (default: data/epochflow.db)
    /// - `GENESIS_TIMESTAMP` (default: 1606824023, mainnet)
    /// - `SECONDS_PER_UNIT` (default: 384)
    /// - `BUCKETS_PER_PARTITION` (default: 6)
    /// - `AGGREGATION_PARALLELISM` (default: 10)
    /// - `ROLLING_BOOTSTRAP_THRESHOLD` (default: 1)
    /// - `AGGREGATION_INTERVAL_MS` (default: 12000)
    /// - `SOURCE_TABLE` (default: validator_dashboard_data_epoch)
    /// - `ROLLING_TABLE` (default: validator_dashboard_data_rolling_daily)
    /// - `FIXED_TABLE` (default: validator_dashboard_data_daily)
    /// - `FIELD_SPEC_PATH` (optional)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            db_path: lookup("EPOCHFLOW_DB_PATH").unwrap_or_else(|| "data/epochflow.db".to_string()),

            genesis_timestamp: lookup("GENESIS_TIMESTAMP")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(MAINNET_GENESIS_TIMESTAMP),

            seconds_per_unit: parsed("SECONDS_PER_UNIT").unwrap_or(384),

            buckets_per_partition: parsed("BUCKETS_PER_PARTITION").unwrap_or(6),

            parallelism: parsed("AGGREGATION_PARALLELISM").unwrap_or(10) as usize,

            rolling_bootstrap_threshold: parsed("ROLLING_BOOTSTRAP_THRESHOLD").unwrap_or(1),

            interval_ms: parsed("AGGREGATION_INTERVAL_MS").unwrap_or(12_000),

            source_table: lookup("SOURCE_TABLE")
                .unwrap_or_else(|| "validator_dashboard_data_epoch".to_string()),

            rolling_table: lookup("ROLLING_TABLE")
                .unwrap_or_else(|| "validator_dashboard_data_rolling_daily".to_string()),

            fixed_table: lookup("FIXED_TABLE")
                .unwrap_or_else(|| "validator_dashboard_data_daily".to_string()),

            field_spec_path: lookup("FIELD_SPEC_PATH").filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.seconds_per_unit == 0 {
            return Err(AggregationError::Config("SECONDS_PER_UNIT must be > 0".to_string()));
        }
        if self.seconds_per_unit > 86_400 {
            return Err(AggregationError::Config(format!(
                "SECONDS_PER_UNIT {} does not fit in a day",
                self.seconds_per_unit
            )));
        }
        if self.buckets_per_partition == 0 {
            return Err(AggregationError::Config("BUCKETS_PER_PARTITION must be > 0".to_string()));
        }
        if self.parallelism == 0 {
            return Err(AggregationError::Config("AGGREGATION_PARALLELISM must be > 0".to_string()));
        }
        if self.interval_ms == 0 {
            return Err(AggregationError::Config("AGGREGATION_INTERVAL_MS must be > 0".to_string()));
        }
        for table in [&self.source_table, &self.rolling_table, &self.fixed_table] {
            validate_identifier(table)?;
        }
        Ok(())
    }

    /// Clock with one bucket per UTC day
    pub fn clock(&self) -> TimeUnitClock {
        TimeUnitClock::daily(
            self.genesis_timestamp,
            self.seconds_per_unit,
            self.buckets_per_partition,
        )
    }

    /// Merge table from `FIELD_SPEC_PATH`, or the validator dashboard default
    pub fn fields(&self) -> Result<FieldMergeSpec> {
        match &self.field_spec_path {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    AggregationError::Config(format!("failed to read field spec {path}: {e}"))
                })?;
                FieldMergeSpec::from_json(&json)
            }
            None => Ok(FieldMergeSpec::validator_dashboard()),
        }
    }

    /// Unit table to daily buckets plus a rolling 24h window
    pub fn day_family(&self) -> Result<AggregationFamily> {
        self.validate()?;
        let clock = self.clock();
        Ok(AggregationFamily {
            name: "day".to_string(),
            clock,
            fields: Arc::new(self.fields()?),
            source_table: self.source_table.clone(),
            rolling: Some(RollingTarget {
                table: self.rolling_table.clone(),
                window_units: clock.units_per_bucket(),
                bootstrap_threshold: self.rolling_bootstrap_threshold,
            }),
            fixed_table: self.fixed_table.clone(),
        })
    }
}
