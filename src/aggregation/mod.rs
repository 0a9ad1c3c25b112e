//! # Validator Metrics Aggregation
//!
//! Keeps pre-aggregated views of the per-epoch validator table so readers
//! never rescan raw epochs:
//! - a rolling window table (one row per validator, last 225 epochs)
//! - a fixed-bucket table (one row per UTC day and validator), physically
//!   split into date-range partitions
//!
//! ## Flow
//!
//! 1. The ingester (outside this crate) appends unit rows to the source table
//! 2. `AggregationOrchestrator::run_aggregation` takes the family lock
//! 3. Rolling and fixed aggregators run concurrently under the shared budget
//! 4. Each destination write is its own SQLite transaction
//!
//! Every destination row can be recomputed from the source table, so running
//! an aggregation again after a failure converges to the same rows.
//!
//! ## Module Organization
//!
//! - `clock` - epoch to wall-clock, bucket and partition bounds
//! - `fields` - merge operators per accumulable column
//! - `source` - ingestion/aggregation cursors
//! - `gaps` - units missing from the rolling window
//! - `rolling` - rolling window aggregator
//! - `partitions` - partition registry and tables
//! - `fixed` - fixed-bucket aggregator
//! - `task_group` - bounded concurrent tasks, first error wins
//! - `orchestrator` - per-family lock and fan-out

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod fields;
pub mod fixed;
pub mod gaps;
pub mod orchestrator;
pub mod partitions;
pub mod rolling;
pub mod source;
pub mod task_group;
pub mod types;

pub use clock::TimeUnitClock;
pub use config::{AggregationConfig, AggregationFamily, RollingTarget};
pub use db::SqliteStore;
pub use error::{AggregationError, Result};
pub use fields::{FieldKind, FieldMergeSpec, FieldSpec, FieldValue, MergeOp};
pub use fixed::{BucketOutcome, FixedBucketAggregator, FixedRunSummary};
pub use orchestrator::{Aggregation, AggregationOrchestrator, OrchestratorState};
pub use rolling::{RollingAction, RollingWindowAggregator, WindowState};
pub use source::{InMemorySourceReader, SourceReader, SqliteSourceReader};
pub use task_group::{AggregationBudget, TaskGroup};
pub use types::{AggregateRow, BalanceEndpoints, SourceRow, UnitBounds};
