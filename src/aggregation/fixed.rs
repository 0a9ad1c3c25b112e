//! Fixed-bucket aggregation (e.g. one row per UTC day and validator)
//!
//! Buckets are processed in ascending order from where the destination left
//! off up to the bucket holding the newest source unit. A bucket whose stored
//! `epoch_end` already equals its exclusive bound is complete and never
//! rewritten; a partially covered bucket is written with its true partial
//! `epoch_end` and corrected on a later run.

use super::clock::TimeUnitClock;
use super::db::{validate_identifier, SqliteStore};
use super::error::{AggregationError, Result, StoreContext};
use super::fields::FieldMergeSpec;
use super::orchestrator::Aggregation;
use super::partitions::PartitionManager;
use super::source::SourceReader;
use super::types::UnitBounds;
use async_trait::async_trait;
use rusqlite::{params, Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketOutcome {
    /// Already complete, untouched
    Skipped,
    Written { bounds: UnitBounds, validators: usize, complete: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedRunSummary {
    pub written: usize,
    pub skipped: usize,
    pub completed: usize,
}

#[derive(Clone)]
pub struct FixedBucketAggregator {
    store: SqliteStore,
    reader: Arc<dyn SourceReader>,
    clock: TimeUnitClock,
    fields: Arc<FieldMergeSpec>,
    source_table: String,
    partitions: PartitionManager,
}

impl FixedBucketAggregator {
    pub fn new(
        store: SqliteStore,
        reader: Arc<dyn SourceReader>,
        clock: TimeUnitClock,
        fields: Arc<FieldMergeSpec>,
        source_table: &str,
        fixed_table: &str,
    ) -> Result<Self> {
        validate_identifier(source_table)?;
        Ok(Self {
            store,
            reader,
            clock,
            fields,
            source_table: source_table.to_string(),
            partitions: PartitionManager::new(fixed_table)?,
        })
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    /// Bring every bucket up to the newest source unit. Blocking.
    pub fn run(&self) -> Result<FixedRunSummary> {
        let started = Instant::now();
        let mut summary = FixedRunSummary::default();

        let latest_unit = match self.reader.last_full_unit_bucket() {
            Ok(bounds) => bounds,
            Err(e) if e.is_not_found() => {
                log::info!("no source data in {} yet, nothing to aggregate", self.source_table);
                return Ok(summary);
            }
            Err(e) => return Err(e.wrap("failed to get latest unit bucket")),
        };

        let resume_from = match self.reader.last_full_fixed_bucket() {
            Ok(bounds) => bounds.epoch_start,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e.wrap("failed to get latest fixed bucket")),
        };

        let head = latest_unit.epoch_start;
        let mut conn = self.store.open()?;
        let mut unit = resume_from;

        while unit <= head {
            let (bucket_start, bucket_end) = self.clock.bucket_bounds(unit);
            let outcome = self
                .aggregate_bucket(&mut conn, bucket_start, bucket_end, head)
                .map_err(|e| {
                    log::error!("failed to aggregate bucket [{}, {}): {}", bucket_start, bucket_end, e);
                    e.wrap(format!("failed to aggregate bucket [{bucket_start}, {bucket_end})"))
                })?;

            match outcome {
                BucketOutcome::Skipped => summary.skipped += 1,
                BucketOutcome::Written { complete, .. } => {
                    summary.written += 1;
                    if complete {
                        summary.completed += 1;
                    }
                }
            }
            unit = bucket_end;
        }

        log::info!(
            "{} aggregate took {:?} (written: {}, complete: {}, skipped: {})",
            self.partitions.table(),
            started.elapsed(),
            summary.written,
            summary.completed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Aggregate one bucket `[bucket_start, bucket_end)` using source units up to `head`.
    pub fn aggregate_bucket(
        &self,
        conn: &mut Connection,
        bucket_start: u64,
        bucket_end: u64,
        head: u64,
    ) -> Result<BucketOutcome> {
        let key = self.clock.unit_to_time(bucket_start).timestamp();

        if let Some(stored) = self.partitions.stored_bounds(conn, key)? {
            if stored.epoch_start != bucket_start || stored.epoch_end > bucket_end {
                return Err(AggregationError::InvariantViolation(format!(
                    "bucket {} stores [{}, {}) but its bounds are [{}, {})",
                    key, stored.epoch_start, stored.epoch_end, bucket_start, bucket_end
                )));
            }
            if stored.epoch_end == bucket_end {
                log::debug!("skipping bucket [{}, {}) since it is complete", bucket_start, bucket_end);
                return Ok(BucketOutcome::Skipped);
            }
        }

        log::info!("aggregating bucket of epoch {}", bucket_start);
        let (from, to) = self.clock.partition_bounds(bucket_start);
        let partition = self
            .partitions
            .ensure(conn, &self.fields, from, to)
            .context("failed to create partition")?;

        let range_end = bucket_end.min(head + 1);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        let validators = tx
            .execute(
                &self.upsert_sql(&partition.name),
                params![bucket_start as i64, range_end as i64, key],
            )
            .context(format!("failed to upsert bucket {key} into {}", partition.name))?;

        let epoch_end: Option<i64> = tx
            .query_row(
                &format!("SELECT MAX(epoch_end) FROM {} WHERE bucket = ?1", partition.name),
                [key],
                |row| row.get(0),
            )
            .context("failed to read back bucket")?;
        tx.commit().context("failed to commit bucket")?;

        let bounds = UnitBounds::new(bucket_start, epoch_end.map_or(bucket_start, |e| e as u64));
        Ok(BucketOutcome::Written {
            bounds,
            validators,
            complete: bounds.epoch_end == bucket_end,
        })
    }

    fn upsert_sql(&self, partition: &str) -> String {
        let source = &self.source_table;
        let columns = self.fields.column_list();
        format!(
            "WITH
                bounds AS (
                    SELECT MIN(epoch_start) AS first_epoch, MAX(epoch_start) AS last_epoch,
                           MAX(epoch_end) AS epoch_end
                    FROM {source} WHERE epoch_start >= ?1 AND epoch_start < ?2
                ),
                balance_starts AS (
                    SELECT validator_index, balance_start FROM {source}
                    WHERE epoch_start = (SELECT first_epoch FROM bounds)
                ),
                balance_ends AS (
                    SELECT validator_index, balance_end FROM {source}
                    WHERE epoch_start = (SELECT last_epoch FROM bounds)
                ),
                merged AS (
                    SELECT validator_index,
                        {aggregates}
                    FROM {source}
                    WHERE epoch_start >= ?1 AND epoch_start < ?2
                    GROUP BY validator_index
                )
            INSERT INTO {partition} (
                bucket, epoch_start, epoch_end, validator_index, balance_start, balance_end,
                {columns}
            )
            SELECT ?3, ?1, (SELECT epoch_end FROM bounds), merged.validator_index,
                balance_starts.balance_start, balance_ends.balance_end,
                {columns}
            FROM merged
            LEFT JOIN balance_starts ON merged.validator_index = balance_starts.validator_index
            LEFT JOIN balance_ends ON merged.validator_index = balance_ends.validator_index
            WHERE true
            ON CONFLICT (bucket, validator_index) DO UPDATE SET
                epoch_start = excluded.epoch_start,
                epoch_end = excluded.epoch_end,
                balance_start = excluded.balance_start,
                balance_end = excluded.balance_end,
                {assignments}",
            aggregates = self.fields.aggregate_list(),
            assignments = self.fields.upsert_assignments(),
        )
    }
}

#[async_trait]
impl Aggregation for FixedBucketAggregator {
    fn name(&self) -> &str {
        self.partitions.table()
    }

    async fn aggregate(&self) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.run())
            .await
            .map_err(|e| AggregationError::Task {
                task: self.partitions.table().to_string(),
                reason: e.to_string(),
            })?
            .map(|_| ())
    }
}
