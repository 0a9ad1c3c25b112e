//! Physical partitions of the fixed-bucket table
//!
//! SQLite has no declarative partitioning, so each partition is its own table
//! named after its UTC date range and recorded in `{table}_partitions`. The
//! registry makes creation idempotent and lets a conflicting shape be
//! detected before anything is written.

use super::db::{
    aggregate_select_list, create_partition_table, ensure_partition_registry,
    read_aggregate_row, validate_identifier,
};
use super::error::{AggregationError, Result, StoreContext};
use super::fields::FieldMergeSpec;
use super::types::{AggregateRow, UnitBounds};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    /// Unix seconds, inclusive
    pub range_start: i64,
    /// Unix seconds, exclusive
    pub range_end: i64,
}

#[derive(Debug, Clone)]
pub struct PartitionManager {
    table: String,
}

impl PartitionManager {
    pub fn new(table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn registry(&self) -> String {
        format!("{}_partitions", self.table)
    }

    /// `{table}_{YYYYMMDD}_{YYYYMMDD}`
    pub fn partition_name(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        format!("{}_{}_{}", self.table, from.format("%Y%m%d"), to.format("%Y%m%d"))
    }

    fn registry_exists(&self, conn: &Connection) -> Result<bool> {
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [self.registry()],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .context("failed to look up partition registry")
    }

    /// Create the partition for `[from, to)` unless it already exists.
    ///
    /// Fails with `PartitionConflict` when the name or any part of the range
    /// is already taken by a partition of a different shape.
    pub fn ensure(
        &self,
        conn: &mut Connection,
        spec: &FieldMergeSpec,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PartitionInfo> {
        let requested = PartitionInfo {
            name: self.partition_name(from, to),
            range_start: from.timestamp(),
            range_end: to.timestamp(),
        };

        ensure_partition_registry(conn, &self.table)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start partition transaction")?;

        let existing = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT name, range_start, range_end FROM {}
                     WHERE name = ?1 OR (range_start < ?3 AND range_end > ?2)",
                    self.registry()
                ))
                .context("failed to query partition registry")?;
            let rows = stmt
                .query_map(
                    params![requested.name, requested.range_start, requested.range_end],
                    |row| {
                        Ok(PartitionInfo {
                            name: row.get(0)?,
                            range_start: row.get(1)?,
                            range_end: row.get(2)?,
                        })
                    },
                )
                .context("failed to query partition registry")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to decode partition registry")?;
            rows
        };

        if let Some(conflict) = existing.iter().find(|p| **p != requested) {
            return Err(AggregationError::PartitionConflict {
                requested: requested.name,
                start: requested.range_start,
                end: requested.range_end,
                existing: conflict.name.clone(),
                existing_start: conflict.range_start,
                existing_end: conflict.range_end,
            });
        }

        if existing.is_empty() {
            tx.execute(
                &format!(
                    "INSERT INTO {} (name, range_start, range_end) VALUES (?1, ?2, ?3)",
                    self.registry()
                ),
                params![requested.name, requested.range_start, requested.range_end],
            )
            .context(format!("failed to register partition {}", requested.name))?;
            log::info!(
                "📦 Creating partition {} ({} to {})",
                requested.name,
                from.format("%d-%B-%Y"),
                to.format("%d-%B-%Y")
            );
        }

        // also heals a registry row whose table went missing
        create_partition_table(&tx, &requested.name, spec)?;
        tx.commit().context("failed to commit partition")?;

        Ok(requested)
    }

    /// Registered partitions ordered by range
    pub fn partitions(&self, conn: &Connection) -> Result<Vec<PartitionInfo>> {
        if !self.registry_exists(conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT name, range_start, range_end FROM {} ORDER BY range_start",
                self.registry()
            ))
            .context("failed to list partitions")?;
        let partitions = stmt
            .query_map([], |row| {
                Ok(PartitionInfo {
                    name: row.get(0)?,
                    range_start: row.get(1)?,
                    range_end: row.get(2)?,
                })
            })
            .context("failed to list partitions")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to decode partitions")?;
        Ok(partitions)
    }

    /// Partition whose range holds `bucket_key`, if one is registered
    pub fn covering(&self, conn: &Connection, bucket_key: i64) -> Result<Option<PartitionInfo>> {
        Ok(self
            .partitions(conn)?
            .into_iter()
            .find(|p| p.range_start <= bucket_key && bucket_key < p.range_end))
    }

    /// Stored `[epoch_start, epoch_end)` of one bucket, `None` if nothing is stored
    pub fn stored_bounds(&self, conn: &Connection, bucket_key: i64) -> Result<Option<UnitBounds>> {
        let Some(partition) = self.covering(conn, bucket_key)? else {
            return Ok(None);
        };
        let (start, end): (Option<i64>, Option<i64>) = conn
            .query_row(
                &format!(
                    "SELECT MIN(epoch_start), MAX(epoch_end) FROM {} WHERE bucket = ?1",
                    partition.name
                ),
                [bucket_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context(format!("failed to read bucket {bucket_key} from {}", partition.name))?;

        Ok(match (start, end) {
            (Some(start), Some(end)) => Some(UnitBounds::new(start as u64, end as u64)),
            _ => None,
        })
    }

    /// Bounds of the newest stored bucket across all partitions
    pub fn latest_bucket_bounds(&self, conn: &Connection) -> Result<UnitBounds> {
        for partition in self.partitions(conn)?.iter().rev() {
            let latest = conn
                .query_row(
                    &format!(
                        "SELECT epoch_start, epoch_end FROM {}
                         ORDER BY bucket DESC, epoch_end DESC LIMIT 1",
                        partition.name
                    ),
                    [],
                    |row| {
                        Ok(UnitBounds::new(
                            row.get::<_, i64>(0)? as u64,
                            row.get::<_, i64>(1)? as u64,
                        ))
                    },
                )
                .optional()
                .context(format!("failed to read latest bucket of {}", partition.name))?;
            if let Some(bounds) = latest {
                return Ok(bounds);
            }
        }
        Err(AggregationError::NotFound(self.table.clone()))
    }

    /// Rows of one bucket ordered by validator
    pub fn read_bucket(
        &self,
        conn: &Connection,
        spec: &FieldMergeSpec,
        bucket_key: i64,
    ) -> Result<Vec<AggregateRow>> {
        let Some(partition) = self.covering(conn, bucket_key)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn
            .prepare(&format!(
                "SELECT bucket, {} FROM {} WHERE bucket = ?1 ORDER BY validator_index",
                aggregate_select_list(spec),
                partition.name
            ))
            .context(format!("failed to read {}", partition.name))?;
        let rows = stmt
            .query_map([bucket_key], |row| read_aggregate_row(row, spec, true))
            .context(format!("failed to read {}", partition.name))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context(format!("failed to decode {}", partition.name))?;
        Ok(rows)
    }

    /// Every stored row ordered by bucket then validator
    pub fn read_all(&self, conn: &Connection, spec: &FieldMergeSpec) -> Result<Vec<AggregateRow>> {
        let mut all = Vec::new();
        for partition in self.partitions(conn)? {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT bucket, {} FROM {} ORDER BY bucket, validator_index",
                    aggregate_select_list(spec),
                    partition.name
                ))
                .context(format!("failed to read {}", partition.name))?;
            let rows = stmt
                .query_map([], |row| read_aggregate_row(row, spec, true))
                .context(format!("failed to read {}", partition.name))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context(format!("failed to decode {}", partition.name))?;
            all.extend(rows);
        }
        Ok(all)
    }
}
