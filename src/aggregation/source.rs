//! Export cursors: how far ingestion and fixed-bucket aggregation have progressed
//!
//! The orchestrator receives a [`SourceReader`] at construction instead of
//! looking cursors up globally, so tests can hand it an in-memory one.

use super::db::{validate_identifier, SqliteStore};
use super::error::{AggregationError, Result, StoreContext};
use super::partitions::PartitionManager;
use super::types::UnitBounds;
use rusqlite::OptionalExtension;
use std::sync::Mutex;

pub trait SourceReader: Send + Sync {
    /// Last unit-level bucket fully written by the ingester.
    ///
    /// `Err(NotFound)` on a fresh database.
    fn last_full_unit_bucket(&self) -> Result<UnitBounds>;

    /// Latest bucket of the fixed-bucket destination table.
    ///
    /// `Err(NotFound)` before the first fixed aggregation.
    fn last_full_fixed_bucket(&self) -> Result<UnitBounds>;
}

pub struct SqliteSourceReader {
    store: SqliteStore,
    source_table: String,
    partitions: PartitionManager,
}

impl SqliteSourceReader {
    pub fn new(store: SqliteStore, source_table: &str, fixed_table: &str) -> Result<Self> {
        validate_identifier(source_table)?;
        Ok(Self {
            store,
            source_table: source_table.to_string(),
            partitions: PartitionManager::new(fixed_table)?,
        })
    }
}

impl SourceReader for SqliteSourceReader {
    fn last_full_unit_bucket(&self) -> Result<UnitBounds> {
        let conn = self.store.open()?;
        let table = &self.source_table;
        let bounds = conn
            .query_row(
                &format!("SELECT epoch_start, epoch_end FROM {table} ORDER BY epoch_start DESC LIMIT 1"),
                [],
                |row| {
                    Ok(UnitBounds::new(
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )
            .optional()
            .context(format!("failed to read last exported bucket of {table}"))?;

        bounds.ok_or_else(|| AggregationError::NotFound(table.clone()))
    }

    fn last_full_fixed_bucket(&self) -> Result<UnitBounds> {
        let conn = self.store.open()?;
        self.partitions.latest_bucket_bounds(&conn)
    }
}

/// Cursor accessor backed by plain values
#[derive(Debug, Default)]
pub struct InMemorySourceReader {
    unit: Mutex<Option<UnitBounds>>,
    fixed: Mutex<Option<UnitBounds>>,
}

impl InMemorySourceReader {
    pub fn new(unit: Option<UnitBounds>, fixed: Option<UnitBounds>) -> Self {
        Self {
            unit: Mutex::new(unit),
            fixed: Mutex::new(fixed),
        }
    }

    pub fn set_unit(&self, bounds: Option<UnitBounds>) {
        if let Ok(mut guard) = self.unit.lock() {
            *guard = bounds;
        }
    }

    pub fn set_fixed(&self, bounds: Option<UnitBounds>) {
        if let Ok(mut guard) = self.fixed.lock() {
            *guard = bounds;
        }
    }

    fn read(slot: &Mutex<Option<UnitBounds>>, what: &str) -> Result<UnitBounds> {
        let guard = slot
            .lock()
            .map_err(|_| AggregationError::InvariantViolation(format!("{what} cursor poisoned")))?;
        (*guard).ok_or_else(|| AggregationError::NotFound(what.to_string()))
    }
}

impl SourceReader for InMemorySourceReader {
    fn last_full_unit_bucket(&self) -> Result<UnitBounds> {
        Self::read(&self.unit, "unit buckets")
    }

    fn last_full_fixed_bucket(&self) -> Result<UnitBounds> {
        Self::read(&self.fixed, "fixed buckets")
    }
}
