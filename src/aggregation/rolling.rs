//! Rolling window aggregation (e.g. "last 24 hours")
//!
//! The destination holds one row per validator merging every source row with
//! `epoch_start` in `[tail, head]`, where `head` starts the newest source row
//! and `tail` is the first source row starting at or after `end - W`, `end`
//! being the head row's `epoch_end`. For a unit-level source that is
//! `max(0, head - W + 1)`. Every row carries `epoch_start = tail` and
//! `epoch_end = end`, which is how the represented window is read back.
//!
//! `bootstrap` empties the table and rebuilds it. `slide` re-aggregates the
//! same bounded window but applies it in place: validators are upserted and
//! the ones with nothing left in the window are deleted. Both run the same
//! aggregation query, so a slide always equals a fresh bootstrap at that head.

use super::db::{validate_identifier, SqliteStore};
use super::error::{AggregationError, Result, StoreContext};
use super::fields::FieldMergeSpec;
use super::gaps::{missing_tail_units, window_start};
use super::orchestrator::Aggregation;
use super::source::SourceReader;
use super::types::UnitBounds;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Arc;
use std::time::Instant;

/// Window represented in the rolling table.
///
/// `tail` and `head` are the first and last source row starts merged,
/// `end` is the exclusive end of the head row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub tail: u64,
    pub head: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingAction {
    UpToDate,
    Bootstrap,
    Slide,
}

/// Decide how to bring the rolling table from `state` to `target`.
pub fn plan(
    state: Option<WindowState>,
    target: WindowState,
    window_units: u64,
    bootstrap_threshold: u64,
) -> RollingAction {
    let Some(state) = state else {
        return RollingAction::Bootstrap;
    };
    if state.head > target.head {
        // source went backwards, nothing in the table can be trusted
        return RollingAction::Bootstrap;
    }
    if state == target {
        return RollingAction::UpToDate;
    }

    let lag = target.head - state.head;
    if lag > bootstrap_threshold || lag >= window_units {
        RollingAction::Bootstrap
    } else {
        RollingAction::Slide
    }
}

#[derive(Clone)]
pub struct RollingWindowAggregator {
    store: SqliteStore,
    reader: Arc<dyn SourceReader>,
    fields: Arc<FieldMergeSpec>,
    source_table: String,
    table: String,
    window_units: u64,
    bootstrap_threshold: u64,
}

impl RollingWindowAggregator {
    pub fn new(
        store: SqliteStore,
        reader: Arc<dyn SourceReader>,
        fields: Arc<FieldMergeSpec>,
        source_table: &str,
        table: &str,
        window_units: u64,
        bootstrap_threshold: u64,
    ) -> Result<Self> {
        validate_identifier(source_table)?;
        validate_identifier(table)?;
        if window_units == 0 {
            return Err(AggregationError::Config(format!(
                "rolling table {table} needs a window of at least one unit"
            )));
        }
        Ok(Self {
            store,
            reader,
            fields,
            source_table: source_table.to_string(),
            table: table.to_string(),
            window_units,
            bootstrap_threshold,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn window_units(&self) -> u64 {
        self.window_units
    }

    /// Window the table currently represents, `None` when it is empty
    pub fn current_window(&self, conn: &Connection) -> Result<Option<WindowState>> {
        let stored: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                &format!("SELECT MIN(epoch_start), MAX(epoch_end) FROM {}", self.table),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context(format!("failed to read window of {}", self.table))?;

        let Some((Some(tail), Some(epoch_end))) = stored else {
            return Ok(None);
        };

        let head: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT MAX(epoch_start) FROM {} WHERE epoch_start < ?1",
                    self.source_table
                ),
                [epoch_end],
                |row| row.get(0),
            )
            .context(format!("failed to resolve head of {}", self.table))?;

        Ok(head.map(|head| WindowState {
            tail: tail as u64,
            head: head as u64,
            end: epoch_end as u64,
        }))
    }

    /// Window the table should represent once it ends with the `head` row
    pub fn target_window(&self, conn: &Connection, head: UnitBounds) -> Result<WindowState> {
        let start = window_start(head.epoch_end, self.window_units);
        let tail: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT MIN(epoch_start) FROM {} WHERE epoch_start >= ?1 AND epoch_start <= ?2",
                    self.source_table
                ),
                params![start as i64, head.epoch_start as i64],
                |row| row.get(0),
            )
            .context(format!("failed to resolve tail of {}", self.table))?;

        Ok(WindowState {
            tail: tail.map_or(start, |t| t as u64),
            head: head.epoch_start,
            end: head.epoch_end,
        })
    }

    /// How many units the table is behind `head`. `NotFound` while empty.
    pub fn lag(&self, head: u64) -> Result<u64> {
        let conn = self.store.open()?;
        match self.current_window(&conn)? {
            Some(state) => Ok(head.saturating_sub(state.head)),
            None => Err(AggregationError::NotFound(self.table.clone())),
        }
    }

    /// Starts of the source rows that have to be applied to reach `head`
    pub fn missing_units(&self, head: UnitBounds) -> Result<Vec<u64>> {
        let conn = self.store.open()?;
        let current = self
            .current_window(&conn)?
            .map(|s| (s.tail, s.end.saturating_sub(1)));
        let target = self.target_window(&conn, head)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT DISTINCT epoch_start FROM {} \
                 WHERE epoch_start >= ?1 AND epoch_start <= ?2 ORDER BY epoch_start",
                self.source_table
            ))
            .context("failed to prepare source row starts")?;
        let starts = stmt
            .query_map(params![target.tail as i64, target.head as i64], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to read source row starts")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read source row starts")?;

        let wanted = missing_tail_units(self.window_units, head.epoch_end.saturating_sub(1), current);
        Ok(starts
            .into_iter()
            .map(|start| start as u64)
            .filter(|start| wanted.binary_search(start).is_ok())
            .collect())
    }

    /// Empty the table and rebuild it over the window ending with `head`.
    pub fn bootstrap(&self, head: UnitBounds) -> Result<usize> {
        let started = Instant::now();
        let mut conn = self.store.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start bootstrap transaction")?;
        let target = self.target_window(&tx, head)?;
        log::info!(
            "🔄 Bootstrapping {} over epochs [{}, {})",
            self.table,
            target.tail,
            target.end
        );

        tx.execute(&format!("DELETE FROM {}", self.table), [])
            .context(format!("failed to clear {}", self.table))?;
        let validators = tx
            .execute(
                &self.window_sql(false),
                params![target.tail as i64, target.head as i64, target.end as i64],
            )
            .context(format!("failed to bootstrap {}", self.table))?;
        tx.commit().context("failed to commit bootstrap")?;

        log::info!(
            "bootstrap of {} took {:?} ({} validators)",
            self.table,
            started.elapsed(),
            validators
        );
        Ok(validators)
    }

    /// Move the window to end at `head`, updating rows in place.
    pub fn slide(&self, head: UnitBounds) -> Result<usize> {
        let started = Instant::now();
        let mut conn = self.store.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start slide transaction")?;
        let target = self.target_window(&tx, head)?;
        let validators = tx
            .execute(
                &self.window_sql(true),
                params![target.tail as i64, target.head as i64, target.end as i64],
            )
            .context(format!("failed to slide {}", self.table))?;
        let dropped = tx
            .execute(
                &format!(
                    "DELETE FROM {table} WHERE validator_index NOT IN (
                        SELECT validator_index FROM {source}
                        WHERE epoch_start >= ?1 AND epoch_start <= ?2
                    )",
                    table = self.table,
                    source = self.source_table,
                ),
                params![target.tail as i64, target.head as i64],
            )
            .context(format!("failed to drop expired validators from {}", self.table))?;
        tx.commit().context("failed to commit slide")?;

        log::debug!(
            "slid {} to [{}, {}) in {:?} ({} upserted, {} dropped)",
            self.table,
            target.tail,
            target.end,
            started.elapsed(),
            validators,
            dropped
        );
        Ok(validators)
    }

    /// Bring the table up to the newest source unit. Blocking.
    pub fn refresh(&self) -> Result<RollingAction> {
        let head = match self.reader.last_full_unit_bucket() {
            Ok(bounds) => bounds,
            // fresh database: aggregate from genesis
            Err(e) if e.is_not_found() => UnitBounds::new(0, 1),
            Err(e) => return Err(e.wrap("failed to get latest unit bucket")),
        };

        let (state, target) = {
            let conn = self.store.open()?;
            (self.current_window(&conn)?, self.target_window(&conn, head)?)
        };
        let action = plan(state, target, self.window_units, self.bootstrap_threshold);
        match action {
            RollingAction::UpToDate => {
                log::debug!("{} already at epoch {}", self.table, head.epoch_start);
            }
            RollingAction::Bootstrap => {
                if let Some(state) = state {
                    log::warn!(
                        "{} is {} epochs behind head {}, rebuilding",
                        self.table,
                        head.epoch_start.saturating_sub(state.head),
                        head.epoch_start
                    );
                }
                self.bootstrap(head)?;
            }
            RollingAction::Slide => {
                self.slide(head)?;
            }
        }
        Ok(action)
    }

    /// Aggregate `[?1, ?2]` per validator into the table; `?3` is the
    /// window's exclusive end.
    fn window_sql(&self, upsert: bool) -> String {
        let source = &self.source_table;
        let columns = self.fields.column_list();
        let on_conflict = if upsert {
            format!(
                "ON CONFLICT (validator_index) DO UPDATE SET
                    epoch_start = excluded.epoch_start,
                    epoch_end = excluded.epoch_end,
                    balance_start = excluded.balance_start,
                    balance_end = excluded.balance_end,
                    {}",
                self.fields.upsert_assignments()
            )
        } else {
            String::new()
        };

        format!(
            "WITH
                bounds AS (
                    SELECT MIN(epoch_start) AS first_epoch, MAX(epoch_start) AS last_epoch
                    FROM {source} WHERE epoch_start >= ?1 AND epoch_start <= ?2
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
                    WHERE epoch_start >= ?1 AND epoch_start <= ?2
                    GROUP BY validator_index
                )
            INSERT INTO {table} (
                validator_index, epoch_start, epoch_end, balance_start, balance_end,
                {columns}
            )
            SELECT merged.validator_index, ?1, ?3,
                balance_starts.balance_start, balance_ends.balance_end,
                {columns}
            FROM merged
            LEFT JOIN balance_starts ON merged.validator_index = balance_starts.validator_index
            LEFT JOIN balance_ends ON merged.validator_index = balance_ends.validator_index
            WHERE true
            {on_conflict}",
            table = self.table,
            aggregates = self.fields.aggregate_list(),
        )
    }
}

#[async_trait]
impl Aggregation for RollingWindowAggregator {
    fn name(&self) -> &str {
        &self.table
    }

    async fn aggregate(&self) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.refresh())
            .await
            .map_err(|e| AggregationError::Task {
                task: self.table.clone(),
                reason: e.to_string(),
            })?
            .map(|_| ())
    }
}
