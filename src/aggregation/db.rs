//! SQLite store: connections, schema and row encoding
//!
//! Table names come from configuration and are spliced into SQL, so every
//! name passes [`validate_identifier`] first.

use super::error::{AggregationError, Result, StoreContext};
use super::fields::FieldMergeSpec;
use super::types::{AggregateRow, BalanceEndpoints, SourceRow, UnitBounds};
use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{params_from_iter, Connection, Row, ToSql, TransactionBehavior};
use std::path::{Path, PathBuf};

/// Handle to the database file. Each unit of work opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AggregationError::Config(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(&self.path)
            .context(format!("failed to open {}", self.path.display()))?;
        apply_optimized_pragmas(&conn).context("failed to apply pragmas")?;
        Ok(conn)
    }
}

pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AggregationError::Config(format!("invalid table or column name {:?}", name)))
    }
}

/// Unit-level table the ingester writes; one row per `(epoch_start, validator_index)`
pub fn ensure_source_table(conn: &Connection, table: &str, spec: &FieldMergeSpec) -> Result<()> {
    validate_identifier(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
                epoch_start INTEGER NOT NULL,
                epoch_end INTEGER NOT NULL,
                validator_index INTEGER NOT NULL,
                balance_start INTEGER,
                balance_end INTEGER,
                {columns},
                PRIMARY KEY (epoch_start, validator_index)
            );",
        columns = spec.column_ddl(),
    ))
    .context(format!("failed to create source table {table}"))
}

pub fn ensure_rolling_table(conn: &Connection, table: &str, spec: &FieldMergeSpec) -> Result<()> {
    validate_identifier(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
                validator_index INTEGER PRIMARY KEY,
                epoch_start INTEGER NOT NULL,
                epoch_end INTEGER NOT NULL,
                balance_start INTEGER,
                balance_end INTEGER,
                {columns}
            );",
        columns = spec.column_ddl(),
    ))
    .context(format!("failed to create rolling table {table}"))
}

/// One physical partition of the fixed-bucket table
pub fn create_partition_table(conn: &Connection, name: &str, spec: &FieldMergeSpec) -> Result<()> {
    validate_identifier(name)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {name} (
                bucket INTEGER NOT NULL,
                epoch_start INTEGER NOT NULL,
                epoch_end INTEGER NOT NULL,
                validator_index INTEGER NOT NULL,
                balance_start INTEGER,
                balance_end INTEGER,
                {columns},
                PRIMARY KEY (bucket, validator_index)
            );",
        columns = spec.column_ddl(),
    ))
    .context(format!("failed to create partition {name}"))
}

/// Registry of the fixed-bucket table's partitions and their ranges
pub fn ensure_partition_registry(conn: &Connection, table: &str) -> Result<()> {
    validate_identifier(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table}_partitions (
                name TEXT PRIMARY KEY,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL
            );",
    ))
    .context(format!("failed to create partition registry for {table}"))
}

/// Bulk insert source rows in one transaction (ingester side of the contract).
///
/// Existing `(epoch_start, validator_index)` rows are replaced.
pub fn insert_source_rows(
    conn: &mut Connection,
    table: &str,
    spec: &FieldMergeSpec,
    rows: &[SourceRow],
) -> Result<usize> {
    validate_identifier(table)?;
    let placeholders = vec!["?"; 5 + spec.len()].join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO {table}
            (epoch_start, epoch_end, validator_index, balance_start, balance_end, {columns})
         VALUES ({placeholders})",
        columns = spec.column_list(),
    );

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start transaction")?;
    {
        let mut stmt = tx.prepare(&sql).context("failed to prepare source insert")?;
        for row in rows {
            if row.values.len() != spec.len() {
                return Err(AggregationError::InvariantViolation(format!(
                    "source row for validator {} has {} values, spec has {}",
                    row.validator_index,
                    row.values.len(),
                    spec.len()
                )));
            }
            let head: [&dyn ToSql; 5] = [
                &(row.bounds.epoch_start as i64),
                &(row.bounds.epoch_end as i64),
                &(row.validator_index as i64),
                &row.balance_start,
                &row.balance_end,
            ];
            let values = head
                .into_iter()
                .chain(row.values.iter().map(|v| v as &dyn ToSql));
            stmt.execute(params_from_iter(values))
                .context(format!("failed to insert source row at epoch {}", row.bounds.epoch_start))?;
        }
    }
    tx.commit().context("failed to commit source rows")?;

    Ok(rows.len())
}

/// Columns selected by [`read_aggregate_row`], after the optional bucket column
pub fn aggregate_select_list(spec: &FieldMergeSpec) -> String {
    format!(
        "epoch_start, epoch_end, validator_index, balance_start, balance_end, {}",
        spec.column_list()
    )
}

/// Decode a row produced by `SELECT [bucket,] <aggregate_select_list>`
pub fn read_aggregate_row(
    row: &Row<'_>,
    spec: &FieldMergeSpec,
    with_bucket: bool,
) -> rusqlite::Result<AggregateRow> {
    let base = usize::from(with_bucket);
    let bucket = if with_bucket { Some(row.get::<_, i64>(0)?) } else { None };
    let mut values = Vec::with_capacity(spec.len());
    for (i, field) in spec.fields().iter().enumerate() {
        values.push(field.read(row, base + 5 + i)?);
    }

    Ok(AggregateRow {
        bucket,
        bounds: UnitBounds::new(row.get::<_, i64>(base)? as u64, row.get::<_, i64>(base + 1)? as u64),
        validator_index: row.get::<_, i64>(base + 2)? as u64,
        balances: BalanceEndpoints {
            balance_start: row.get(base + 3)?,
            balance_end: row.get(base + 4)?,
        },
        values,
    })
}

/// All rows of the rolling table ordered by validator
pub fn read_rolling_rows(
    conn: &Connection,
    table: &str,
    spec: &FieldMergeSpec,
) -> Result<Vec<AggregateRow>> {
    validate_identifier(table)?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM {table} ORDER BY validator_index",
            aggregate_select_list(spec)
        ))
        .context(format!("failed to read {table}"))?;
    let rows = stmt
        .query_map([], |row| read_aggregate_row(row, spec, false))
        .context(format!("failed to read {table}"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context(format!("failed to decode {table}"))?;
    Ok(rows)
}
