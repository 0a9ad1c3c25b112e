//! Error taxonomy for the aggregation engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregationError {
    /// No prior state exists yet (fresh database). Callers start from genesis.
    #[error("no rows found in {0}")]
    NotFound(String),

    /// Read, write or transaction failure against the backing store
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("partition {requested} [{start}, {end}) conflicts with existing partition {existing} [{existing_start}, {existing_end})")]
    PartitionConflict {
        requested: String,
        start: i64,
        end: i64,
        existing: String,
        existing_start: i64,
        existing_end: i64,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A spawned aggregation task panicked or was cancelled
    #[error("task {task} did not complete: {reason}")]
    Task { task: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Error from a named phase, wrapped with what was being done
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AggregationError>,
    },
}

pub type Result<T> = std::result::Result<T, AggregationError>;

impl AggregationError {
    /// True when the innermost error is `NotFound`
    pub fn is_not_found(&self) -> bool {
        match self {
            AggregationError::NotFound(_) => true,
            AggregationError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Wrap this error with the phase it happened in
    pub fn wrap(self, context: impl Into<String>) -> Self {
        AggregationError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Attach operation context to store results.
pub trait StoreContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> StoreContext<T> for rusqlite::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| AggregationError::Store {
            context: context.into(),
            source,
        })
    }
}

impl<T> StoreContext<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.wrap(context))
    }
}
