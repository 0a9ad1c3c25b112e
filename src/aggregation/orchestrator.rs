//! Aggregation orchestrator
//!
//! One orchestrator per aggregation family. An invocation takes the family
//! lock, runs the rolling aggregator (only at the live head) and the
//! fixed-bucket aggregator concurrently under the shared budget, waits for
//! both and returns the first error.
//!
//! State per invocation: `Idle -> Locked -> Running -> Idle`.

use super::config::AggregationFamily;
use super::db::{ensure_rolling_table, ensure_source_table, SqliteStore};
use super::error::Result;
use super::fixed::FixedBucketAggregator;
use super::rolling::RollingWindowAggregator;
use super::source::{SourceReader, SqliteSourceReader};
use super::task_group::{AggregationBudget, TaskGroup};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// One destination kept up to date from the source table
#[async_trait]
pub trait Aggregation: Send + Sync {
    fn name(&self) -> &str;

    async fn aggregate(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OrchestratorState {
    Idle = 0,
    Locked = 1,
    Running = 2,
}

impl OrchestratorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => OrchestratorState::Locked,
            2 => OrchestratorState::Running,
            _ => OrchestratorState::Idle,
        }
    }
}

/// Returns the orchestrator to `Idle` on every exit path
struct StateGuard<'a> {
    state: &'a AtomicU8,
}

impl<'a> StateGuard<'a> {
    fn enter(state: &'a AtomicU8) -> Self {
        state.store(OrchestratorState::Locked as u8, Ordering::SeqCst);
        Self { state }
    }

    fn running(&self) {
        self.state.store(OrchestratorState::Running as u8, Ordering::SeqCst);
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.state.store(OrchestratorState::Idle as u8, Ordering::SeqCst);
    }
}

pub struct AggregationOrchestrator {
    name: String,
    lock: Mutex<()>,
    budget: AggregationBudget,
    rolling: Option<Arc<dyn Aggregation>>,
    fixed: Arc<dyn Aggregation>,
    state: AtomicU8,
}

impl AggregationOrchestrator {
    pub fn new(
        name: impl Into<String>,
        budget: AggregationBudget,
        rolling: Option<Arc<dyn Aggregation>>,
        fixed: Arc<dyn Aggregation>,
    ) -> Self {
        Self {
            name: name.into(),
            lock: Mutex::new(()),
            budget,
            rolling,
            fixed,
            state: AtomicU8::new(OrchestratorState::Idle as u8),
        }
    }

    /// Wire the SQLite-backed aggregators of `family`, creating the source and
    /// rolling tables if needed.
    pub fn from_family(
        store: SqliteStore,
        family: &AggregationFamily,
        budget: AggregationBudget,
    ) -> Result<Self> {
        {
            let conn = store.open()?;
            ensure_source_table(&conn, &family.source_table, &family.fields)?;
            if let Some(rolling) = &family.rolling {
                ensure_rolling_table(&conn, &rolling.table, &family.fields)?;
            }
        }

        let reader: Arc<dyn SourceReader> = Arc::new(SqliteSourceReader::new(
            store.clone(),
            &family.source_table,
            &family.fixed_table,
        )?);

        let rolling = match &family.rolling {
            Some(target) => Some(Arc::new(RollingWindowAggregator::new(
                store.clone(),
                reader.clone(),
                family.fields.clone(),
                &family.source_table,
                &target.table,
                target.window_units,
                target.bootstrap_threshold,
            )?) as Arc<dyn Aggregation>),
            None => None,
        };

        let fixed = Arc::new(FixedBucketAggregator::new(
            store,
            reader,
            family.clock,
            family.fields.clone(),
            &family.source_table,
            &family.fixed_table,
        )?);

        log::info!(
            "✅ Aggregation family {} ready (source: {}, fixed: {}, rolling: {})",
            family.name,
            family.source_table,
            family.fixed_table,
            family
                .rolling
                .as_ref()
                .map(|r| r.table.as_str())
                .unwrap_or("none")
        );

        Ok(Self::new(family.name.clone(), budget, rolling, fixed))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Run one aggregation pass. `operating_at_head` selects whether the
    /// rolling window is refreshed too.
    pub async fn run_aggregation(&self, operating_at_head: bool) -> Result<()> {
        let _lock = self.lock.lock().await;
        let state = StateGuard::enter(&self.state);
        let started = Instant::now();

        let mut group = TaskGroup::new(self.budget.clone());
        if operating_at_head {
            if let Some(rolling) = &self.rolling {
                let rolling = rolling.clone();
                group.spawn(rolling.name().to_string(), async move { rolling.aggregate().await });
            }
        }
        let fixed = self.fixed.clone();
        group.spawn(fixed.name().to_string(), async move { fixed.aggregate().await });

        state.running();
        let result = group.wait().await;

        match &result {
            Ok(()) => log::info!("{} aggregation took {:?}", self.name, started.elapsed()),
            Err(e) => log::error!("❌ {} aggregation failed after {:?}: {}", self.name, started.elapsed(), e),
        }
        result
    }
}
