//! Bounded fan-out of aggregation tasks
//!
//! Every task takes a permit from the shared [`AggregationBudget`] before it
//! runs, so the total number of running aggregations stays bounded across
//! all orchestrators cloned from the same budget. [`TaskGroup::wait`] drains
//! every task before returning the first error.

use super::error::{AggregationError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct AggregationBudget {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AggregationBudget {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AggregationError::Task {
                task: "budget".to_string(),
                reason: e.to_string(),
            })
    }
}

pub struct TaskGroup {
    budget: AggregationBudget,
    tasks: JoinSet<Result<()>>,
}

impl TaskGroup {
    pub fn new(budget: AggregationBudget) -> Self {
        Self {
            budget,
            tasks: JoinSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `fut` once a permit is available. A panic inside it is reported
    /// as a `Task` error carrying `name`.
    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let budget = self.budget.clone();
        self.tasks.spawn(async move {
            let _permit = budget.acquire().await?;
            match tokio::spawn(fut).await {
                Ok(result) => result.map_err(|e| e.wrap(format!("{name} failed"))),
                Err(e) => {
                    log::error!("❌ Aggregation task {} did not complete: {}", name, e);
                    Err(AggregationError::Task {
                        task: name,
                        reason: e.to_string(),
                    })
                }
            }
        });
    }

    /// Wait for every task and return the first error seen
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(AggregationError::Task {
                    task: "aggregation".to_string(),
                    reason: e.to_string(),
                })
            });
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    log::warn!("⚠️  Additional aggregation failure: {}", e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
