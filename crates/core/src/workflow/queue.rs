//! Execution queues for remote mode.
//!
//! The orchestrator hands a step over as an opaque unit of work and polls
//! for completion; whoever serves the queue runs the regular lifecycle.

use crate::error::{PipelineError, PipelineResult};
use crate::types::DatasetId;
use crate::workflow::lifecycle::{StepAttempt, StepLifecycle};
use crate::workflow::step::PipelineStep;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A step plus the upstream outputs it consumes
#[derive(Clone)]
pub struct WorkUnit {
    pub step: Arc<dyn PipelineStep>,
    pub upstream: Vec<DatasetId>,
}

#[derive(Debug)]
pub enum QueueState {
    Pending,
    Running,
    Finished(StepAttempt),
}

#[async_trait::async_trait]
pub trait ExecutionQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, unit: WorkUnit) -> PipelineResult<TicketId>;

    /// Current state of a ticket; a finished ticket is handed out once
    async fn poll(&self, ticket: TicketId) -> PipelineResult<QueueState>;
}

/// Queue served by in-process workers running the step lifecycle
pub struct WorkerQueue {
    name: String,
    lifecycle: Arc<StepLifecycle>,
    workers: Arc<Semaphore>,
    tickets: Arc<RwLock<HashMap<TicketId, QueueState>>>,
}

impl WorkerQueue {
    pub fn new(name: impl Into<String>, lifecycle: Arc<StepLifecycle>, workers: usize) -> Self {
        Self {
            name: name.into(),
            lifecycle,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            tickets: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait::async_trait]
impl ExecutionQueue for WorkerQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, unit: WorkUnit) -> PipelineResult<TicketId> {
        let ticket = TicketId::new();
        self.tickets.write().await.insert(ticket, QueueState::Pending);

        tracing::info!(queue = %self.name, step = unit.step.name(), %ticket, "Submitted step");

        let workers = self.workers.clone();
        let tickets = self.tickets.clone();
        let lifecycle = self.lifecycle.clone();

        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let attempt = StepAttempt {
                        run_id: None,
                        result: Err(PipelineError::Infrastructure(anyhow::anyhow!(
                            "worker queue closed"
                        ))),
                    };
                    tickets
                        .write()
                        .await
                        .insert(ticket, QueueState::Finished(attempt));
                    return;
                }
            };
            tickets.write().await.insert(ticket, QueueState::Running);

            let attempt = lifecycle.execute_isolated(unit.step, unit.upstream).await;

            tickets
                .write()
                .await
                .insert(ticket, QueueState::Finished(attempt));
        });

        Ok(ticket)
    }

    async fn poll(&self, ticket: TicketId) -> PipelineResult<QueueState> {
        let mut tickets = self.tickets.write().await;
        match tickets.get(&ticket) {
            None => Err(PipelineError::Config(format!(
                "Unknown ticket {} on queue {}",
                ticket, self.name
            ))),
            Some(QueueState::Pending) => Ok(QueueState::Pending),
            Some(QueueState::Running) => Ok(QueueState::Running),
            Some(QueueState::Finished(_)) => tickets.remove(&ticket).ok_or_else(|| {
                PipelineError::Config(format!("Ticket {} vanished", ticket))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::lifecycle::tests::{lifecycle_in, ScriptedStep};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_for(queue: &WorkerQueue, ticket: TicketId) -> StepAttempt {
        loop {
            if let QueueState::Finished(attempt) = queue.poll(ticket).await.unwrap() {
                return attempt;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_queue_runs_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = Arc::new(lifecycle_in(temp_dir.path()));
        let queue = WorkerQueue::new("gpu", lifecycle.clone(), 1);

        let step = ScriptedStep::new(temp_dir.path(), "preprocess");
        step.seed_input(&[("a.csv", "1")]);

        let ticket = queue
            .submit(WorkUnit {
                step: Arc::new(step),
                upstream: Vec::new(),
            })
            .await
            .unwrap();

        let attempt = wait_for(&queue, ticket).await;
        let report = attempt.result.unwrap();
        assert_eq!(attempt.run_id, Some(report.run_id));
        assert!(lifecycle.datasets().is_intact(&report.output).await.unwrap());

        // Handed out once
        assert!(queue.poll(ticket).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_queue_reports_failures() {
        let temp_dir = TempDir::new().unwrap();
        let queue = WorkerQueue::new("default", Arc::new(lifecycle_in(temp_dir.path())), 2);

        let step = ScriptedStep::new(temp_dir.path(), "preprocess").failing(1);
        step.seed_input(&[("a.csv", "1")]);

        let ticket = queue
            .submit(WorkUnit {
                step: Arc::new(step),
                upstream: Vec::new(),
            })
            .await
            .unwrap();

        let attempt = wait_for(&queue, ticket).await;
        assert!(attempt.run_id.is_some());
        assert!(matches!(
            attempt.result,
            Err(PipelineError::StepProcessing { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_panic_leaves_failed_run() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = Arc::new(lifecycle_in(temp_dir.path()));
        let queue = WorkerQueue::new("default", lifecycle.clone(), 1);

        let step = ScriptedStep::new(temp_dir.path(), "preprocess").panicking();
        step.seed_input(&[("a.csv", "1")]);
        let ticket = queue
            .submit(WorkUnit {
                step: Arc::new(step),
                upstream: Vec::new(),
            })
            .await
            .unwrap();

        let attempt = wait_for(&queue, ticket).await;
        assert!(matches!(
            attempt.result,
            Err(PipelineError::Infrastructure(_))
        ));
        let runs = lifecycle.registry().runs_for_step("preprocess").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(Some(runs[0].id), attempt.run_id);
        assert_eq!(runs[0].status, crate::types::RunStatus::Failed);
    }
}
