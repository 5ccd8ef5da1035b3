//! Pipeline orchestration: dependency order, caching, retries, local or
//! queued dispatch.

use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{DatasetId, ExecutionMode, ExecutionTarget, RunId, StepSpec, StepState};
use crate::workflow::cache::{CacheKey, StepCache};
use crate::workflow::lifecycle::{StepAttempt, StepLifecycle, StepReport};
use crate::workflow::pipeline::Pipeline;
use crate::workflow::queue::{ExecutionQueue, QueueState, WorkUnit};
use crate::workflow::step::PipelineStep;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Terminal state of one step within a pipeline run
#[derive(Debug)]
pub struct StepOutcome {
    pub step_name: String,
    pub state: StepState,
    pub attempts: u32,
    pub run_ids: Vec<RunId>,
    pub outputs: Vec<DatasetId>,
    pub error: Option<PipelineError>,
    pub cache_key: Option<String>,
}

impl StepOutcome {
    fn with_state(step_name: &str, state: StepState) -> Self {
        Self {
            step_name: step_name.to_string(),
            state,
            attempts: 0,
            run_ids: Vec::new(),
            outputs: Vec::new(),
            error: None,
            cache_key: None,
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub pipeline: String,
    /// One outcome per step, in topological order
    pub outcomes: Vec<StepOutcome>,
}

impl PipelineReport {
    pub fn outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step_name == step_name)
    }

    /// Every step succeeded or was served from the cache
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state.is_success())
    }

    /// Surface the error of the first failed step
    pub fn into_result(mut self) -> PipelineResult<Self> {
        let Some(failed) = self
            .outcomes
            .iter_mut()
            .find(|o| o.state == StepState::Failed)
        else {
            return Ok(self);
        };

        Err(failed.error.take().unwrap_or_else(|| {
            PipelineError::Config(format!("Step {} failed without an error", failed.step_name))
        }))
    }
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    settings: Arc<Settings>,
    lifecycle: Arc<StepLifecycle>,
    cache: Arc<StepCache>,
    queues: HashMap<String, Arc<dyn ExecutionQueue>>,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    pub fn new(lifecycle: Arc<StepLifecycle>, cache: Arc<StepCache>) -> Self {
        Self {
            settings: lifecycle.settings().clone(),
            lifecycle,
            cache,
            queues: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register an execution queue for remote mode
    pub fn with_queue(mut self, queue: Arc<dyn ExecutionQueue>) -> Self {
        self.queues.insert(queue.name().to_string(), queue);
        self
    }

    /// Token that stops the orchestrator from starting further steps
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn lifecycle(&self) -> &Arc<StepLifecycle> {
        &self.lifecycle
    }

    /// Run every step of the pipeline, parents strictly before children
    pub async fn run(&self, pipeline: &Pipeline, mode: ExecutionMode) -> PipelineResult<PipelineReport> {
        let order = pipeline.dag().topological_order();
        let max_parallel = self.settings.orchestrator.max_parallel_steps.max(1);

        tracing::info!(
            pipeline = %pipeline.name,
            version = %pipeline.version,
            steps = order.len(),
            ?mode,
            "Starting pipeline"
        );

        let mut finished: HashMap<String, StepOutcome> = HashMap::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();

        loop {
            block_failed_descendants(&order, &running, &mut finished);

            if !self.cancel.is_cancelled() {
                for spec in &order {
                    if running.len() >= max_parallel {
                        break;
                    }
                    if finished.contains_key(&spec.name) || running.contains(&spec.name) {
                        continue;
                    }
                    let ready = spec.parents.iter().all(|p| {
                        finished
                            .get(p.as_str())
                            .is_some_and(|o| o.state.is_success())
                    });
                    if !ready {
                        continue;
                    }

                    let step = pipeline.step(&spec.name).ok_or_else(|| {
                        PipelineError::Config(format!("Step {} has no implementation", spec.name))
                    })?;
                    let upstream: Vec<DatasetId> = spec
                        .parents
                        .iter()
                        .filter_map(|p| finished.get(p.as_str()))
                        .flat_map(|o| o.outputs.iter().cloned())
                        .collect();

                    let key = match self.cache_key(spec, step.as_ref(), &upstream).await {
                        Ok(key) => key,
                        Err(e) => {
                            tracing::error!("Failed to compute cache key for {}: {}", spec.name, e);
                            let mut outcome = StepOutcome::with_state(&spec.name, StepState::Failed);
                            outcome.error = Some(e);
                            finished.insert(spec.name.clone(), outcome);
                            continue;
                        }
                    };

                    if spec.cache_enabled {
                        let cached = self.cache.lookup(&key).await.unwrap_or_else(|e| {
                            tracing::warn!(step = %spec.name, "Cache lookup failed: {}", e);
                            None
                        });
                        if let Some(entry) = cached {
                            tracing::info!(
                                step = %spec.name,
                                key = %key,
                                "Reusing cached outputs of run {}",
                                entry.run_id
                            );
                            let mut outcome = StepOutcome::with_state(&spec.name, StepState::Cached);
                            outcome.outputs = entry.outputs;
                            outcome.cache_key = Some(key.key);
                            finished.insert(spec.name.clone(), outcome);
                            continue;
                        }
                    }

                    running.insert(spec.name.clone());
                    let this = self.clone();
                    let spec = spec.clone();
                    join_set.spawn(async move { this.run_step(spec, step, upstream, key, mode).await });
                }
            }

            if running.is_empty() {
                // Failures recorded while starting steps still block their children
                block_failed_descendants(&order, &running, &mut finished);
                break;
            }

            match join_set.join_next().await {
                Some(Ok(outcome)) => {
                    running.remove(&outcome.step_name);
                    finished.insert(outcome.step_name.clone(), outcome);
                }
                Some(Err(e)) => {
                    return Err(PipelineError::Infrastructure(anyhow::anyhow!(
                        "Step task failed: {}",
                        e
                    )))
                }
                None => break,
            }
        }

        let outcomes: Vec<StepOutcome> = order
            .iter()
            .map(|spec| {
                finished
                    .remove(&spec.name)
                    .unwrap_or_else(|| StepOutcome::with_state(&spec.name, StepState::NotStarted))
            })
            .collect();

        let report = PipelineReport {
            pipeline: pipeline.name.clone(),
            outcomes,
        };
        tracing::info!(
            pipeline = %report.pipeline,
            success = report.is_success(),
            "Pipeline finished"
        );
        Ok(report)
    }

    async fn cache_key(
        &self,
        spec: &StepSpec,
        step: &dyn PipelineStep,
        upstream: &[DatasetId],
    ) -> PipelineResult<CacheKey> {
        let params = self.lifecycle.params_for(&spec.name).await;
        let inputs = if spec.parents.is_empty() {
            vec![self.lifecycle.input_fingerprint(step).await?]
        } else {
            upstream.iter().map(|id| id.to_string()).collect()
        };
        Ok(CacheKey::compute(&spec.name, &params, &inputs))
    }

    /// Attempt a step until it succeeds, fails for good, or runs out of retries
    async fn run_step(
        self,
        spec: StepSpec,
        step: Arc<dyn PipelineStep>,
        upstream: Vec<DatasetId>,
        key: CacheKey,
        mode: ExecutionMode,
    ) -> StepOutcome {
        let max_attempts = spec.retry_limit.saturating_add(1);
        let mut outcome = StepOutcome::with_state(&spec.name, StepState::Failed);
        outcome.cache_key = Some(key.key.clone());

        loop {
            outcome.attempts += 1;
            let attempt = self.dispatch(&spec, step.clone(), upstream.clone(), mode).await;
            if let Some(run_id) = attempt.run_id {
                outcome.run_ids.push(run_id);
            }

            let error = match attempt.result {
                Ok(report) => {
                    self.record_cache(&spec, step.as_ref(), &upstream, &key, &report)
                        .await;
                    tracing::info!(
                        step = %spec.name,
                        output = %report.output,
                        attempts = outcome.attempts,
                        "Step succeeded"
                    );
                    outcome.state = StepState::Succeeded;
                    outcome.outputs = vec![report.output];
                    return outcome;
                }
                Err(e) => e,
            };

            let can_retry = error.is_retryable()
                && outcome.attempts < max_attempts
                && !self.cancel.is_cancelled();
            if !can_retry {
                let error = if error.is_retryable() && spec.retry_limit > 0 {
                    PipelineError::RetryExhausted {
                        step: spec.name.clone(),
                        attempts: outcome.attempts,
                        last_error: error.to_string(),
                    }
                } else {
                    error
                };
                tracing::error!(step = %spec.name, "Step failed: {}", error);
                outcome.error = Some(error);
                return outcome;
            }

            let backoff = Duration::from_millis(
                self.settings
                    .orchestrator
                    .retry_backoff_ms
                    .saturating_mul(2_u64.saturating_pow(outcome.attempts - 1)),
            );
            tracing::warn!(
                step = %spec.name,
                "Attempt {}/{} failed: {}; retrying after {:?}",
                outcome.attempts,
                max_attempts,
                error,
                backoff
            );
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
        }
    }

    /// Cache the outputs under the key the step started with and, when the
    /// step recorded derived parameters, under the key it finished with
    async fn record_cache(
        &self,
        spec: &StepSpec,
        step: &dyn PipelineStep,
        upstream: &[DatasetId],
        started_with: &CacheKey,
        report: &StepReport,
    ) {
        let mut keys = vec![started_with.clone()];
        match self.cache_key(spec, step, upstream).await {
            Ok(finished_with) if finished_with.key != started_with.key => keys.push(finished_with),
            Ok(_) => {}
            Err(e) => tracing::warn!(step = %spec.name, "Failed to compute final cache key: {}", e),
        }

        for key in keys {
            if let Err(e) = self
                .cache
                .record(&key, &spec.name, vec![report.output.clone()], report.run_id)
                .await
            {
                tracing::warn!(step = %spec.name, key = %key, "Failed to record cache entry: {}", e);
            }
        }
    }

    async fn dispatch(
        &self,
        spec: &StepSpec,
        step: Arc<dyn PipelineStep>,
        upstream: Vec<DatasetId>,
        mode: ExecutionMode,
    ) -> StepAttempt {
        let queue_name = match (mode, &spec.queue) {
            (ExecutionMode::Local, _) | (_, ExecutionTarget::Local) => None,
            (ExecutionMode::Remote, ExecutionTarget::Queue(name)) => Some(name.clone()),
            (ExecutionMode::Remote, ExecutionTarget::DefaultQueue) => {
                Some(self.settings.orchestrator.default_queue.clone())
            }
        };

        match queue_name {
            None => self.dispatch_local(step, upstream).await,
            Some(name) => self.dispatch_remote(&name, step, upstream).await,
        }
    }

    async fn dispatch_local(&self, step: Arc<dyn PipelineStep>, upstream: Vec<DatasetId>) -> StepAttempt {
        self.lifecycle.clone().execute_isolated(step, upstream).await
    }

    async fn dispatch_remote(
        &self,
        queue_name: &str,
        step: Arc<dyn PipelineStep>,
        upstream: Vec<DatasetId>,
    ) -> StepAttempt {
        let failed = |error: PipelineError| StepAttempt {
            run_id: None,
            result: Err(error),
        };

        let Some(queue) = self.queues.get(queue_name) else {
            return failed(PipelineError::UnknownQueue(queue_name.to_string()));
        };

        let ticket = match queue.submit(WorkUnit { step, upstream }).await {
            Ok(ticket) => ticket,
            Err(e) => return failed(e),
        };

        let interval = Duration::from_millis(self.settings.orchestrator.poll_interval_ms.max(1));
        loop {
            match queue.poll(ticket).await {
                Ok(QueueState::Finished(attempt)) => return attempt,
                Ok(QueueState::Pending) | Ok(QueueState::Running) => {
                    tokio::time::sleep(interval).await
                }
                Err(e) => return failed(e),
            }
        }
    }
}

/// Mark every unfinished step with a failed or blocked parent as blocked.
/// Parents precede children in `order`, so one pass reaches all descendants.
fn block_failed_descendants(
    order: &[StepSpec],
    running: &HashSet<String>,
    finished: &mut HashMap<String, StepOutcome>,
) {
    for spec in order {
        if finished.contains_key(&spec.name) || running.contains(&spec.name) {
            continue;
        }
        let failed_parent = spec.parents.iter().find(|p| {
            finished
                .get(p.as_str())
                .is_some_and(|o| matches!(o.state, StepState::Failed | StepState::Blocked))
        });
        if let Some(parent) = failed_parent {
            tracing::info!(
                "Skipping step {} because {} did not succeed",
                spec.name,
                parent
            );
            finished.insert(
                spec.name.clone(),
                StepOutcome::with_state(&spec.name, StepState::Blocked),
            );
        }
    }
}
