//! Run registry: identity, parameters, logs and artifacts of step runs.

use crate::error::{PipelineError, PipelineResult};
use crate::events::{Event, EventLog, EventType};
use crate::storage::{BlobStore, RedbIndexStore};
use crate::types::{BlobHash, Dataset, DatasetId, LogLevel, Run, RunId, RunStatus, StepKind};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to a live run. Clones observe the same state.
#[derive(Clone)]
pub struct RunHandle {
    id: RunId,
    step_name: String,
    state: Arc<RwLock<Run>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub async fn snapshot(&self) -> Run {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> RunStatus {
        self.state.read().await.status
    }

    /// Effective values of a bound parameter group
    pub async fn parameters(&self, group: &str) -> Option<Map<String, Value>> {
        self.state.read().await.parameters.get(group).cloned()
    }
}

pub struct RunRegistry {
    event_log: Arc<dyn EventLog>,
    blob_store: Arc<dyn BlobStore>,
    index: Arc<RedbIndexStore>,
    // Runs that have not reached a terminal status
    active: RwLock<HashMap<RunId, RunHandle>>,
}

impl RunRegistry {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        blob_store: Arc<dyn BlobStore>,
        index: Arc<RedbIndexStore>,
    ) -> Self {
        Self {
            event_log,
            blob_store,
            index,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Create a run in `created` status
    pub async fn register_run(
        &self,
        step_name: &str,
        kind: StepKind,
        tags: &[String],
    ) -> PipelineResult<RunHandle> {
        let run = Run {
            id: RunId::new(),
            step_name: step_name.to_string(),
            kind,
            tags: tags.iter().cloned().collect(),
            parameters: BTreeMap::new(),
            status: RunStatus::Created,
            artifacts: BTreeMap::new(),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let init_error = |e: anyhow::Error| PipelineError::RunInit {
            step: step_name.to_string(),
            reason: format!("{:#}", e),
        };

        self.event_log
            .append(Event::new(
                run.id,
                EventType::RunRegistered {
                    step_name: step_name.to_string(),
                    kind,
                    tags: tags.to_vec(),
                },
            ))
            .await
            .map_err(init_error)?;
        self.index.index_run(&run).map_err(init_error)?;

        tracing::debug!(run_id = %run.id, step = step_name, "Registered run");

        let handle = RunHandle {
            id: run.id,
            step_name: step_name.to_string(),
            state: Arc::new(RwLock::new(run)),
        };
        self.active.write().await.insert(handle.id, handle.clone());

        Ok(handle)
    }

    /// Merge `values` into a parameter group. Keys already bound keep their
    /// value; the effective group is returned.
    pub async fn bind_parameters(
        &self,
        run: &RunHandle,
        group: &str,
        values: Map<String, Value>,
    ) -> PipelineResult<Map<String, Value>> {
        let effective = {
            let mut state = run.state.write().await;
            let bound = state.parameters.entry(group.to_string()).or_default();
            for (key, value) in values {
                bound.entry(key).or_insert(value);
            }
            bound.clone()
        };

        self.event_log
            .append(Event::new(
                run.id,
                EventType::ParametersBound {
                    group: group.to_string(),
                    values: effective.clone(),
                },
            ))
            .await?;

        Ok(effective)
    }

    /// Record a value a step derived at runtime so the run can be reproduced
    pub async fn record_derived(
        &self,
        run: &RunHandle,
        group: &str,
        key: &str,
        value: Value,
    ) -> PipelineResult<Value> {
        let stored = {
            let mut state = run.state.write().await;
            state
                .parameters
                .entry(group.to_string())
                .or_default()
                .entry(key.to_string())
                .or_insert(value)
                .clone()
        };

        self.event_log
            .append(Event::new(
                run.id,
                EventType::DerivedParameterRecorded {
                    group: group.to_string(),
                    key: key.to_string(),
                    value: stored.clone(),
                },
            ))
            .await?;

        Ok(stored)
    }

    /// Append a line to the run's log stream. Lines with `persist_console`
    /// unset are kept in the stream but not echoed.
    pub async fn log(
        &self,
        run: &RunHandle,
        level: LogLevel,
        message: impl Into<String>,
        persist_console: bool,
    ) -> PipelineResult<()> {
        let message = message.into();

        if persist_console {
            match level {
                LogLevel::Debug => tracing::debug!(step = %run.step_name, "{}", message),
                LogLevel::Info => tracing::info!(step = %run.step_name, "{}", message),
                LogLevel::Warning => tracing::warn!(step = %run.step_name, "{}", message),
                LogLevel::Error => tracing::error!(step = %run.step_name, "{}", message),
            }
        }

        self.event_log
            .append(Event::new(
                run.id,
                EventType::LogLine {
                    level,
                    message,
                    console: persist_console,
                },
            ))
            .await?;

        Ok(())
    }

    /// Attach a named blob to the run, replacing an earlier one with the same name
    pub async fn record_artifact(
        &self,
        run: &RunHandle,
        name: &str,
        payload: Bytes,
    ) -> PipelineResult<BlobHash> {
        let size_bytes = payload.len() as u64;
        let content_hash = self.blob_store.put(payload).await?;

        run.state
            .write()
            .await
            .artifacts
            .insert(name.to_string(), content_hash.clone());

        self.event_log
            .append(Event::new(
                run.id,
                EventType::ArtifactRecorded {
                    name: name.to_string(),
                    content_hash: content_hash.clone(),
                    size_bytes,
                },
            ))
            .await?;

        Ok(content_hash)
    }

    pub async fn record_json_artifact(
        &self,
        run: &RunHandle,
        name: &str,
        value: &Value,
    ) -> PipelineResult<BlobHash> {
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|e| PipelineError::Infrastructure(e.into()))?;
        self.record_artifact(run, name, Bytes::from(payload)).await
    }

    /// Record the dataset versions the run consumed
    pub async fn record_input(&self, run: &RunHandle, datasets: &[DatasetId]) -> PipelineResult<()> {
        self.event_log
            .append(Event::new(
                run.id,
                EventType::InputResolved {
                    datasets: datasets.to_vec(),
                },
            ))
            .await?;
        Ok(())
    }

    /// Record the dataset version the run published
    pub async fn record_output(&self, run: &RunHandle, dataset: &Dataset) -> PipelineResult<()> {
        self.event_log
            .append(Event::new(
                run.id,
                EventType::OutputPublished {
                    dataset_id: dataset.id.clone(),
                    parents: dataset.parents.clone(),
                    file_count: dataset.files.len(),
                },
            ))
            .await?;
        Ok(())
    }

    /// Move the run to `status`; the run is indexed on every transition.
    /// The live state only changes once the transition is persisted, and a
    /// terminal transition writes the run's buffered events out.
    pub async fn mark_status(&self, run: &RunHandle, status: RunStatus) -> PipelineResult<()> {
        {
            let mut state = run.state.write().await;
            let from = state.status;
            if !from.can_transition_to(status) {
                return Err(PipelineError::InvalidRunState {
                    run_id: run.id,
                    from,
                    to: status,
                });
            }

            let mut next = state.clone();
            next.status = status;
            let now = chrono::Utc::now();
            match status {
                RunStatus::Running => next.started_at = Some(now),
                RunStatus::Succeeded | RunStatus::Failed => next.completed_at = Some(now),
                RunStatus::Created => {}
            }

            self.event_log
                .append(Event::new(
                    run.id,
                    EventType::StatusChanged { from, to: status },
                ))
                .await?;
            self.index.index_run(&next)?;
            *state = next;
        }

        if status.is_terminal() {
            self.active.write().await.remove(&run.id);
            self.flush(run).await?;
        }

        Ok(())
    }

    /// Write the run's buffered events to the event log
    pub async fn flush(&self, run: &RunHandle) -> PipelineResult<()> {
        Ok(self.event_log.flush_run(run.id).await?)
    }

    /// Current state of a run, live or indexed
    pub async fn get_run(&self, run_id: &RunId) -> PipelineResult<Option<Run>> {
        if let Some(handle) = self.active.read().await.get(run_id) {
            return Ok(Some(handle.snapshot().await));
        }
        Ok(self.index.get_run(run_id)?)
    }

    /// Every run recorded for a step, oldest first
    pub async fn runs_for_step(&self, step_name: &str) -> PipelineResult<Vec<Run>> {
        Ok(self.index.list_runs_for_step(step_name)?)
    }

    /// Payload of a named artifact
    pub async fn artifact(&self, run_id: &RunId, name: &str) -> PipelineResult<Option<Bytes>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        match run.artifacts.get(name) {
            Some(hash) => Ok(self.blob_store.get(hash).await?),
            None => Ok(None),
        }
    }

    pub async fn run_events(&self, run_id: RunId) -> PipelineResult<Vec<Event>> {
        Ok(self.event_log.get_run_events(run_id).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::{FilesystemBlobStore, JsonlEventLog};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    pub(crate) fn registry_in(dir: &TempDir) -> RunRegistry {
        let event_log = Arc::new(JsonlEventLog::new(dir.path().join("events")).unwrap());
        let blob_store = Arc::new(FilesystemBlobStore::new(dir.path().join("blobs")).unwrap());
        let index = Arc::new(RedbIndexStore::new(dir.path().join("index.redb")).unwrap());
        RunRegistry::new(event_log, blob_store, index)
    }

    fn values(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry_in(&temp_dir);

        let run = registry
            .register_run("preprocess", StepKind::DataProcessing, &["demo".to_string()])
            .await
            .unwrap();
        assert_eq!(run.status().await, RunStatus::Created);

        registry.mark_status(&run, RunStatus::Running).await.unwrap();
        registry.mark_status(&run, RunStatus::Succeeded).await.unwrap();

        let err = registry
            .mark_status(&run, RunStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRunState { .. }));

        let indexed = registry.get_run(&run.id()).await.unwrap().unwrap();
        assert_eq!(indexed.status, RunStatus::Succeeded);
        assert!(indexed.completed_at.is_some());
        assert_eq!(registry.runs_for_step("preprocess").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_first_bind_wins() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry_in(&temp_dir);
        let run = registry
            .register_run("train", StepKind::Training, &[])
            .await
            .unwrap();
        let other_holder = run.clone();

        registry
            .bind_parameters(&run, "train", values(json!({"depth": 6})))
            .await
            .unwrap();
        let effective = registry
            .bind_parameters(&run, "train", values(json!({"depth": 8, "lr": 0.1})))
            .await
            .unwrap();

        assert_eq!(effective.get("depth"), Some(&json!(6)));
        assert_eq!(effective.get("lr"), Some(&json!(0.1)));
        assert_eq!(other_holder.parameters("train").await, Some(effective));

        let derived = registry
            .record_derived(&run, "train", "depth", json!(10))
            .await
            .unwrap();
        assert_eq!(derived, json!(6));
    }

    #[tokio::test]
    async fn test_artifacts_and_log_stream() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry_in(&temp_dir);
        let run = registry
            .register_run("split_dataset", StepKind::DataProcessing, &[])
            .await
            .unwrap();

        registry
            .record_json_artifact(&run, "groups_mapping", &json!({"WELL1": 0}))
            .await
            .unwrap();
        registry
            .record_json_artifact(&run, "groups_mapping", &json!({"WELL1": 1}))
            .await
            .unwrap();
        let payload = registry
            .artifact(&run.id(), "groups_mapping")
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"WELL1": 1}));

        registry
            .log(&run, LogLevel::Info, "visible", true)
            .await
            .unwrap();
        registry
            .log(&run, LogLevel::Debug, "traceback: ...", false)
            .await
            .unwrap();

        let lines: Vec<(String, bool)> = registry
            .run_events(run.id())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|event| match event.event_type {
                EventType::LogLine {
                    message, console, ..
                } => Some((message, console)),
                _ => None,
            })
            .collect();
        assert_eq!(
            lines,
            vec![
                ("visible".to_string(), true),
                ("traceback: ...".to_string(), false)
            ]
        );
    }

    /// Event log whose appends fail while `broken` is set
    #[derive(Default)]
    struct FlakyEventLog {
        broken: AtomicBool,
    }

    #[async_trait::async_trait]
    impl EventLog for FlakyEventLog {
        async fn append(&self, _event: Event) -> anyhow::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("event log unavailable");
            }
            Ok(())
        }

        async fn flush_run(&self, _run_id: RunId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_run_events(&self, _run_id: RunId) -> anyhow::Result<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn get_run_events_range(
            &self,
            _run_id: RunId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Event>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_unpersisted_transition_keeps_previous_status() {
        let temp_dir = TempDir::new().unwrap();
        let event_log = Arc::new(FlakyEventLog::default());
        let blob_store = Arc::new(FilesystemBlobStore::new(temp_dir.path().join("blobs")).unwrap());
        let index = Arc::new(RedbIndexStore::new(temp_dir.path().join("index.redb")).unwrap());
        let registry = RunRegistry::new(event_log.clone(), blob_store, index);

        let run = registry
            .register_run("train", StepKind::Training, &[])
            .await
            .unwrap();
        registry.mark_status(&run, RunStatus::Running).await.unwrap();

        event_log.broken.store(true, Ordering::SeqCst);
        assert!(registry.mark_status(&run, RunStatus::Succeeded).await.is_err());
        assert_eq!(run.status().await, RunStatus::Running);
        let indexed = registry.runs_for_step("train").await.unwrap();
        assert_eq!(indexed[0].status, RunStatus::Running);

        event_log.broken.store(false, Ordering::SeqCst);
        registry.mark_status(&run, RunStatus::Failed).await.unwrap();
        assert_eq!(
            registry.get_run(&run.id()).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_terminal_status_writes_run_log_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry_in(&temp_dir);
        let run = registry
            .register_run("preprocess", StepKind::DataProcessing, &[])
            .await
            .unwrap();

        registry.mark_status(&run, RunStatus::Running).await.unwrap();
        registry
            .log(&run, LogLevel::Error, "reading well 3 failed", true)
            .await
            .unwrap();
        registry.mark_status(&run, RunStatus::Failed).await.unwrap();

        // A separate reader sees the lines without anyone calling flush_all
        let reader = JsonlEventLog::new(temp_dir.path().join("events")).unwrap();
        let events = reader.get_run_events(run.id()).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.event_type,
            EventType::LogLine { message, .. } if message == "reading well 3 failed"
        )));
    }
}
