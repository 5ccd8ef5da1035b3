//! The fixed execution protocol every step goes through: init run, bind
//! parameters, resolve input, process, publish output, upload artifacts.

use crate::config::Settings;
use crate::dataset::DatasetStore;
use crate::error::{ItemFailure, PipelineError, PipelineResult};
use crate::hashing::hash_str;
use crate::params::ParameterDocument;
use crate::registry::{RunHandle, RunRegistry};
use crate::types::{BlobHash, DatasetId, LogLevel, RunId, RunStatus};
use crate::workflow::step::{
    input_dataset_name, is_empty_dir, output_dataset_name, PipelineStep, ProcessOutcome,
    StepContext,
};
use anyhow::Context;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Summary of a successful step run
#[derive(Debug, Clone)]
pub struct StepReport {
    pub run_id: RunId,
    pub step_name: String,
    pub inputs: Vec<DatasetId>,
    pub output: DatasetId,
    pub processed: usize,
    pub failures: Vec<ItemFailure>,
}

/// One attempt at a step: the run it created, if any, and how it ended
#[derive(Debug)]
pub struct StepAttempt {
    pub run_id: Option<RunId>,
    pub result: PipelineResult<StepReport>,
}

struct ResolvedInput {
    datasets: Vec<DatasetId>,
    // Files were materialized from the store and are scratch copies
    materialized: bool,
}

pub struct StepLifecycle {
    settings: Arc<Settings>,
    registry: Arc<RunRegistry>,
    datasets: Arc<DatasetStore>,
    params: Arc<RwLock<ParameterDocument>>,
}

impl StepLifecycle {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<RunRegistry>,
        datasets: Arc<DatasetStore>,
        params: Arc<RwLock<ParameterDocument>>,
    ) -> Self {
        Self {
            settings,
            registry,
            datasets,
            params,
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn datasets(&self) -> &Arc<DatasetStore> {
        &self.datasets
    }

    pub fn params(&self) -> &Arc<RwLock<ParameterDocument>> {
        &self.params
    }

    /// Run the whole protocol once
    pub async fn execute(
        &self,
        step: &dyn PipelineStep,
        upstream: &[DatasetId],
    ) -> PipelineResult<StepReport> {
        self.execute_attempt(step, upstream).await.result
    }

    /// Run the whole protocol once, reporting the run it created even on failure
    pub async fn execute_attempt(&self, step: &dyn PipelineStep, upstream: &[DatasetId]) -> StepAttempt {
        let run = match self.begin(step).await {
            Ok(run) => run,
            Err(e) => {
                return StepAttempt {
                    run_id: None,
                    result: Err(e),
                }
            }
        };

        let result = self.run_registered(step, &run, upstream).await;
        StepAttempt {
            run_id: Some(run.id()),
            result,
        }
    }

    /// Run the protocol on its own task. The run is registered first, so a
    /// panicking step still leaves a failed run behind.
    pub async fn execute_isolated(
        self: Arc<Self>,
        step: Arc<dyn PipelineStep>,
        upstream: Vec<DatasetId>,
    ) -> StepAttempt {
        let run = match self.begin(step.as_ref()).await {
            Ok(run) => run,
            Err(e) => {
                return StepAttempt {
                    run_id: None,
                    result: Err(e),
                }
            }
        };

        let lifecycle = self.clone();
        let worker_run = run.clone();
        let work = tokio::spawn(async move {
            lifecycle
                .run_registered(step.as_ref(), &worker_run, &upstream)
                .await
        });

        let result = match work.await {
            Ok(result) => result,
            Err(e) => {
                let error = PipelineError::Infrastructure(anyhow::anyhow!(
                    "Step {} panicked: {}",
                    run.step_name(),
                    e
                ));
                self.fail_run(&run, &error).await;
                Err(error)
            }
        };

        StepAttempt {
            run_id: Some(run.id()),
            result,
        }
    }

    async fn begin(&self, step: &dyn PipelineStep) -> PipelineResult<RunHandle> {
        let registered = self
            .registry
            .register_run(step.name(), step.kind(), &self.settings.tags)
            .await;
        if let Err(e) = &registered {
            tracing::error!(step = step.name(), "{}", e);
        }
        registered
    }

    async fn run_registered(
        &self,
        step: &dyn PipelineStep,
        run: &RunHandle,
        upstream: &[DatasetId],
    ) -> PipelineResult<StepReport> {
        let result = self.drive(step, run, upstream).await;
        match &result {
            Ok(_) => self.flush(run).await,
            Err(e) => self.fail_run(run, e).await,
        }
        result
    }

    /// Log the error with its full chain, mark the run failed and persist its log
    async fn fail_run(&self, run: &RunHandle, error: &PipelineError) {
        self.log(run, LogLevel::Error, format!("{}", error), true).await;
        self.log(run, LogLevel::Debug, format!("{:?}", error), false).await;
        if let Err(mark_error) = self.registry.mark_status(run, RunStatus::Failed).await {
            tracing::warn!(run_id = %run.id(), "Failed to mark run failed: {}", mark_error);
        }
        self.flush(run).await;
    }

    async fn flush(&self, run: &RunHandle) {
        if let Err(e) = self.registry.flush(run).await {
            tracing::warn!(run_id = %run.id(), "Failed to write run log: {}", e);
        }
    }

    async fn drive(
        &self,
        step: &dyn PipelineStep,
        run: &RunHandle,
        upstream: &[DatasetId],
    ) -> PipelineResult<StepReport> {
        let step_name = step.name().to_string();

        self.registry.mark_status(run, RunStatus::Running).await?;
        tracing::info!(step = %step_name, run_id = %run.id(), "Step started");

        let groups = self.params.read().await.groups_for_step(&step_name);
        for (group, values) in groups {
            self.registry.bind_parameters(run, &group, values).await?;
        }

        let input_dir = step.input_directory();
        let input = self.resolve_input(step, run, upstream, &input_dir).await?;

        let ctx = StepContext {
            step_name: step_name.clone(),
            settings: self.settings.clone(),
            run: run.clone(),
            registry: self.registry.clone(),
            params: self.params.clone(),
            input_datasets: input.datasets.clone(),
            input_dir: input_dir.clone(),
            output_dir: step.output_directory(),
        };

        let published = self.process_and_publish(step, &ctx).await;

        if input.materialized {
            self.discard_materialized(step, &input_dir).await;
        }

        let (outcome, output) = published?;

        if let Err(e) = step.upload_artifacts(&ctx, &outcome).await {
            self.log(
                run,
                LogLevel::Warning,
                format!("Failed to upload artifacts of {}: {}", step_name, e),
                true,
            )
            .await;
            self.log(run, LogLevel::Debug, format!("{:?}", e), false).await;
        }

        self.registry.mark_status(run, RunStatus::Succeeded).await?;
        self.log(run, LogLevel::Info, format!("{} is finished", step_name), true)
            .await;

        Ok(StepReport {
            run_id: run.id(),
            step_name,
            inputs: input.datasets,
            output,
            processed: outcome.processed().count(),
            failures: outcome.failures().cloned().collect(),
        })
    }

    async fn resolve_input(
        &self,
        step: &dyn PipelineStep,
        run: &RunHandle,
        upstream: &[DatasetId],
        input_dir: &Path,
    ) -> PipelineResult<ResolvedInput> {
        let download_error = |reason: String| PipelineError::DatasetDownload {
            step: step.name().to_string(),
            reason,
        };

        let has_local = !is_empty_dir(input_dir).map_err(|e| download_error(format!("{:#}", e)))?;

        let resolved = if has_local {
            // Local files are the ground truth; publish them as a new input version
            let handle = self
                .datasets
                .create_dataset(&self.settings.project, &input_dataset_name(step.name()), upstream)
                .await?;
            self.datasets.add_files(&handle, input_dir).await?;
            let dataset = self.datasets.finalize(&handle).await?;
            ResolvedInput {
                datasets: vec![dataset.id],
                materialized: false,
            }
        } else if !upstream.is_empty() {
            self.check_upstream_paths(upstream)
                .await
                .map_err(download_error)?;
            for id in upstream {
                if let Err(e) = self.datasets.materialize(id, input_dir).await {
                    self.discard_materialized(step, input_dir).await;
                    return Err(download_error(e.to_string()));
                }
            }
            ResolvedInput {
                datasets: upstream.to_vec(),
                materialized: true,
            }
        } else {
            let dataset = self
                .datasets
                .get_dataset(&self.settings.project, &input_dataset_name(step.name()))
                .await
                .map_err(|e| download_error(e.to_string()))?;
            if let Err(e) = self.datasets.materialize(&dataset.id, input_dir).await {
                self.discard_materialized(step, input_dir).await;
                return Err(download_error(e.to_string()));
            }
            ResolvedInput {
                datasets: vec![dataset.id],
                materialized: true,
            }
        };

        self.registry.record_input(run, &resolved.datasets).await?;
        self.log(
            run,
            LogLevel::Info,
            format!(
                "Resolved input of {}: {}",
                step.name(),
                join_ids(&resolved.datasets)
            ),
            true,
        )
        .await;

        Ok(resolved)
    }

    /// Materialized files are scratch copies and never outlive the attempt
    async fn discard_materialized(&self, step: &dyn PipelineStep, input_dir: &Path) {
        if let Err(e) = clear_directory(input_dir).await {
            tracing::warn!(step = step.name(), "Failed to clear materialized input: {:#}", e);
        }
    }

    /// Upstream outputs share one input directory, so no two of them may
    /// hold different content at the same relative path
    async fn check_upstream_paths(&self, upstream: &[DatasetId]) -> Result<(), String> {
        let mut owners: HashMap<String, (DatasetId, BlobHash)> = HashMap::new();
        for id in upstream {
            let Some(dataset) = self.datasets.get_by_id(id).await else {
                continue;
            };
            for (path, hash) in dataset.files {
                match owners.get(&path) {
                    Some((owner, existing)) if *existing != hash => {
                        return Err(format!(
                            "{} and {} both provide {} with different content",
                            owner, id, path
                        ));
                    }
                    Some(_) => {}
                    None => {
                        owners.insert(path, (id.clone(), hash));
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_and_publish(
        &self,
        step: &dyn PipelineStep,
        ctx: &StepContext,
    ) -> PipelineResult<(ProcessOutcome, DatasetId)> {
        let processing_error = |reason: String, failures: Vec<ItemFailure>| {
            PipelineError::StepProcessing {
                step: ctx.step_name.clone(),
                reason,
                failures,
            }
        };

        clear_directory(&ctx.output_dir)
            .await
            .map_err(|e| processing_error(format!("{:#}", e), Vec::new()))?;

        let outcome = step
            .process(ctx)
            .await
            .map_err(|e| processing_error(format!("{:#}", e), Vec::new()))?;

        for failure in outcome.failures() {
            ctx.log(
                LogLevel::Warning,
                format!("Failed to process {}: {}", failure.item, failure.reason),
                true,
            )
            .await;
        }

        let total = outcome.items.len();
        let processed = outcome.processed().count();
        if total > 0 && processed == 0 {
            return Err(processing_error(
                format!("all {} items failed", total),
                outcome.failures().cloned().collect(),
            ));
        }
        ctx.log(
            LogLevel::Info,
            format!("Processed {}/{} items", processed, total),
            true,
        )
        .await;

        let handle = self
            .datasets
            .create_dataset(
                &self.settings.project,
                &output_dataset_name(&ctx.step_name),
                &ctx.input_datasets,
            )
            .await?;
        self.datasets.add_files(&handle, &ctx.output_dir).await?;
        let dataset = self.datasets.finalize(&handle).await?;
        self.registry.record_output(&ctx.run, &dataset).await?;

        Ok((outcome, dataset.id))
    }

    /// Fingerprint of what a root step would consume: the local input files
    /// if present, otherwise the latest stored input dataset.
    pub async fn input_fingerprint(&self, step: &dyn PipelineStep) -> PipelineResult<String> {
        let input_dir = step.input_directory();
        if !is_empty_dir(&input_dir)? {
            let fingerprint = tokio::task::spawn_blocking(move || fingerprint_directory(&input_dir))
                .await
                .context("Fingerprint task failed")??;
            return Ok(format!("local:{}", fingerprint));
        }

        match self
            .datasets
            .get_dataset(&self.settings.project, &input_dataset_name(step.name()))
            .await
        {
            Ok(dataset) => Ok(format!("dataset:{}", dataset.id)),
            Err(PipelineError::DatasetNotFound { .. }) => Ok("none".to_string()),
            Err(e) => Err(e),
        }
    }

    /// Bound parameter groups of a step, as hashed into its cache key
    pub async fn params_for(&self, step_name: &str) -> Value {
        self.params.read().await.bound_value(step_name)
    }

    async fn log(&self, run: &RunHandle, level: LogLevel, message: String, console: bool) {
        if let Err(e) = self.registry.log(run, level, message, console).await {
            tracing::warn!(run_id = %run.id(), "Failed to append to run log: {}", e);
        }
    }
}

fn join_ids(ids: &[DatasetId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Remove everything under `dir`, leaving it empty
async fn clear_directory(dir: &Path) -> anyhow::Result<()> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))
}

fn fingerprint_directory(dir: &Path) -> anyhow::Result<String> {
    let mut lines = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.context("Failed to walk input directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .context("File outside of input directory")?;
        let data = std::fs::read(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        lines.push(format!(
            "{}={}",
            relative.to_string_lossy(),
            BlobHash::from_bytes(&data)
        ));
    }
    Ok(hash_str(&lines.join("\n")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::{EventLog, EventType};
    use crate::storage::{FilesystemBlobStore, JsonlEventLog, RedbIndexStore};
    use crate::workflow::step::{item_id, list_files, ProcessedItem};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Copies input files to the output directory. Fails as a whole for the
    /// first `fail_attempts` calls and fails individually for `bad_items`.
    pub(crate) struct ScriptedStep {
        pub name: String,
        pub input_dir: PathBuf,
        pub output_dir: PathBuf,
        pub fail_attempts: AtomicU32,
        pub bad_items: Vec<String>,
        pub panics: bool,
        pub calls: AtomicU32,
    }

    impl ScriptedStep {
        pub(crate) fn new(root: &Path, name: &str) -> Self {
            Self {
                name: name.to_string(),
                input_dir: root.join(name).join("input"),
                output_dir: root.join(name).join("output"),
                fail_attempts: AtomicU32::new(0),
                bad_items: Vec::new(),
                panics: false,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn panicking(mut self) -> Self {
            self.panics = true;
            self
        }

        pub(crate) fn failing(self, attempts: u32) -> Self {
            self.fail_attempts.store(attempts, Ordering::SeqCst);
            self
        }

        pub(crate) fn with_bad_items(mut self, items: &[&str]) -> Self {
            self.bad_items = items.iter().map(|s| s.to_string()).collect();
            self
        }

        pub(crate) fn seed_input(&self, files: &[(&str, &str)]) {
            std::fs::create_dir_all(&self.input_dir).unwrap();
            for (name, content) in files {
                std::fs::write(self.input_dir.join(name), content).unwrap();
            }
        }
    }

    #[async_trait::async_trait]
    impl PipelineStep for ScriptedStep {
        fn name(&self) -> &str {
            &self.name
        }

        fn input_directory(&self) -> PathBuf {
            self.input_dir.clone()
        }

        fn output_directory(&self) -> PathBuf {
            self.output_dir.clone()
        }

        async fn process(&self, ctx: &StepContext) -> anyhow::Result<ProcessOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("scripted panic in {}", self.name);
            }
            let remaining = self.fail_attempts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_attempts.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("scripted failure");
            }

            let mut items = Vec::new();
            for input in list_files(&ctx.input_dir, None)? {
                let item = item_id(&input);
                if self.bad_items.contains(&item) {
                    items.push(Err(ItemFailure {
                        item,
                        reason: "bad item".to_string(),
                    }));
                    continue;
                }
                let target = ctx.output_dir.join(input.file_name().unwrap());
                std::fs::copy(&input, &target)?;
                items.push(Ok(ProcessedItem {
                    item,
                    outputs: vec![target],
                }));
            }
            Ok(ProcessOutcome::new(items))
        }
    }

    pub(crate) fn settings_in(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.project = "demo".to_string();
        settings.storage.data_dir = dir.join("data");
        settings
    }

    pub(crate) fn lifecycle_in(dir: &Path) -> StepLifecycle {
        lifecycle_with(settings_in(dir))
    }

    pub(crate) fn lifecycle_with(settings: Settings) -> StepLifecycle {
        let event_log = Arc::new(JsonlEventLog::new(settings.event_log_path()).unwrap());
        let blob_store = Arc::new(FilesystemBlobStore::new(settings.blob_path()).unwrap());
        let index = Arc::new(RedbIndexStore::new(settings.index_path()).unwrap());
        let registry = Arc::new(RunRegistry::new(event_log, blob_store.clone(), index.clone()));
        let datasets = Arc::new(DatasetStore::open(blob_store, index).unwrap());
        let params = ParameterDocument::from_toml_str(
            "[common]\nseed = 1\n\n[preprocess]\nthreshold = 0.5\n",
        )
        .unwrap();
        StepLifecycle::new(
            Arc::new(settings),
            registry,
            datasets,
            Arc::new(RwLock::new(params)),
        )
    }

    #[tokio::test]
    async fn test_root_step_publishes_input_and_output() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());
        let step = ScriptedStep::new(temp_dir.path(), "preprocess");
        step.seed_input(&[("a.csv", "1"), ("b.csv", "2")]);

        let report = lifecycle.execute(&step, &[]).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.inputs, vec![DatasetId::new("demo", "preprocess input dataset", 1)]);

        let output = lifecycle
            .datasets()
            .get_dataset("demo", "preprocess output dataset")
            .await
            .unwrap();
        assert_eq!(output.id, report.output);
        assert_eq!(output.parents, report.inputs);
        assert_eq!(output.files.len(), 2);

        let run = lifecycle.registry().get_run(&report.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.parameters.contains_key("common"));
        assert!(run.parameters.contains_key("preprocess"));

        // The attempt writes its log out; a separate reader sees the last line
        let reader = JsonlEventLog::new(lifecycle.settings().event_log_path()).unwrap();
        let persisted = reader.get_run_events(report.run_id).await.unwrap();
        assert!(persisted.iter().any(|e| matches!(
            &e.event_type,
            EventType::LogLine { message, .. } if message == "preprocess is finished"
        )));

        let events = lifecycle.registry().run_events(report.run_id).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.event_type,
            EventType::LogLine { message, .. } if message == "preprocess is finished"
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e.event_type, EventType::OutputPublished { file_count: 2, .. })));
    }

    #[tokio::test]
    async fn test_process_error_publishes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());
        let step = ScriptedStep::new(temp_dir.path(), "preprocess").failing(1);
        step.seed_input(&[("a.csv", "1")]);

        let attempt = lifecycle.execute_attempt(&step, &[]).await;
        assert!(matches!(
            attempt.result,
            Err(PipelineError::StepProcessing { .. })
        ));

        let err = lifecycle
            .datasets()
            .get_dataset("demo", "preprocess output dataset")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DatasetNotFound { .. }));

        let run_id = attempt.run_id.unwrap();
        let run = lifecycle.registry().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_all_items_failing_fails_the_step() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());
        let step = ScriptedStep::new(temp_dir.path(), "preprocess").with_bad_items(&["A", "B"]);
        step.seed_input(&[("a.csv", "1"), ("b.csv", "2")]);

        match lifecycle.execute(&step, &[]).await {
            Err(PipelineError::StepProcessing { failures, .. }) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upstream_outputs_are_materialized() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());

        let producer = ScriptedStep::new(temp_dir.path(), "preprocess");
        producer.seed_input(&[("a.csv", "1")]);
        let upstream = lifecycle.execute(&producer, &[]).await.unwrap();

        let consumer = ScriptedStep::new(temp_dir.path(), "feature_engineer");
        let report = lifecycle
            .execute(&consumer, &[upstream.output.clone()])
            .await
            .unwrap();

        assert_eq!(report.inputs, vec![upstream.output.clone()]);
        assert_eq!(report.processed, 1);
        let output = lifecycle.datasets().get_by_id(&report.output).await.unwrap();
        assert_eq!(output.parents, vec![upstream.output]);

        // Scratch copies do not linger as local ground truth
        assert!(is_empty_dir(&consumer.input_dir).unwrap());
    }

    #[tokio::test]
    async fn test_missing_input_dataset_is_a_download_error() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());
        let step = ScriptedStep::new(temp_dir.path(), "preprocess");

        assert_eq!(lifecycle.input_fingerprint(&step).await.unwrap(), "none");

        let attempt = lifecycle.execute_attempt(&step, &[]).await;
        assert!(matches!(
            attempt.result,
            Err(PipelineError::DatasetDownload { .. })
        ));
        let run = lifecycle
            .registry()
            .get_run(&attempt.run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(step.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_input_fingerprint_tracks_content() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());
        let step = ScriptedStep::new(temp_dir.path(), "preprocess");

        step.seed_input(&[("a.csv", "1")]);
        let first = lifecycle.input_fingerprint(&step).await.unwrap();
        assert_eq!(first, lifecycle.input_fingerprint(&step).await.unwrap());

        step.seed_input(&[("a.csv", "changed")]);
        assert_ne!(first, lifecycle.input_fingerprint(&step).await.unwrap());
    }

    #[tokio::test]
    async fn test_panicking_step_fails_its_run() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = Arc::new(lifecycle_in(temp_dir.path()));
        let step = Arc::new(ScriptedStep::new(temp_dir.path(), "preprocess").panicking());
        step.seed_input(&[("a.csv", "1")]);

        let attempt = lifecycle.clone().execute_isolated(step, Vec::new()).await;
        assert!(matches!(
            attempt.result,
            Err(PipelineError::Infrastructure(_))
        ));

        let run_id = attempt.run_id.unwrap();
        let run = lifecycle.registry().get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());

        let events = lifecycle.registry().run_events(run_id).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.event_type,
            EventType::LogLine { message, console: true, .. } if message.contains("panicked")
        )));
    }

    #[tokio::test]
    async fn test_two_parents_share_the_input_directory() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());

        let wells = ScriptedStep::new(temp_dir.path(), "wells");
        wells.seed_input(&[("x.csv", "1")]);
        let logs = ScriptedStep::new(temp_dir.path(), "logs");
        logs.seed_input(&[("y.csv", "2")]);
        let wells_out = lifecycle.execute(&wells, &[]).await.unwrap().output;
        let logs_out = lifecycle.execute(&logs, &[]).await.unwrap().output;

        let merge = ScriptedStep::new(temp_dir.path(), "merge");
        let report = lifecycle
            .execute(&merge, &[wells_out.clone(), logs_out])
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        let output = lifecycle.datasets().get_by_id(&report.output).await.unwrap();
        assert_eq!(
            output.files.keys().cloned().collect::<Vec<_>>(),
            vec!["x.csv".to_string(), "y.csv".to_string()]
        );

        // Same file name, different content: refuse rather than drop one
        let other = ScriptedStep::new(temp_dir.path(), "other_wells");
        other.seed_input(&[("x.csv", "different")]);
        let other_out = lifecycle.execute(&other, &[]).await.unwrap().output;

        let attempt = lifecycle
            .execute_attempt(&merge, &[wells_out, other_out])
            .await;
        match attempt.result {
            Err(PipelineError::DatasetDownload { reason, .. }) => assert!(reason.contains("x.csv")),
            unexpected => panic!("unexpected result: {:?}", unexpected),
        }
        assert!(is_empty_dir(&merge.input_dir).unwrap());
    }
}
