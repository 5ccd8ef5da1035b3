use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::storage::{open_blob_store, JsonlEventLog, RedbIndexStore};
use strata_core::workflow::{PipelineOrchestrator, StepCache, StepLifecycle, WorkerQueue};
use strata_core::{
    DatasetStore, ExecutionTarget, ParameterDocument, RunRegistry, Settings, StepKind, StepSpec,
};
use tokio::sync::RwLock;

/// Pipeline definition: the steps and how they depend on each other
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    #[serde(default = "default_pipeline_version")]
    pub version: String,

    #[serde(default)]
    pub steps: Vec<StepDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDeclaration {
    pub name: String,

    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    #[serde(default)]
    pub retry_limit: u32,

    /// `local` pins the step in process; absent means the default queue
    #[serde(default)]
    pub queue: Option<String>,

    /// Implementation from the step catalog
    pub kind: String,

    /// Kind recorded on the step's runs
    #[serde(default)]
    pub run_kind: Option<StepKind>,

    pub input_dir: PathBuf,

    pub output_dir: PathBuf,

    #[serde(default)]
    pub extension: Option<String>,

    #[serde(default)]
    pub transform: Option<String>,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_pipeline_version() -> String {
    "0.1.0".to_string()
}

fn default_cache_enabled() -> bool {
    true
}

impl StepDeclaration {
    pub fn spec(&self) -> StepSpec {
        let queue = match self.queue.as_deref() {
            None => ExecutionTarget::DefaultQueue,
            Some("local") => ExecutionTarget::Local,
            Some(name) => ExecutionTarget::Queue(name.to_string()),
        };

        StepSpec::new(self.name.clone())
            .with_parents(self.parents.iter().cloned())
            .with_cache(self.cache_enabled)
            .with_retry_limit(self.retry_limit)
            .with_queue(queue)
    }
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline definition")
    }

    /// Every named queue the steps refer to
    pub fn queue_names(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter_map(|s| s.queue.clone())
            .filter(|q| q != "local")
            .collect()
    }
}

/// Everything a pipeline run needs, wired together once
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub event_log: Arc<JsonlEventLog>,
    pub params: Arc<RwLock<ParameterDocument>>,
    pub orchestrator: PipelineOrchestrator,
}

impl AppState {
    pub fn new(settings: Settings, params: ParameterDocument, queues: &BTreeSet<String>) -> Result<Self> {
        std::fs::create_dir_all(&settings.storage.data_dir)
            .context("Failed to create data directory")?;
        let settings = Arc::new(settings);

        let blob_store =
            open_blob_store(&settings.storage).context("Failed to create blob store")?;

        let event_log = Arc::new(
            JsonlEventLog::new(settings.event_log_path()).context("Failed to create event log")?,
        );

        let index_store = Arc::new(
            RedbIndexStore::new(settings.index_path()).context("Failed to create index store")?,
        );

        let registry = Arc::new(RunRegistry::new(
            event_log.clone(),
            blob_store.clone(),
            index_store.clone(),
        ));
        let datasets = Arc::new(
            DatasetStore::open(blob_store, index_store.clone())
                .context("Failed to open dataset store")?,
        );
        let params = Arc::new(RwLock::new(params));

        let lifecycle = Arc::new(StepLifecycle::new(
            settings.clone(),
            registry,
            datasets.clone(),
            params.clone(),
        ));
        let cache = Arc::new(StepCache::new(index_store, datasets.clone()));

        // In-process workers serve the default queue and every queue the pipeline names
        let mut orchestrator = PipelineOrchestrator::new(lifecycle.clone(), cache);
        let workers = settings.orchestrator.max_parallel_steps;
        let mut names = queues.clone();
        names.insert(settings.orchestrator.default_queue.clone());
        for name in names {
            orchestrator =
                orchestrator.with_queue(Arc::new(WorkerQueue::new(name, lifecycle.clone(), workers)));
        }

        Ok(Self {
            settings,
            event_log,
            params,
            orchestrator,
        })
    }
}
