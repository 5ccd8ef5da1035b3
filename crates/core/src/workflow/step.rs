//! The extension points every pipeline step implements.

use crate::config::Settings;
use crate::error::{ItemFailure, PipelineResult};
use crate::params::{ParameterDocument, COMMON_GROUP};
use crate::registry::{RunHandle, RunRegistry};
use crate::types::{BlobHash, DatasetId, LogLevel, StepKind};
use anyhow::Context;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// An item a step processed and the files it wrote for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedItem {
    pub item: String,
    pub outputs: Vec<PathBuf>,
}

/// Per-item result; failures never abort the other items
pub type ItemResult = Result<ProcessedItem, ItemFailure>;

/// What `process()` produced
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub items: Vec<ItemResult>,
}

impl ProcessOutcome {
    pub fn new(items: Vec<ItemResult>) -> Self {
        Self { items }
    }

    pub fn processed(&self) -> impl Iterator<Item = &ProcessedItem> {
        self.items.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemFailure> {
        self.items.iter().filter_map(|r| r.as_ref().err())
    }

    /// Identifiers of every item, successful or not
    pub fn item_ids(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|r| match r {
                Ok(item) => item.item.clone(),
                Err(failure) => failure.item.clone(),
            })
            .collect()
    }
}

/// Everything a step sees while it runs
pub struct StepContext {
    pub step_name: String,
    pub settings: Arc<Settings>,
    pub run: RunHandle,
    pub registry: Arc<RunRegistry>,
    pub params: Arc<RwLock<ParameterDocument>>,
    pub input_datasets: Vec<DatasetId>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl StepContext {
    /// Bound parameters of the step's own group
    pub async fn step_params(&self) -> Map<String, Value> {
        self.run.parameters(&self.step_name).await.unwrap_or_default()
    }

    pub async fn param(&self, key: &str) -> Option<Value> {
        self.step_params().await.get(key).cloned()
    }

    pub async fn common_param(&self, key: &str) -> Option<Value> {
        self.run
            .parameters(COMMON_GROUP)
            .await
            .and_then(|group| group.get(key).cloned())
    }

    /// Persist a derived value on the run and back into the parameter document
    pub async fn record_derived(&self, key: &str, value: Value) -> PipelineResult<Value> {
        let stored = self
            .registry
            .record_derived(&self.run, &self.step_name, key, value)
            .await?;
        self.params
            .write()
            .await
            .set_derived(&self.step_name, key, stored.clone());
        Ok(stored)
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, console: bool) {
        if let Err(e) = self.registry.log(&self.run, level, message, console).await {
            tracing::warn!(step = %self.step_name, "Failed to append to run log: {}", e);
        }
    }

    pub async fn record_json_artifact(&self, name: &str, value: &Value) -> PipelineResult<BlobHash> {
        self.registry
            .record_json_artifact(&self.run, name, value)
            .await
    }
}

/// A stage of the pipeline. The lifecycle controller drives every step
/// through the same protocol; steps only supply directories, the per-item
/// work and their artifacts.
#[async_trait::async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StepKind {
        StepKind::DataProcessing
    }

    /// Local directory holding (or receiving) the step's input
    fn input_directory(&self) -> PathBuf;

    fn output_directory(&self) -> PathBuf;

    /// Files to process once the input dataset is resolved
    fn input_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        list_files(&self.input_directory(), None)
    }

    async fn process(&self, ctx: &StepContext) -> anyhow::Result<ProcessOutcome>;

    /// Best-effort; failures here never undo the published output
    async fn upload_artifacts(
        &self,
        _ctx: &StepContext,
        _outcome: &ProcessOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Dataset name under which a step's local input is published
pub fn input_dataset_name(step: &str) -> String {
    format!("{} input dataset", step.replace('_', " "))
}

/// Dataset name under which a step's output is published
pub fn output_dataset_name(step: &str) -> String {
    format!("{} output dataset", step.replace('_', " "))
}

/// Normalized identifier of an input file: stem without spaces, upper-cased
pub fn item_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().replace(' ', "").to_uppercase())
        .unwrap_or_default()
}

/// Files directly under `dir`, sorted, optionally filtered by extension
pub fn list_files(dir: &Path, extension: Option<&str>) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if !path.is_file() {
            continue;
        }
        let matches = extension.map_or(true, |ext| {
            path.extension()
                .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        });
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Whether a directory is missing or holds no entries
pub fn is_empty_dir(dir: &Path) -> anyhow::Result<bool> {
    if !dir.exists() {
        return Ok(true);
    }
    let mut entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    Ok(entries.next().is_none())
}
