use crate::error::ItemFailure;
use crate::hashing::hash_str;
use crate::types::LogLevel;
use crate::workflow::step::{
    item_id, list_files, PipelineStep, ProcessOutcome, ProcessedItem, StepContext,
};
use anyhow::Context;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const TRAIN_FOLDER: &str = "train";
pub const TEST_FOLDER: &str = "test";

/// Splits input files into `train/` and `test/` and numbers every file
pub struct SplitDatasetStep {
    name: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    extension: Option<String>,
}

impl SplitDatasetStep {
    pub fn new(
        name: impl Into<String>,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Items held out for testing. Explicit `test_objects` win; otherwise
    /// `num_test_objects` items are sampled deterministically from the seed.
    async fn resolve_test_objects(
        &self,
        ctx: &StepContext,
        items: &[String],
    ) -> anyhow::Result<BTreeSet<String>> {
        let params = ctx.step_params().await;
        if !params.get("split_test").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(BTreeSet::new());
        }

        let selected = match params.get("test_objects").and_then(Value::as_array) {
            Some(explicit) => explicit
                .iter()
                .filter_map(Value::as_str)
                .map(|id| id.replace(' ', "").to_uppercase())
                .collect(),
            None => {
                let count = params
                    .get("num_test_objects")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                sample_items(items, count, ctx.settings.random_seed)
            }
        };

        let stored = ctx
            .record_derived("test_objects", json!(selected))
            .await
            .context("Failed to record test objects")?;
        let stored: Vec<String> =
            serde_json::from_value(stored).context("Recorded test objects are not a list")?;
        Ok(stored.into_iter().collect())
    }
}

/// Stable sample of `count` items: ordered by the hash of seed and item id
fn sample_items(items: &[String], count: usize, seed: u64) -> Vec<String> {
    let mut ranked: Vec<(String, &String)> = items
        .iter()
        .map(|item| (hash_str(&format!("{}:{}", seed, item)), item))
        .collect();
    ranked.sort();
    let mut sample: Vec<String> = ranked
        .into_iter()
        .take(count.min(items.len()))
        .map(|(_, item)| item.clone())
        .collect();
    sample.sort();
    sample
}

async fn copy_into(input: &Path, folder: &Path) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(folder)
        .await
        .with_context(|| format!("Failed to create {}", folder.display()))?;
    let file_name = input
        .file_name()
        .with_context(|| format!("{} has no file name", input.display()))?;
    let target = folder.join(file_name);
    tokio::fs::copy(input, &target)
        .await
        .with_context(|| format!("Failed to copy {}", input.display()))?;
    Ok(target)
}

#[async_trait::async_trait]
impl PipelineStep for SplitDatasetStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_directory(&self) -> PathBuf {
        self.input_dir.clone()
    }

    fn output_directory(&self) -> PathBuf {
        self.output_dir.clone()
    }

    fn input_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        list_files(&self.input_dir, self.extension.as_deref())
    }

    async fn process(&self, ctx: &StepContext) -> anyhow::Result<ProcessOutcome> {
        let files = self.input_files()?;
        let ids: Vec<String> = files.iter().map(|f| item_id(f)).collect();
        let test_objects = self.resolve_test_objects(ctx, &ids).await?;

        let mut items = Vec::with_capacity(files.len());
        for (file, item) in files.iter().zip(ids) {
            ctx.log(LogLevel::Debug, format!("Processing of {}", item), false)
                .await;

            let folder = if test_objects.contains(&item) {
                ctx.output_dir.join(TEST_FOLDER)
            } else {
                ctx.output_dir.join(TRAIN_FOLDER)
            };
            let result = match copy_into(file, &folder).await {
                Ok(target) => Ok(ProcessedItem {
                    item,
                    outputs: vec![target],
                }),
                Err(e) => Err(ItemFailure {
                    item,
                    reason: format!("{:#}", e),
                }),
            };
            items.push(result);
        }

        Ok(ProcessOutcome::new(items))
    }

    async fn upload_artifacts(&self, ctx: &StepContext, outcome: &ProcessOutcome) -> anyhow::Result<()> {
        let mapping: Map<String, Value> = outcome
            .item_ids()
            .into_iter()
            .enumerate()
            .map(|(group, item)| (item, json!(group)))
            .collect();
        ctx.record_json_artifact("groups_mapping", &Value::Object(mapping))
            .await?;
        Ok(())
    }
}
