//! Bounded worker pool for the per-item work inside a step.

use crate::config::Settings;
use crate::error::ItemFailure;
use crate::workflow::step::{item_id, ItemResult, ProcessedItem};
use anyhow::Context;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Blocking transformation of one input file into zero or more output files
pub trait ItemTransform: Send + Sync + 'static {
    fn transform(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &Map<String, Value>,
    ) -> anyhow::Result<Vec<PathBuf>>;
}

/// Runs an [`ItemTransform`] over many files with at most `n_workers` in flight
#[derive(Debug, Clone)]
pub struct ItemPool {
    n_workers: usize,
    item_timeout: Duration,
}

impl ItemPool {
    pub fn new(n_workers: usize, item_timeout: Duration) -> Self {
        Self {
            n_workers: n_workers.max(1),
            item_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.workers.n_workers,
            Duration::from_secs(settings.workers.item_timeout_secs),
        )
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Process every item; results come back in input order. A failing,
    /// panicking or timed-out item only affects its own result.
    ///
    /// Each item writes into its own scratch directory next to `output_dir`;
    /// only the files of a successful item are moved into `output_dir`. A
    /// worker thread cannot be interrupted, so a timed-out item keeps its
    /// pool slot until the thread returns and its late files are discarded.
    pub async fn run(
        &self,
        items: Vec<PathBuf>,
        output_dir: PathBuf,
        params: Map<String, Value>,
        transform: Arc<dyn ItemTransform>,
    ) -> Vec<ItemResult> {
        let total = items.len();
        let ids: Vec<String> = items.iter().map(|p| item_id(p)).collect();
        let semaphore = Arc::new(Semaphore::new(self.n_workers));
        let params = Arc::new(params);
        let scratch_root = scratch_root_for(&output_dir);
        let mut join_set = JoinSet::new();

        for (position, input) in items.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let transform = transform.clone();
            let params = params.clone();
            let output_dir = output_dir.clone();
            let scratch = scratch_root.join(position.to_string());
            let item = ids[position].clone();
            let timeout = self.item_timeout;

            join_set.spawn(async move {
                let failed = |item: String, reason: String| -> (usize, ItemResult) {
                    (position, Err(ItemFailure { item, reason }))
                };

                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return failed(item, "worker pool closed".to_string()),
                };
                if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
                    return failed(item, format!("failed to create scratch directory: {}", e));
                }

                tracing::debug!(item = %item, "Processing item");
                let worker_scratch = scratch.clone();
                let mut work = tokio::task::spawn_blocking(move || {
                    transform.transform(&input, &worker_scratch, &params)
                });

                let result = match tokio::time::timeout(timeout, &mut work).await {
                    Ok(Ok(Ok(outputs))) => promote(scratch.clone(), output_dir, outputs)
                        .await
                        .map(|outputs| ProcessedItem {
                            item: item.clone(),
                            outputs,
                        })
                        .map_err(|e| ItemFailure {
                            item: item.clone(),
                            reason: format!("failed to keep outputs: {:#}", e),
                        }),
                    Ok(Ok(Err(e))) => Err(ItemFailure {
                        item: item.clone(),
                        reason: format!("{:#}", e),
                    }),
                    Ok(Err(join_error)) => Err(ItemFailure {
                        item: item.clone(),
                        reason: format!("worker panicked: {}", join_error),
                    }),
                    Err(_) => {
                        tracing::warn!(item = %item, "Item timed out, waiting for its worker to return");
                        let _ = work.await;
                        Err(ItemFailure {
                            item: item.clone(),
                            reason: format!("timed out after {}s", timeout.as_secs_f64()),
                        })
                    }
                };

                if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                    tracing::debug!(item = %item, "Failed to remove scratch directory: {}", e);
                }
                (position, result)
            });
        }

        let mut slots: Vec<Option<ItemResult>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((position, result)) => slots[position] = Some(result),
                Err(e) => tracing::error!("Item task failed to join: {}", e),
            }
        }

        if tokio::fs::try_exists(&scratch_root).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&scratch_root).await {
                tracing::warn!("Failed to remove {}: {}", scratch_root.display(), e);
            }
        }

        slots
            .into_iter()
            .zip(ids)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| {
                    Err(ItemFailure {
                        item,
                        reason: "worker task aborted".to_string(),
                    })
                })
            })
            .collect()
    }
}

/// Sibling of `output_dir`, so unfinished item files are never published with it
fn scratch_root_for(output_dir: &Path) -> PathBuf {
    let name = output_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_dir.with_file_name(format!(".{}-items-{}", name, Uuid::new_v4()))
}

/// Move an item's files from its scratch directory into `output_dir`,
/// returning the reported outputs at their final location
async fn promote(scratch: PathBuf, output_dir: PathBuf, outputs: Vec<PathBuf>) -> anyhow::Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || promote_files(&scratch, &output_dir, outputs))
        .await
        .context("Promotion task failed")?
}

fn promote_files(scratch: &Path, output_dir: &Path, outputs: Vec<PathBuf>) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(scratch).min_depth(1) {
        let entry = entry.context("Failed to walk item outputs")?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    for file in files {
        let relative = file
            .strip_prefix(scratch)
            .context("Item output outside of its scratch directory")?;
        let target = output_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::rename(&file, &target)
            .with_context(|| format!("Failed to move {} into place", relative.display()))?;
    }

    Ok(outputs
        .into_iter()
        .map(|path| match path.strip_prefix(scratch) {
            Ok(relative) => output_dir.join(relative),
            Err(_) => path,
        })
        .collect())
}
