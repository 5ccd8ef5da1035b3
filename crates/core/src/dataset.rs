//! Versioned, lineage-tracked dataset storage.
//!
//! File contents go to the content-addressed blob store; dataset metadata is
//! kept in memory and mirrored to the index store so it survives restarts.
//! A dataset is visible to lookups only once finalized, after which its
//! manifest never changes.

use crate::error::{PipelineError, PipelineResult};
use crate::storage::{BlobStore, RedbIndexStore};
use crate::types::{BlobHash, Dataset, DatasetId};
use anyhow::Context;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lightweight reference to a dataset version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetHandle {
    pub id: DatasetId,
    pub project: String,
    pub name: String,
    pub version: u64,
}

impl From<&Dataset> for DatasetHandle {
    fn from(dataset: &Dataset) -> Self {
        Self {
            id: dataset.id.clone(),
            project: dataset.project.clone(),
            name: dataset.name.clone(),
            version: dataset.version,
        }
    }
}

#[derive(Default)]
struct Catalog {
    datasets: HashMap<DatasetId, Dataset>,
    // Highest version allocated per (project, name)
    versions: HashMap<(String, String), u64>,
    finalize_seq: u64,
}

pub struct DatasetStore {
    blob_store: Arc<dyn BlobStore>,
    index: Arc<RedbIndexStore>,
    catalog: RwLock<Catalog>,
}

impl DatasetStore {
    /// Open the store, reloading dataset metadata from the index
    pub fn open(blob_store: Arc<dyn BlobStore>, index: Arc<RedbIndexStore>) -> PipelineResult<Self> {
        let mut catalog = Catalog::default();
        for dataset in index.list_datasets()? {
            let key = (dataset.project.clone(), dataset.name.clone());
            let version = catalog.versions.entry(key).or_default();
            *version = (*version).max(dataset.version);
            if let Some(seq) = dataset.finalize_seq {
                catalog.finalize_seq = catalog.finalize_seq.max(seq);
            }
            catalog.datasets.insert(dataset.id.clone(), dataset);
        }

        tracing::debug!(datasets = catalog.datasets.len(), "Opened dataset store");

        Ok(Self {
            blob_store,
            index,
            catalog: RwLock::new(catalog),
        })
    }

    /// Allocate a new, non-finalized dataset version
    pub async fn create_dataset(
        &self,
        project: &str,
        name: &str,
        parents: &[DatasetId],
    ) -> PipelineResult<DatasetHandle> {
        let dataset = {
            let mut catalog = self.catalog.write().await;
            let version = {
                let counter = catalog
                    .versions
                    .entry((project.to_string(), name.to_string()))
                    .or_default();
                *counter += 1;
                *counter
            };

            let dataset = Dataset {
                id: DatasetId::new(project, name, version),
                project: project.to_string(),
                name: name.to_string(),
                version,
                parents: parents.to_vec(),
                files: BTreeMap::new(),
                finalized: false,
                finalize_seq: None,
                created_at: chrono::Utc::now(),
                finalized_at: None,
            };
            catalog.datasets.insert(dataset.id.clone(), dataset.clone());
            dataset
        };

        self.index.store_dataset(&dataset)?;
        tracing::debug!(dataset = %dataset.id, parents = parents.len(), "Created dataset");

        Ok(DatasetHandle::from(&dataset))
    }

    /// Attach every file under `source_path` to the pending manifest.
    /// On failure the manifest is left as it was.
    pub async fn add_files(&self, handle: &DatasetHandle, source_path: &Path) -> PipelineResult<usize> {
        let upload_error = |reason: String| PipelineError::DatasetUpload {
            dataset: handle.id.clone(),
            reason,
        };

        {
            let catalog = self.catalog.read().await;
            match catalog.datasets.get(&handle.id) {
                Some(dataset) if dataset.finalized => {
                    return Err(upload_error("dataset is already finalized".to_string()))
                }
                Some(_) => {}
                None => return Err(upload_error("dataset does not exist".to_string())),
            }
        }

        let files = self
            .upload_directory(source_path)
            .await
            .map_err(|e| upload_error(format!("{:#}", e)))?;
        let count = files.len();

        let snapshot = {
            let mut catalog = self.catalog.write().await;
            let dataset = catalog
                .datasets
                .get_mut(&handle.id)
                .ok_or_else(|| upload_error("dataset does not exist".to_string()))?;
            // Finalized concurrently while the files were uploading
            if dataset.finalized {
                return Err(upload_error("dataset is already finalized".to_string()));
            }
            dataset.files.extend(files);
            dataset.clone()
        };

        self.index.store_dataset(&snapshot)?;
        tracing::debug!(dataset = %handle.id, files = count, "Attached files");

        Ok(count)
    }

    async fn upload_directory(&self, source_path: &Path) -> anyhow::Result<Vec<(String, BlobHash)>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(source_path).sort_by_file_name() {
            let entry = entry.context("Failed to walk dataset source")?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(source_path)
                .context("File outside of dataset source")?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let data = tokio::fs::read(entry.path())
                .await
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            let hash = self.blob_store.put(Bytes::from(data)).await?;
            files.push((key, hash));
        }
        Ok(files)
    }

    /// Freeze the manifest and make the dataset visible. Idempotent.
    pub async fn finalize(&self, handle: &DatasetHandle) -> PipelineResult<Dataset> {
        let snapshot = {
            let mut guard = self.catalog.write().await;
            let catalog = &mut *guard;
            let next_seq = catalog.finalize_seq + 1;
            let dataset = catalog.datasets.get_mut(&handle.id).ok_or_else(|| {
                PipelineError::DatasetUpload {
                    dataset: handle.id.clone(),
                    reason: "dataset does not exist".to_string(),
                }
            })?;
            if dataset.finalized {
                return Ok(dataset.clone());
            }

            dataset.finalized = true;
            dataset.finalize_seq = Some(next_seq);
            dataset.finalized_at = Some(chrono::Utc::now());
            let snapshot = dataset.clone();
            catalog.finalize_seq = next_seq;
            snapshot
        };

        self.index.store_dataset(&snapshot)?;
        tracing::info!(dataset = %snapshot.id, files = snapshot.files.len(), "Finalized dataset");

        Ok(snapshot)
    }

    /// Latest finalized dataset for project and name
    pub async fn get_dataset(&self, project: &str, name: &str) -> PipelineResult<Dataset> {
        let catalog = self.catalog.read().await;
        catalog
            .datasets
            .values()
            .filter(|d| d.finalized && d.project == project && d.name == name)
            .max_by_key(|d| d.finalize_seq)
            .cloned()
            .ok_or_else(|| PipelineError::DatasetNotFound {
                project: project.to_string(),
                name: name.to_string(),
            })
    }

    /// Exact lookup; pending datasets are returned too
    pub async fn get_by_id(&self, id: &DatasetId) -> Option<Dataset> {
        self.catalog.read().await.datasets.get(id).cloned()
    }

    /// Finalized, and every file's content is still in the blob store
    pub async fn is_intact(&self, id: &DatasetId) -> PipelineResult<bool> {
        let Some(dataset) = self.get_by_id(id).await.filter(|d| d.finalized) else {
            return Ok(false);
        };
        for hash in dataset.files.values() {
            if !self.blob_store.contains(hash).await? {
                tracing::warn!(dataset = %id, blob = %hash, "Dataset blob is missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write the dataset's files into `target_dir`, overwriting what is there
    pub async fn materialize(&self, id: &DatasetId, target_dir: &Path) -> PipelineResult<PathBuf> {
        let dataset = self
            .get_by_id(id)
            .await
            .filter(|d| d.finalized)
            .ok_or_else(|| PipelineError::DatasetNotFound {
                project: String::new(),
                name: id.0.clone(),
            })?;

        tokio::fs::create_dir_all(target_dir)
            .await
            .context("Failed to create materialization directory")?;

        for (relative, hash) in &dataset.files {
            let data = self
                .blob_store
                .get(hash)
                .await?
                .with_context(|| format!("Blob {} of {} is missing", hash, dataset.id))?;

            let path = target_dir.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create materialized directory")?;
            }
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        tracing::debug!(dataset = %dataset.id, target = %target_dir.display(), "Materialized dataset");

        Ok(target_dir.to_path_buf())
    }

    /// Ancestors of a dataset, nearest first
    pub async fn lineage(&self, id: &DatasetId) -> Vec<DatasetId> {
        let catalog = self.catalog.read().await;
        let mut seen = HashSet::new();
        let mut queue: VecDeque<DatasetId> = catalog
            .datasets
            .get(id)
            .map(|d| d.parents.iter().cloned().collect())
            .unwrap_or_default();

        let mut ancestors = Vec::new();
        while let Some(parent) = queue.pop_front() {
            if !seen.insert(parent.clone()) {
                continue;
            }
            if let Some(dataset) = catalog.datasets.get(&parent) {
                queue.extend(dataset.parents.iter().cloned());
            }
            ancestors.push(parent);
        }
        ancestors
    }
}
