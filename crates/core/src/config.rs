//! Settings shared by the orchestrator and every step.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Project scope for datasets and runs
    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Parameter document with `common` and per-step groups
    #[serde(default = "default_params_path")]
    pub params_path: PathBuf,

    #[serde(default = "default_random_seed")]
    pub random_seed: u64,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub workers: WorkerSettings,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Keep blobs in this S3 bucket under `blob_dir` instead of on local disk
    #[serde(default)]
    pub s3_bucket: Option<String>,
}

/// Per-item worker pool used inside a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,

    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Steps of independent branches allowed to run at once
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Base delay before a retry, doubled on each attempt
    #[serde(default)]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_queue")]
    pub default_queue: String,
}

fn default_project() -> String {
    "strata".to_string()
}

fn default_params_path() -> PathBuf {
    PathBuf::from("params.toml")
}

fn default_random_seed() -> u64 {
    42
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

fn default_n_workers() -> usize {
    4
}

fn default_item_timeout_secs() -> u64 {
    600
}

fn default_max_parallel_steps() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_queue() -> String {
    "default".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project: default_project(),
            tags: Vec::new(),
            params_path: default_params_path(),
            random_seed: default_random_seed(),
            storage: StorageSettings::default(),
            workers: WorkerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            blob_dir: default_blob_dir(),
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
            s3_bucket: None,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            item_timeout_secs: default_item_timeout_secs(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: 0,
            default_queue: default_queue(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read settings file")?;
        toml::from_str(&content).context("Failed to parse settings file")
    }

    /// Get the blob storage path
    pub fn blob_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.blob_dir)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.index_file)
    }
}
