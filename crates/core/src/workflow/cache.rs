//! Step-level result cache.
//!
//! A step's outputs are reused when the same step ran before with the same
//! bound parameters and the same input fingerprints, provided every output
//! dataset it published is still finalized.

use crate::dataset::DatasetStore;
use crate::error::PipelineResult;
use crate::hashing::{hash_json, hash_str};
use crate::storage::RedbIndexStore;
use crate::types::{CacheEntry, DatasetId, RunId};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub key: String,
    pub params_hash: String,
    pub inputs_hash: String,
}

impl CacheKey {
    /// Combine step identity, bound parameters and input fingerprints
    pub fn compute(step_name: &str, params: &Value, inputs: &[String]) -> Self {
        let params_hash = hash_json(params);
        let mut sorted = inputs.to_vec();
        sorted.sort();
        let inputs_hash = hash_str(&sorted.join("\n"));
        let key = hash_str(&format!("{}:{}:{}", step_name, params_hash, inputs_hash));

        Self {
            key,
            params_hash,
            inputs_hash,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.key[..12.min(self.key.len())])
    }
}

pub struct StepCache {
    index: Arc<RedbIndexStore>,
    datasets: Arc<DatasetStore>,
}

impl StepCache {
    pub fn new(index: Arc<RedbIndexStore>, datasets: Arc<DatasetStore>) -> Self {
        Self { index, datasets }
    }

    /// A usable entry for `key`, if any
    pub async fn lookup(&self, key: &CacheKey) -> PipelineResult<Option<CacheEntry>> {
        let Some(entry) = self.index.get_cache_entry(&key.key)? else {
            return Ok(None);
        };

        for output in &entry.outputs {
            if !self.datasets.is_intact(output).await? {
                tracing::debug!(
                    step = %entry.step_name,
                    dataset = %output,
                    "Cache entry references a dataset that is pending or incomplete"
                );
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }

    /// Remember the outputs of a successful run, superseding any older entry
    pub async fn record(
        &self,
        key: &CacheKey,
        step_name: &str,
        outputs: Vec<DatasetId>,
        run_id: RunId,
    ) -> PipelineResult<CacheEntry> {
        let entry = CacheEntry {
            key: key.key.clone(),
            step_name: step_name.to_string(),
            params_hash: key.params_hash.clone(),
            inputs_hash: key.inputs_hash.clone(),
            outputs,
            run_id,
            created_at: chrono::Utc::now(),
        };
        self.index.store_cache_entry(&entry)?;
        tracing::debug!(step = step_name, key = %key, "Recorded cache entry");
        Ok(entry)
    }
}
