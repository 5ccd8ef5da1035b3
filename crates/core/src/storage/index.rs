use crate::types::{CacheEntry, Dataset, DatasetId, Run, RunId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

const RUNS_TABLE: RecordTable = TableDefinition::new("runs");
const DATASETS_TABLE: RecordTable = TableDefinition::new("datasets");
const CACHE_TABLE: RecordTable = TableDefinition::new("cache_entries");

/// Index store for runs, dataset metadata and cache entries using redb
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            for table in [RUNS_TABLE, DATASETS_TABLE, CACHE_TABLE] {
                write_txn
                    .open_table(table)
                    .with_context(|| format!("Failed to open {} table", table.name()))?;
            }
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, table: RecordTable, key: &str, record: &T) -> Result<()> {
        let value = serde_json::to_vec(record).context("Failed to serialize record")?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(table)
                .context("Failed to open table")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: RecordTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let record =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: RecordTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            let record =
                serde_json::from_slice(value.value()).context("Failed to deserialize record")?;
            records.push(record);
        }

        Ok(records)
    }

    /// Index a run for later inspection
    pub fn index_run(&self, run: &Run) -> Result<()> {
        self.put(RUNS_TABLE, &run.id.to_string(), run)
    }

    /// Get a run by ID
    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get(RUNS_TABLE, &run_id.to_string())
    }

    /// List runs of a step, oldest first
    pub fn list_runs_for_step(&self, step_name: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .list(RUNS_TABLE)?
            .into_iter()
            .filter(|run: &Run| run.step_name == step_name)
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    /// Store dataset metadata
    pub fn store_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.put(DATASETS_TABLE, &dataset.id.0, dataset)
    }

    pub fn get_dataset(&self, id: &DatasetId) -> Result<Option<Dataset>> {
        self.get(DATASETS_TABLE, &id.0)
    }

    pub fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.list(DATASETS_TABLE)
    }

    /// Store a cache entry, superseding any entry under the same key
    pub fn store_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.put(CACHE_TABLE, &entry.key, entry)
    }

    pub fn get_cache_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.get(CACHE_TABLE, key)
    }
}
