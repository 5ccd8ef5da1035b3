use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in a run's event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events recorded for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunRegistered {
        step_name: String,
        kind: StepKind,
        tags: Vec<String>,
    },
    StatusChanged {
        from: RunStatus,
        to: RunStatus,
    },

    // Parameter events
    ParametersBound {
        group: String,
        values: serde_json::Map<String, serde_json::Value>,
    },
    DerivedParameterRecorded {
        group: String,
        key: String,
        value: serde_json::Value,
    },

    // Log stream
    LogLine {
        level: LogLevel,
        message: String,
        /// Whether the line was echoed to interactive output
        console: bool,
    },

    // Artifact events
    ArtifactRecorded {
        name: String,
        content_hash: BlobHash,
        size_bytes: u64,
    },

    // Dataset lineage events
    InputResolved {
        datasets: Vec<DatasetId>,
    },
    OutputPublished {
        dataset_id: DatasetId,
        parents: Vec<DatasetId>,
        file_count: usize,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Persist the events buffered for a run
    async fn flush_run(&self, run_id: RunId) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Get events for a run within a time range
    async fn get_run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Event>>;
}
