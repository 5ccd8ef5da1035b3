use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for a step run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a dataset version: `{project}/{name}/v{version}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl DatasetId {
    pub fn new(project: &str, name: &str, version: u64) -> Self {
        Self(format!("{}/{}/v{}", project, name, version))
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob hash (SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHash(pub String);

impl BlobHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }
}

impl std::fmt::Display for BlobHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a step performs, recorded on its runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    DataProcessing,
    Training,
    Testing,
    Inference,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepKind::DataProcessing => "data_processing",
            StepKind::Training => "training",
            StepKind::Testing => "testing",
            StepKind::Inference => "inference",
        };
        f.write_str(name)
    }
}

/// Status of a single step run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Created, RunStatus::Running)
                | (RunStatus::Created, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Severity of a run log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Parameter snapshot of a run: group name -> key/value map
pub type ParameterGroups = BTreeMap<String, serde_json::Map<String, serde_json::Value>>;

/// One tracked execution of one pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub step_name: String,
    pub kind: StepKind,
    pub tags: BTreeSet<String>,
    pub parameters: ParameterGroups,
    pub status: RunStatus,
    pub artifacts: BTreeMap<String, BlobHash>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A versioned, lineage-tracked collection of files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub project: String,
    pub name: String,
    pub version: u64,
    pub parents: Vec<DatasetId>,
    /// Relative file path -> content hash
    pub files: BTreeMap<String, BlobHash>,
    pub finalized: bool,
    /// Global order in which datasets were finalized
    pub finalize_seq: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Where a step executes when the pipeline runs in remote mode
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    /// Always in process
    Local,
    /// The named execution queue
    Queue(String),
    /// The configured default queue
    #[default]
    DefaultQueue,
}

/// Specification for a single pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub retry_limit: u32,
    #[serde(default)]
    pub queue: ExecutionTarget,
}

fn default_cache_enabled() -> bool {
    true
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
            cache_enabled: default_cache_enabled(),
            retry_limit: 0,
            queue: ExecutionTarget::default(),
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_queue(mut self, queue: ExecutionTarget) -> Self {
        self.queue = queue;
        self
    }
}

/// Cached outputs of a successful step run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub step_name: String,
    pub params_hash: String,
    pub inputs_hash: String,
    pub outputs: Vec<DatasetId>,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
}

/// How the orchestrator dispatches steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    Remote,
}

/// Terminal state of a step within one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Succeeded,
    /// Skipped because a valid cache entry substituted for a run
    Cached,
    Failed,
    /// An ancestor failed
    Blocked,
    /// The pipeline was stopped before the step started
    NotStarted,
}

impl StepState {
    /// Whether downstream steps may consume this step's outputs
    pub fn is_success(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Cached)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepState::Succeeded => "succeeded",
            StepState::Cached => "cached",
            StepState::Failed => "failed",
            StepState::Blocked => "blocked",
            StepState::NotStarted => "not_started",
        };
        f.write_str(name)
    }
}
