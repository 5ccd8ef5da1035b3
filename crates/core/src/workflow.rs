// Step lifecycle and DAG orchestration

pub mod cache;
pub mod dag;
pub mod items;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod step;

pub use cache::{CacheKey, StepCache};
pub use dag::PipelineDag;
pub use items::{ItemPool, ItemTransform};
pub use lifecycle::{StepAttempt, StepLifecycle, StepReport};
pub use orchestrator::{PipelineOrchestrator, PipelineReport, StepOutcome};
pub use pipeline::Pipeline;
pub use queue::{ExecutionQueue, QueueState, TicketId, WorkUnit, WorkerQueue};
pub use step::{
    input_dataset_name, item_id, list_files, output_dataset_name, ItemResult, PipelineStep,
    ProcessOutcome, ProcessedItem, StepContext,
};
