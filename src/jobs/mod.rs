//! Job pipeline: payloads, enqueue, dispatch, and the polling runner.

pub mod dispatcher;
pub mod payload;
pub mod processors;
pub mod queue;
pub mod runner;

pub use dispatcher::{JobProcessor, ProcessorRegistry};
pub use payload::{JobKind, JobPayload};
pub use queue::{enqueue, BatchState, BatchStatus, QueueManager};
pub use runner::{JobRunner, RetryPolicy, RunSummary};
