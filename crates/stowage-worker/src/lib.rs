//! Stowage background job queue.
//!
//! Durable, priority-ordered, at-least-once execution of cleanup and bookkeeping jobs,
//! with a separate worker pool for long-running jobs so they never starve short ones.

pub mod context;
pub mod queue;

pub use context::{ExecutorRegistry, JobAlertSink, JobExecutor, LoggingAlertSink};
pub use queue::{JobNotifier, JobQueue, JobQueueHandle, MAX_RETRY_BACKOFF_SECS};
