//! Job scheduling layer: the bounded in-process job queue with its worker
//! pool, the broadcast event bus, the cron scheduler, and the cooperative
//! shutdown signal shared by all long-running components.

pub mod events;
pub mod queue;
pub mod scheduler;
pub mod shutdown;

pub use events::{EventBus, JobEvent};
pub use queue::{JobExecutor, JobQueue, QueueCounts, QueueSettings};
pub use scheduler::{CronScheduler, SchedulerStatus};
pub use shutdown::ShutdownSignal;
