//! Scheduler for outbound backend calls
//!
//! Gates calls to a single rate-limited backend with a concurrency limit and
//! a sliding-window request cap, and retries throttled calls with
//! exponential backoff. One processing loop per scheduler owns admission.

mod config;
mod core;
mod handle;
mod queue;

pub use config::{ConfigError, RetryPlacement, SchedulerConfig, SchedulerConfigUpdate};
pub use self::core::Scheduler;
pub use handle::CallHandle;
pub use queue::{QueueEntry, QueueEntryStatus, SchedulerCounters, SchedulerStats};
