//! Callgate - admission and retry scheduling for outbound backend calls
//!
//! Callgate sits between application code and a rate-limited backend. Every
//! call goes through a [`Scheduler`], which admits it only when both limits
//! allow, and retries it with exponential backoff when the backend reports
//! throttling.
//!
//! # Core Concepts
//!
//! - **Admission**: a call starts only when a concurrency slot is free and the
//!   sliding rate window has room
//! - **Throttling only**: retries happen for throttling signals; any other
//!   failure is surfaced at once
//! - **Exactly-once settlement**: every submitted call resolves its handle once
//! - **Batches**: the [`BatchRunner`] runs a sequence of calls in order and
//!   reports per-item failures without aborting
//!
//! # Modules
//!
//! - [`scheduler`] - Admission, rate window, retry and cancellation
//! - [`batch`] - Sequential batch runner
//! - [`error`] - Call errors and the throttling classifier
//! - [`simulate`] - In-process backend for demos and tests
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod simulate;

// Re-export commonly used types
pub use batch::{BatchError, BatchHooks, BatchRunner};
pub use config::Config;
pub use error::{BackendError, CallError, Throttle};
pub use scheduler::{
    CallHandle, ConfigError, QueueEntry, QueueEntryStatus, RetryPlacement, Scheduler, SchedulerConfig,
    SchedulerConfigUpdate, SchedulerCounters, SchedulerStats,
};
pub use simulate::{SimulatedBackend, SimulationConfig};
