//! Process execution and concurrency control for pipeline stages.
//!
//! This crate provides:
//! - `CommandRunner` trait and the tokio-backed `ProcessRunner`
//! - Line-oriented output sinks (`StageLog` appends `<stage>.log` / `<stage>_error.log`)
//! - `ConcurrencyLimiter`, a FIFO counting semaphore
//! - `GpuAllocator`, deterministic round-robin device assignment
//! - `settle_all`, bounded fan-out that waits for every task
//! - `PeriodicTask` / `Heartbeat` scheduled tasks driven by the tokio clock

pub mod allocator;
pub mod command;
pub mod error;
pub mod fanout;
pub mod limiter;
pub mod runner;
pub mod schedule;
pub mod sink;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use allocator::GpuAllocator;
pub use command::{CommandSpec, ExitOutcome};
pub use error::RunError;
pub use fanout::settle_all;
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use runner::{CommandRunner, ProcessRunner};
pub use schedule::{run_every, Heartbeat, PeriodicTask};
pub use sink::{CaptureSink, NullSink, OutputSink, StageLog, Stream};
