//! Remote Batch Monitor for jobs executed by the batch scheduler.
//!
//! This crate provides:
//! - `SchedulerClient` trait and the reqwest-backed `SfApiClient`
//! - `TokenProvider` with static and file-backed tokens
//! - `RemoteBatchMonitor`, which polls active remote jobs, mirrors their
//!   state and runs the one-time cleanup when a batch run completes

pub mod client;
pub mod error;
pub mod monitor;
pub mod token;

pub use client::{SchedulerClient, SchedulerJobState, SfApiClient};
pub use error::{MonitorError, SchedulerError};
pub use monitor::{mirror_status_file, PollSummary, RemoteBatchMonitor};
pub use token::{StaticToken, TokenFile, TokenProvider};
