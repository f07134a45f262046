pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod remote;
pub mod step;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::*;
pub use job::{ExecutionBackend, Job, JobMode, JobStatus, MdEngine, RgRange};
pub use remote::{BatchState, RemoteBatchInfo};
pub use step::{StepName, StepState, StepStatus, Steps};
pub use store::{FileJobStore, JobMutation, JobStore, MemoryJobStore};
