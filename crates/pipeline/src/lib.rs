//! The refinement pipeline: stage executors, results assembly and the
//! orchestrator that runs them in order for one job.
//!
//! Stages run external tools through a [`refinery_exec::CommandRunner`] and
//! record every step transition in a [`refinery_core::JobStore`] before moving on.

pub mod context;
pub mod engine;
pub mod error;
pub mod movies;
pub mod orchestrator;
pub mod results;
pub mod stage;
pub mod stages;

pub use context::{JobLogFile, PipelineSettings, StageContext, TaskLog};
pub use error::{PipelineError, StageError};
pub use movies::{render_movies, MovieSummary};
pub use orchestrator::{notify_owner, stage_for, Orchestrator, Pipeline};
pub use results::{archive_name, ResultsStage};
pub use stage::{run_stage, Stage};
