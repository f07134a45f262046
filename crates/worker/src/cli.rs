use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Runs refinement jobs locally and watches jobs on the remote scheduler.
///
/// Settings come from the environment (and `.env`); see `Config::from_env`.
#[derive(Parser, Debug)]
#[command(name = "refinery-worker", version, about = "BilboMD refinement worker")]
pub struct WorkerArgs {
    /// Job store directory (overrides JOB_STORE_DIR)
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one attempt of a local job's pipeline
    Run {
        #[arg(long, env = "REFINERY_JOB_ID")]
        job: Uuid,

        /// Attempt number from the retry harness; the failure email goes
        /// out only on the last one
        #[arg(long, env = "REFINERY_ATTEMPT", default_value = "1")]
        attempt: u32,
    },

    /// Poll the remote scheduler for active remote jobs
    Monitor {
        /// Poll once and exit
        #[arg(long)]
        once: bool,

        /// Bearer token, used when SFAPI_TOKEN_FILE is not set
        #[arg(long, env = "SFAPI_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Print a job document as JSON
    Show {
        #[arg(long, env = "REFINERY_JOB_ID")]
        job: Uuid,
    },
}
