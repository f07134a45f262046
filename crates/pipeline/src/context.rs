//! Everything a stage needs to run one job: settings, collaborators and
//! helpers for the common spawn-and-log pattern.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use refinery_core::config::{ComputeConfig, ToolsConfig};
use refinery_core::{Config, Job, JobMutation, JobStore, StepName, StepStatus};
use refinery_exec::{CommandRunner, CommandSpec, ConcurrencyLimiter, GpuAllocator, StageLog};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::StageError;

/// Static settings shared by every stage of every job.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub upload_dir: PathBuf,
    pub tools: ToolsConfig,
    pub compute: ComputeConfig,
    pub gpus: GpuAllocator,
    pub cpu_slots: usize,
    pub base_url: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_dir: config.worker.upload_dir.clone(),
            tools: config.tools.clone(),
            compute: config.compute.clone(),
            gpus: GpuAllocator::new(config.compute.gpu_devices.clone()),
            cpu_slots: config.compute.cpu_slots(),
            base_url: config.notify.base_url.clone(),
        }
    }

    pub fn cpu_limiter(&self) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(self.cpu_slots)
    }
}

/// Append-only log of a job's progress, separate from the tool logs.
#[async_trait]
pub trait TaskLog: Send + Sync {
    async fn log(&self, line: &str);
}

/// Appends timestamped lines to `worker.log` in the job directory.
#[derive(Debug, Clone)]
pub struct JobLogFile {
    path: PathBuf,
}

impl JobLogFile {
    pub fn new(work_dir: &Path) -> Self {
        Self { path: work_dir.join("worker.log") }
    }
}

#[async_trait]
impl TaskLog for JobLogFile {
    async fn log(&self, line: &str) {
        let entry = format!("{} {}\n", Utc::now().to_rfc3339(), line);
        let written = async {
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            f.write_all(entry.as_bytes()).await
        };
        if let Err(e) = written.await {
            warn!(path = %self.path.display(), error = %e, "failed to append task log");
        }
    }
}

/// Per-job execution context handed to every stage.
#[derive(Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub work_dir: PathBuf,
    pub settings: Arc<PipelineSettings>,
    pub runner: Arc<dyn CommandRunner>,
    pub store: Arc<dyn JobStore>,
    pub task_log: Arc<dyn TaskLog>,
}

impl StageContext {
    /// Context for `job` with its directory created and `worker.log` as
    /// the task log.
    pub async fn for_job(
        job: &Job,
        settings: Arc<PipelineSettings>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, StageError> {
        let work_dir = job.work_dir(&settings.upload_dir);
        ensure_dir(&work_dir).await?;
        Ok(Self {
            job_id: job.id,
            task_log: Arc::new(JobLogFile::new(&work_dir)),
            work_dir,
            settings,
            runner,
            store,
        })
    }

    pub async fn job(&self) -> Result<Job, StageError> {
        Ok(self.store.load(self.job_id).await?)
    }

    /// Persist a step transition. Store failures are logged, not raised.
    pub async fn set_step(&self, step: StepName, status: StepStatus) {
        if let Err(e) = self.store.update_step(self.job_id, step, status).await {
            warn!(job_id = %self.job_id, %step, error = %e, "failed to persist step status");
        }
    }

    /// Apply a change to the job document (e.g. a derived input file).
    pub async fn update_job(&self, mutation: JobMutation) -> Result<Job, StageError> {
        Ok(self.store.update(self.job_id, mutation).await?)
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(relative)
    }

    /// Resolve a job-relative input and check it exists.
    pub fn require(&self, relative: impl AsRef<Path>) -> Result<PathBuf, StageError> {
        let path = self.path(relative);
        if path.exists() {
            Ok(path)
        } else {
            Err(StageError::MissingInput(path))
        }
    }

    /// Like [`require`](Self::require) for an optional job field.
    pub fn require_field(&self, value: Option<&str>, field: &str) -> Result<PathBuf, StageError> {
        match value {
            Some(v) if !v.is_empty() => self.require(v),
            _ => Err(StageError::MissingInput(PathBuf::from(format!("<{field} not set>")))),
        }
    }

    pub fn python(&self, script: &str) -> CommandSpec {
        CommandSpec::new(&self.settings.tools.python_bin)
            .arg(self.settings.tools.script(script).display().to_string())
    }

    /// Run one command with output appended to `<log_name>.log` /
    /// `<log_name>_error.log` in `log_dir`, failing on anything but exit 0.
    pub async fn run_logged(
        &self,
        log_dir: &Path,
        log_name: &str,
        spec: &CommandSpec,
    ) -> Result<(), StageError> {
        let log = open_log(log_dir, log_name).await?;
        self.run_into(spec, &log).await
    }

    /// Run one command into an already open log, which fan-out stages share
    /// between tasks.
    pub async fn run_into(&self, spec: &CommandSpec, log: &StageLog) -> Result<(), StageError> {
        let outcome = self.runner.run(spec, log).await?;
        log.flush().await;
        if outcome.success() {
            Ok(())
        } else {
            Err(StageError::from_outcome(spec, outcome, &log.stderr_tail()))
        }
    }

    pub fn step_timeout(&self) -> Duration {
        self.settings.compute.step_timeout()
    }

    pub fn script_timeout(&self) -> Duration {
        self.settings.compute.script_timeout()
    }
}

pub async fn open_log(dir: &Path, name: &str) -> Result<StageLog, StageError> {
    StageLog::open(dir, name)
        .await
        .map_err(StageError::io(dir.join(format!("{name}.log"))))
}

/// Create a directory, accepting that it may already exist from an earlier attempt.
pub async fn ensure_dir(path: &Path) -> Result<(), StageError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(StageError::io(path))
}

/// Write a file via a temporary sibling and rename, so readers never see a
/// partial file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StageError> {
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    tokio::fs::write(&tmp, contents).await.map_err(StageError::io(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(StageError::io(path))
}
