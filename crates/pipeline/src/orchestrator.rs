//! Sequences the stages of one job attempt and owns the job's status.
//!
//! Retries are not handled here. The surrounding harness calls [`Orchestrator::run`]
//! again with a higher attempt number; every attempt starts from the top.

use std::sync::Arc;

use chrono::Utc;
use refinery_core::{
    ExecutionBackend, Job, JobStatus, JobStore, MdEngine, StepName, StepState, StepStatus,
};
use refinery_exec::CommandRunner;
use refinery_notify::CompletionNotifier;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::{PipelineSettings, StageContext, TaskLog};
use crate::error::{PipelineError, StageError};
use crate::movies::render_movies;
use crate::results::ResultsStage;
use crate::stage::{run_stage, Stage};
use crate::stages::{
    AutoRgStage, Dcd2PdbStage, FoxsStage, HeatStage, InitFoxsStage, MdStage, MinimizeStage,
    MultiFoxsStage, PaeStage, Pdb2CrdStage,
};

/// The executor for a step, or `None` for steps driven by the remote scheduler.
pub fn stage_for(step: StepName) -> Option<Box<dyn Stage>> {
    let stage: Box<dyn Stage> = match step {
        StepName::Pdb2crd => Box::new(Pdb2CrdStage),
        StepName::Pae => Box::new(PaeStage),
        StepName::Autorg => Box::new(AutoRgStage),
        StepName::Minimize => Box::new(MinimizeStage),
        StepName::Initfoxs => Box::new(InitFoxsStage),
        StepName::Heat => Box::new(HeatStage),
        StepName::Md => Box::new(MdStage),
        StepName::Dcd2pdb => Box::new(Dcd2PdbStage),
        StepName::Foxs => Box::new(FoxsStage),
        StepName::Multifoxs => Box::new(MultiFoxsStage),
        StepName::Results => Box::new(ResultsStage),
        StepName::PrepareBatch
        | StepName::SubmitBatch
        | StepName::BatchStatus
        | StepName::CopyResults => return None,
    };
    Some(stage)
}

/// Fixed stage list for one job shape, chosen once up front.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn for_job(job: &Job) -> Self {
        Self { stages: job.topology().into_iter().filter_map(stage_for).collect() }
    }

    pub fn steps(&self) -> Vec<StepName> {
        self.stages.iter().map(|s| s.step()).collect()
    }
}

pub struct Orchestrator {
    settings: Arc<PipelineSettings>,
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn CompletionNotifier>,
    max_attempts: u32,
    task_log: Option<Arc<dyn TaskLog>>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<PipelineSettings>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn CompletionNotifier>,
        max_attempts: u32,
    ) -> Self {
        Self { settings, runner, store, notifier, max_attempts: max_attempts.max(1), task_log: None }
    }

    /// Send task-log lines somewhere other than the job's `worker.log`.
    pub fn with_task_log(mut self, log: Arc<dyn TaskLog>) -> Self {
        self.task_log = Some(log);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Build the stage context for a job, creating its directory if needed.
    pub async fn context(&self, job: &Job) -> Result<StageContext, StageError> {
        let mut ctx = StageContext::for_job(
            job,
            self.settings.clone(),
            self.runner.clone(),
            self.store.clone(),
        )
        .await?;
        if let Some(log) = &self.task_log {
            ctx.task_log = log.clone();
        }
        Ok(ctx)
    }

    /// Run one attempt of a local job from the first stage to the last.
    pub async fn run(&self, job_id: Uuid, attempt: u32) -> Result<Job, PipelineError> {
        let job = self.store.load(job_id).await?;
        if job.backend == ExecutionBackend::Remote {
            return Err(PipelineError::RemoteJob(job_id));
        }
        let pipeline = Pipeline::for_job(&job);
        info!(job_id = %job_id, attempt, mode = %job.mode, engine = %job.engine, steps = ?pipeline.steps(), "pipeline attempt started");

        let ctx = match self.context(&job).await {
            Ok(ctx) => ctx,
            Err(e) => {
                let first = pipeline.steps().first().copied().unwrap_or(StepName::Results);
                return Err(self.fail(&job, None, first, e, attempt).await);
            }
        };

        self.store
            .update(
                job_id,
                Box::new(|job| {
                    job.reset_steps();
                    job.status = JobStatus::Running;
                    job.progress = 0;
                    job.started_at = Some(Utc::now());
                    job.completed_at = None;
                }),
            )
            .await?;
        ctx.task_log.log(&format!("attempt {attempt} of {} started", self.max_attempts)).await;

        let mut reached = Vec::with_capacity(pipeline.stages.len());
        for stage in &pipeline.stages {
            let step = stage.step();
            match run_stage(stage.as_ref(), &ctx).await {
                Ok(status) => reached.push((step, status)),
                Err(e) => return Err(self.fail(&job, Some(&ctx), step, e, attempt).await),
            }
            if step == StepName::Md && job.engine == MdEngine::OpenMm {
                let movies = render_movies(&ctx).await;
                if movies.failed > 0 {
                    warn!(job_id = %job_id, failed = movies.failed, rendered = movies.rendered, "some trajectory movies failed");
                }
            }
            if let Err(e) = self.store.update_progress(job_id, step.milestone()).await {
                warn!(job_id = %job_id, %step, error = %e, "failed to persist progress");
            }
        }

        let done = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    job.complete(reached, Utc::now());
                }),
            )
            .await?;
        if done.status != JobStatus::Completed {
            let step = done.failing_step().map(|(s, _)| s).unwrap_or(StepName::Results);
            error!(job_id = %job_id, %step, attempt, "pipeline finished with a step not in Success");
            ctx.task_log.log(&format!("attempt {attempt} of {} did not complete: {step}", self.max_attempts)).await;
            if attempt >= self.max_attempts {
                self.notify(&done, true).await;
            }
            return Err(PipelineError::Incomplete { step });
        }
        ctx.task_log.log("pipeline completed").await;
        info!(job_id = %job_id, attempt, "pipeline completed");

        self.notify(&done, false).await;
        Ok(done)
    }

    /// Record a failed attempt: the job and the failing step go to `Error`,
    /// the task log gets the details and, on the last attempt, the owner is
    /// emailed.
    async fn fail(
        &self,
        job: &Job,
        ctx: Option<&StageContext>,
        step: StepName,
        err: StageError,
        attempt: u32,
    ) -> PipelineError {
        let message = err.to_string();
        error!(job_id = %job.id, %step, attempt, error = %message, "pipeline attempt failed");

        let step_message = message.clone();
        let updated = self
            .store
            .update(
                job.id,
                Box::new(move |job| {
                    job.status = JobStatus::Error;
                    if job.step(step).map(|s| s.status) != Some(StepState::Error) {
                        job.set_step(step, StepStatus::error(step_message));
                    }
                }),
            )
            .await;
        let failed = match updated {
            Ok(failed) => failed,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to persist job failure");
                let mut failed = job.clone();
                failed.status = JobStatus::Error;
                failed.set_step(step, StepStatus::error(message.clone()));
                failed
            }
        };

        if let Some(ctx) = ctx {
            ctx.task_log
                .log(&format!(
                    "attempt {attempt} of {} failed at {step}: {message}",
                    self.max_attempts
                ))
                .await;
        }

        if attempt >= self.max_attempts {
            self.notify(&failed, true).await;
        } else {
            info!(job_id = %job.id, attempt, max_attempts = self.max_attempts, "failure email deferred to final attempt");
        }

        PipelineError::Stage { step, source: err }
    }

    async fn notify(&self, job: &Job, is_failure: bool) {
        notify_owner(self.notifier.as_ref(), &self.settings.base_url, job, is_failure).await;
    }
}

/// Email the job owner, if there is one. Delivery failure is only logged.
pub async fn notify_owner(
    notifier: &dyn CompletionNotifier,
    base_url: &str,
    job: &Job,
    is_failure: bool,
) {
    let Some(recipient) = job.owner_email.as_deref() else {
        return;
    };
    let job_id = job.id.to_string();
    let sent = if is_failure {
        let step = job.failing_step().map(|(step, _)| step.to_string());
        notifier
            .send_failure_email(recipient, base_url, &job_id, &job.title, step.as_deref())
            .await
    } else {
        notifier
            .send_completion_email(recipient, base_url, &job_id, &job.title, false)
            .await
    };
    if let Err(e) = sent {
        warn!(job_id = %job.id, is_failure, error = %e, "completion email failed");
    }
}
