//! Remote Batch Monitor: polls the scheduler for every active remote job,
//! mirrors what it reports onto the job document and finishes jobs whose
//! batch run completed.

use std::sync::Arc;
use std::time::Duration;

use refinery_core::step::parse_status_line;
use refinery_core::{
    BatchState, Clock, Job, JobStatus, JobStore, RemoteBatchInfo, StepName, StepState,
    StepStatus, SystemClock,
};
use refinery_exec::{run_every, CommandRunner, PeriodicTask};
use refinery_notify::CompletionNotifier;
use refinery_pipeline::{notify_owner, run_stage, PipelineSettings, ResultsStage, StageContext};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{SchedulerClient, SchedulerJobState};
use crate::error::MonitorError;

/// What one pass over the active jobs did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub polled: usize,
    pub errors: usize,
    pub cleaned_up: usize,
}

pub struct RemoteBatchMonitor {
    store: Arc<dyn JobStore>,
    client: Arc<dyn SchedulerClient>,
    settings: Arc<PipelineSettings>,
    runner: Arc<dyn CommandRunner>,
    notifier: Arc<dyn CompletionNotifier>,
    clock: Arc<dyn Clock>,
}

impl RemoteBatchMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn SchedulerClient>,
        settings: Arc<PipelineSettings>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        Self { store, client, settings, runner, notifier, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Poll every active remote job once. A failure on one job is logged
    /// and the pass moves on to the next.
    pub async fn poll_once(&self) -> Result<PollSummary, MonitorError> {
        let jobs = self.store.list_remote_active().await?;
        info!(count = jobs.len(), "polling active remote jobs");

        let mut summary = PollSummary::default();
        for job in jobs {
            summary.polled += 1;
            match self.poll_job(&job).await {
                Ok(true) => summary.cleaned_up += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.errors += 1;
                    error!(job_id = %job.id, error = %e, "remote job poll failed");
                }
            }
        }
        Ok(summary)
    }

    /// Poll one job and act on its state. Returns `true` when this call
    /// completed the job's cleanup.
    pub async fn poll_job(&self, job: &Job) -> Result<bool, MonitorError> {
        let batch_id = match job.remote.as_ref().map(|r| r.external_job_id.trim()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.mark_status_step(job.id, StepStatus::error("Job has no scheduler job id."))
                    .await;
                return Err(MonitorError::MissingBatchId);
            }
        };

        let state = match self.client.job_state(&batch_id).await {
            Ok(state) => state,
            Err(e) => {
                self.mark_status_step(
                    job.id,
                    StepStatus::error(format!("Failed to fetch scheduler job state: {e}")),
                )
                .await;
                return Err(e.into());
            }
        };

        let status_file = match self.client.status_file(job.id).await {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(job_id = %job.id, batch_id = %batch_id, error = %e, "status file unavailable");
                None
            }
        };

        let updated = self.record_poll(job.id, &batch_id, &state, status_file).await?;
        info!(
            job_id = %job.id,
            batch_id = %batch_id,
            state = %state.state,
            progress = updated.progress,
            "remote job polled"
        );

        self.dispatch(&updated, state.state).await
    }

    async fn dispatch(&self, job: &Job, state: BatchState) -> Result<bool, MonitorError> {
        match state {
            BatchState::Completed => self.cleanup(job.id).await,
            BatchState::Failed
            | BatchState::Timeout
            | BatchState::OutOfMemory
            | BatchState::NodeFail
            | BatchState::Preempted => {
                warn!(job_id = %job.id, %state, "remote job failed");
                self.store.update_status(job.id, JobStatus::Failed).await?;
                Ok(false)
            }
            BatchState::Cancelled => {
                info!(job_id = %job.id, "remote job was cancelled");
                self.store.update_status(job.id, JobStatus::Cancelled).await?;
                Ok(false)
            }
            BatchState::Pending => {
                self.store.update_status(job.id, JobStatus::Pending).await?;
                Ok(false)
            }
            BatchState::Running => {
                self.store.update_status(job.id, JobStatus::Running).await?;
                Ok(false)
            }
            BatchState::Suspended => {
                warn!(job_id = %job.id, "remote job is suspended, will poll again");
                Ok(false)
            }
            BatchState::Unknown => {
                error!(job_id = %job.id, "remote job is in an unexpected state");
                Ok(false)
            }
        }
    }

    /// Store the scheduler's view in one atomic update: batch info, the
    /// status step, mirrored step lines and recomputed progress.
    async fn record_poll(
        &self,
        job_id: Uuid,
        batch_id: &str,
        state: &SchedulerJobState,
        status_file: Option<String>,
    ) -> Result<Job, MonitorError> {
        let state = state.clone();
        let batch_id = batch_id.to_string();
        let polled_at = self.clock.now();
        let job = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    let info = job.remote.get_or_insert_with(|| RemoteBatchInfo::new(batch_id));
                    info.state = state.state;
                    info.queue_class = state.qos.clone().or(info.queue_class.take());
                    info.submitted_at = state.submitted_at.or(info.submitted_at);
                    info.started_at = state.started_at.or(info.started_at);
                    info.completed_at = state.completed_at.or(info.completed_at);
                    info.last_polled_at = Some(polled_at);

                    if let Some(text) = status_file {
                        mirror_status_file(job, &text);
                    }
                    job.set_step(
                        StepName::BatchStatus,
                        StepStatus::success(format!("Scheduler job status: {}", state.state)),
                    );
                    let progress = job.progress_from_steps();
                    job.set_progress(progress);
                }),
            )
            .await?;
        Ok(job)
    }

    async fn mark_status_step(&self, job_id: Uuid, status: StepStatus) {
        if let Err(e) = self.store.update_step(job_id, StepName::BatchStatus, status).await {
            warn!(job_id = %job_id, error = %e, "failed to persist scheduler status step");
        }
    }

    /// Finish a job whose batch run completed: copy results back, assemble
    /// them, mark the job Completed and email the owner.
    ///
    /// Guarded by the job's cleanup flag; returns `Ok(false)` without doing
    /// anything when another pass holds it or the job is already Completed.
    pub async fn cleanup(&self, job_id: Uuid) -> Result<bool, MonitorError> {
        if !self.store.try_begin_cleanup(job_id).await? {
            debug!(job_id = %job_id, "cleanup already running or done");
            return Ok(false);
        }
        info!(job_id = %job_id, "remote job completed, starting cleanup");

        let result = self.finish(job_id).await;
        if let Err(e) = &result {
            error!(job_id = %job_id, error = %e, "cleanup failed");
            if let Err(e) = self.store.update_status(job_id, JobStatus::Error).await {
                warn!(job_id = %job_id, error = %e, "failed to persist cleanup failure");
            }
        }
        if let Err(e) = self.store.end_cleanup(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to clear cleanup flag");
        }
        result.map(|_| true)
    }

    async fn finish(&self, job_id: Uuid) -> Result<(), MonitorError> {
        let job = self.store.load(job_id).await?;
        let ctx = StageContext::for_job(
            &job,
            self.settings.clone(),
            self.runner.clone(),
            self.store.clone(),
        )
        .await
        .map_err(MonitorError::Results)?;

        ctx.set_step(
            StepName::CopyResults,
            StepStatus::running("Copying results from scratch to shared storage has started."),
        )
        .await;
        if let Err(e) = self.client.copy_results(job_id).await {
            ctx.set_step(StepName::CopyResults, StepStatus::error(format!("Copying results failed: {e}")))
                .await;
            return Err(e.into());
        }
        let copied = StepStatus::success("Copying results from scratch to shared storage successful.");
        ctx.set_step(StepName::CopyResults, copied.clone()).await;

        let results = run_stage(&ResultsStage, &ctx).await.map_err(MonitorError::Results)?;

        let completed_at = self.clock.now();
        let done = self
            .store
            .update(
                job_id,
                Box::new(move |job| {
                    settle_batch_steps(job);
                    job.complete(
                        vec![(StepName::CopyResults, copied), (StepName::Results, results)],
                        completed_at,
                    );
                }),
            )
            .await?;
        if done.status != JobStatus::Completed {
            let step = done.failing_step().map(|(s, _)| s).unwrap_or(StepName::BatchStatus);
            return Err(MonitorError::Incomplete(step));
        }
        info!(job_id = %job_id, "remote job cleanup completed");

        notify_owner(self.notifier.as_ref(), &self.settings.base_url, &done, false).await;
        Ok(())
    }

    /// Poll on a background task every `period`, first tick one period
    /// from now.
    pub fn spawn(self: Arc<Self>, period: Duration) -> PeriodicTask {
        PeriodicTask::spawn("remote-monitor", period, move |_| {
            let monitor = self.clone();
            async move { monitor.tick().await }
        })
    }

    /// Poll now and then every `period` in the calling task until `shutdown`
    /// is notified.
    pub async fn run_until(&self, period: Duration, shutdown: Arc<Notify>) {
        run_every(period, shutdown, || self.tick()).await;
        info!("remote monitor stopped");
    }

    async fn tick(&self) {
        match self.poll_once().await {
            Ok(summary) if summary.errors > 0 => {
                warn!(polled = summary.polled, errors = summary.errors, "poll pass finished with errors")
            }
            Ok(summary) => debug!(?summary, "poll pass finished"),
            Err(e) => error!(error = %e, "poll pass failed"),
        }
    }
}

/// The scheduler reported the batch run complete, so steps it drove that
/// were never reported back as finished are taken as `Success`. Steps in
/// `Error` stay in `Error`.
fn settle_batch_steps(job: &mut Job) {
    for step in job.topology() {
        let state = job.step(step).map(|st| st.status).unwrap_or_default();
        if matches!(state, StepState::Waiting | StepState::Running)
            && !matches!(step, StepName::CopyResults | StepName::Results)
        {
            job.set_step(step, StepStatus::success("Finished in the scheduler batch run."));
        }
    }
}

/// Apply `<step>: <status>` lines to the job's steps. Only steps in the
/// job's topology are touched; unknown names and states are skipped.
pub fn mirror_status_file(job: &mut Job, text: &str) -> usize {
    let topology = job.topology();
    let mut applied = 0;
    for (step, state) in text.lines().filter_map(parse_status_line) {
        if topology.contains(&step) {
            job.set_step(step, StepStatus { status: state, message: state.to_string() });
            applied += 1;
        }
    }
    applied
}
