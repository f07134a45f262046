//! The Stage trait and the step state machine wrapped around every stage.

use std::time::Duration;

use async_trait::async_trait;
use refinery_core::{Job, StepName, StepStatus};
use refinery_exec::Heartbeat;
use tracing::{error, info};

use crate::context::StageContext;
use crate::error::StageError;

#[async_trait]
pub trait Stage: Send + Sync {
    fn step(&self) -> StepName;

    /// Human-readable name used in step messages.
    fn label(&self) -> &'static str;

    fn heartbeat(&self, ctx: &StageContext) -> Duration {
        ctx.settings.compute.heartbeat()
    }

    /// Do the work. `job` is the document as it was when the stage started.
    /// Returns the success message.
    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError>;
}

/// Drive one stage through `Waiting -> Running -> Success | Error`.
///
/// The `Running` transition is persisted before any process starts and the
/// terminal one before this returns. On success the persisted status is
/// returned so the caller can re-apply it.
pub async fn run_stage(stage: &dyn Stage, ctx: &StageContext) -> Result<StepStatus, StageError> {
    let step = stage.step();
    let job = ctx.job().await?;

    ctx.set_step(step, StepStatus::running(format!("{} has started.", stage.label()))).await;
    ctx.task_log.log(&format!("start {step}")).await;
    info!(job_id = %ctx.job_id, %step, "stage started");

    let heartbeat = {
        let log = ctx.task_log.clone();
        Heartbeat::start(step.as_str(), stage.heartbeat(ctx), move |elapsed| {
            let log = log.clone();
            async move {
                log.log(&format!("{step} still running ({}s)", elapsed.as_secs())).await;
            }
        })
    };

    let result = stage.execute(ctx, &job).await;
    drop(heartbeat);

    match result {
        Ok(message) => {
            let status = StepStatus::success(message);
            ctx.set_step(step, status.clone()).await;
            ctx.task_log.log(&format!("end {step}")).await;
            info!(job_id = %ctx.job_id, %step, "stage succeeded");
            Ok(status)
        }
        Err(e) => {
            ctx.set_step(step, StepStatus::error(e.to_string())).await;
            ctx.task_log.log(&format!("{step} failed: {e}")).await;
            error!(job_id = %ctx.job_id, %step, error = %e, "stage failed");
            Err(e)
        }
    }
}
