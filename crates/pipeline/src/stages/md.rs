//! Rg-restrained sampling and, for CHARMM, frame extraction.
//!
//! Both fan out under a limiter and settle every task before judging the
//! stage, so the error message can list every failed window.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use refinery_core::{Job, MdEngine, StepName, StepStatus};
use refinery_exec::{settle_all, ConcurrencyLimiter};
use tracing::{info, warn};

use crate::context::{ensure_dir, StageContext};
use crate::engine::{
    charmm_command, openmm_command, prepare_openmm_config, render_charmm_input, CharmmParams,
};
use crate::error::StageError;
use crate::stage::Stage;
use crate::stages::Tally;

/// Environment variable the OpenMM MD script reads its Rg target from.
pub const RG_ENV: &str = "OMM_RG";

pub struct MdStage;

#[async_trait]
impl Stage for MdStage {
    fn step(&self) -> StepName {
        StepName::Md
    }

    fn label(&self) -> &'static str {
        "Molecular Dynamics"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let windows = rg_windows(job)?;
        let total = windows.len();
        let done = AtomicUsize::new(0);
        info!(job_id = %ctx.job_id, engine = %job.engine, windows = total, "starting MD fan-out");

        let results = match job.engine {
            MdEngine::OpenMm => {
                ctx.require_field(job.pdb_file.as_deref(), "pdb_file")?;
                prepare_openmm_config(ctx, job).await?;
                let gpus = &ctx.settings.gpus;
                let limiter = gpus.limiter();
                settle_all(&limiter, windows, |index, rg: u32| {
                    let done = &done;
                    async move {
                        let mut spec = openmm_command(ctx, "md.py")
                            .env(RG_ENV, rg.to_string())
                            .timeout(ctx.settings.compute.md_timeout());
                        let gpu = gpus.bind(index, &mut spec);
                        info!(job_id = %ctx.job_id, rg, gpu = gpu.as_deref().unwrap_or("cpu"), "MD window started");
                        let result = ctx.run_logged(&ctx.work_dir, &format!("md_rg{rg}"), &spec).await;
                        report(ctx, StepName::Md, done, total).await;
                        result.map_err(|e| window_error(rg, e))
                    }
                })
                .await
            }
            MdEngine::Charmm => {
                ctx.require_field(job.psf_file.as_deref(), "psf_file")?;
                let mut basenames = Vec::with_capacity(total);
                for &rg in &windows {
                    let basename = format!("dynamics_rg{rg}");
                    let mut params = CharmmParams::for_job(ctx, job, &basename);
                    params.rg = Some(rg);
                    render_charmm_input(ctx, "dynamics", &params).await?;
                    basenames.push((rg, basename));
                }
                let limiter = ctx.settings.cpu_limiter();
                settle_all(&limiter, basenames, |_, (rg, basename): (u32, String)| {
                    let done = &done;
                    async move {
                        let spec = charmm_command(ctx, &basename).timeout(ctx.settings.compute.md_timeout());
                        let result = ctx.run_logged(&ctx.work_dir, &basename, &spec).await;
                        report(ctx, StepName::Md, done, total).await;
                        result.map_err(|e| window_error(rg, e))
                    }
                })
                .await
            }
        };

        let tally = Tally::of(results);
        tally.within("MD", ctx.settings.compute.md_failure_threshold)?;
        if !tally.failures.is_empty() {
            warn!(job_id = %ctx.job_id, failed = tally.failures.len(), total, "MD windows failed within threshold");
            ctx.task_log
                .log(&format!("md: {} of {} windows failed: {}", tally.failures.len(), total, tally.messages()))
                .await;
        }
        Ok(format!("Molecular Dynamics has completed ({} of {} Rg windows).", tally.succeeded, total))
    }
}

/// Pulls PDB frames out of each CHARMM trajectory into `foxs/rg<N>/`.
pub struct Dcd2PdbStage;

#[async_trait]
impl Stage for Dcd2PdbStage {
    fn step(&self) -> StepName {
        StepName::Dcd2pdb
    }

    fn label(&self) -> &'static str {
        "Extract PDBs from DCD"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let runs = job.conformational_sampling.max(1);
        let mut tasks = Vec::new();
        for rg in rg_windows(job)? {
            let foxs_dir = format!("foxs/rg{rg}");
            ensure_dir(&ctx.path(&foxs_dir)).await?;
            for run in 1..=runs {
                let basename = format!("dcd2pdb_rg{rg}_run{run}");
                let mut params = CharmmParams::for_job(ctx, job, &basename);
                params.rg = Some(rg);
                params.run = Some(run);
                params.foxs_dir = Some(foxs_dir.clone());
                render_charmm_input(ctx, "dcd2pdb", &params).await?;
                tasks.push(basename);
            }
        }

        let total = tasks.len();
        let done = AtomicUsize::new(0);
        let limiter: ConcurrencyLimiter = ctx.settings.cpu_limiter();
        let results = settle_all(&limiter, tasks, |_, basename: String| {
            let done = &done;
            async move {
                let spec = charmm_command(ctx, &basename).timeout(ctx.step_timeout());
                let result = ctx.run_logged(&ctx.work_dir, &basename, &spec).await;
                report(ctx, StepName::Dcd2pdb, done, total).await;
                result
            }
        })
        .await;

        let tally = Tally::of(results);
        tally.within("dcd2pdb", ctx.settings.compute.md_failure_threshold)?;
        Ok(format!("Extract PDBs from DCD has completed ({} of {} trajectories).", tally.succeeded, total))
    }
}

/// The job's Rg windows; an empty set is an input error.
fn rg_windows(job: &Job) -> Result<Vec<u32>, StageError> {
    let range = job.rg_range();
    let windows = range.windows();
    if windows.is_empty() {
        return Err(StageError::EmptyRgRange { min: range.min, max: range.max });
    }
    Ok(windows)
}

fn window_error(rg: u32, err: StageError) -> StageError {
    match err {
        StageError::NonZeroExit { program, outcome, detail } => StageError::NonZeroExit {
            program: format!("{program} (rg {rg})"),
            outcome,
            detail,
        },
        StageError::TimedOut { program } => StageError::TimedOut { program: format!("{program} (rg {rg})") },
        other => other,
    }
}

async fn report(ctx: &StageContext, step: StepName, done: &AtomicUsize, total: usize) {
    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
    let label = step.as_str().to_uppercase();
    ctx.set_step(step, StepStatus::running(format!("{label}: {n} of {total} tasks finished.")))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;
    use refinery_core::{JobMode, StepState};
    use refinery_exec::testing::{Scripted, ScriptedRunner};
    use refinery_exec::allocator::DEVICE_ENV;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn openmm_windows_round_robin_over_gpus() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Pdb, MdEngine::OpenMm);
        let runner = ScriptedRunner::new(|_| Scripted::ok().after(Duration::from_secs(60)));
        let ctx = test_support::context(root.path(), &job, runner.clone(), test_support::settings(root.path(), 2, 8)).await;
        std::fs::write(ctx.path("input.pdb"), "ATOM\n").unwrap();

        MdStage.execute(&ctx, &job).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 6);
        for call in &calls {
            let rg: usize = call.env_value(RG_ENV).unwrap().parse().unwrap();
            let index = (rg - 20) / 6;
            let expected = (index % 2).to_string();
            assert_eq!(call.env_value(DEVICE_ENV), Some(expected.as_str()));
        }
        assert!(runner.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn any_failed_window_fails_by_default() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Pdb, MdEngine::OpenMm);
        let runner = ScriptedRunner::new(|spec| {
            if spec.env_value(RG_ENV) == Some("32") {
                Scripted::exit(1).with_stderr("NaN in coordinates")
            } else {
                Scripted::ok()
            }
        });
        let ctx = test_support::context(root.path(), &job, runner.clone(), test_support::settings(root.path(), 1, 1)).await;
        std::fs::write(ctx.path("input.pdb"), "ATOM\n").unwrap();

        let err = MdStage.execute(&ctx, &job).await.unwrap_err();
        match err {
            StageError::TooManyFailures { failed, total, messages, .. } => {
                assert_eq!((failed, total), (1, 6));
                assert!(messages.contains("rg 32"));
                assert!(messages.contains("NaN"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runner.calls().len(), 6);
    }

    #[tokio::test]
    async fn threshold_tolerates_some_failed_windows() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Pdb, MdEngine::OpenMm);
        let runner = ScriptedRunner::new(|spec| {
            if spec.env_value(RG_ENV) == Some("50") { Scripted::exit(1) } else { Scripted::ok() }
        });
        let mut settings = test_support::settings(root.path(), 1, 1);
        settings.compute.md_failure_threshold = 0.2;
        let ctx = test_support::context(root.path(), &job, runner, settings).await;
        std::fs::write(ctx.path("input.pdb"), "ATOM\n").unwrap();

        let msg = MdStage.execute(&ctx, &job).await.unwrap();
        assert!(msg.contains("5 of 6"));
    }

    #[tokio::test]
    async fn inverted_rg_range_fails_before_fan_out() {
        let root = tempfile::tempdir().unwrap();
        let mut job = test_support::job(JobMode::Pdb, MdEngine::OpenMm);
        job.rg = Some(refinery_core::RgRange::new(60, 20));
        let runner = ScriptedRunner::succeeding();
        let ctx = test_support::context(root.path(), &job, runner.clone(), test_support::settings(root.path(), 1, 1)).await;
        std::fs::write(ctx.path("input.pdb"), "ATOM\n").unwrap();

        let err = MdStage.execute(&ctx, &job).await.unwrap_err();
        assert!(matches!(err, StageError::EmptyRgRange { min: 60, max: 20 }));
        assert!(runner.calls().is_empty());

        let mut charmm = test_support::job(JobMode::Crd, MdEngine::Charmm);
        charmm.rg = Some(refinery_core::RgRange::new(60, 20));
        let err = Dcd2PdbStage.execute(&ctx, &charmm).await.unwrap_err();
        assert!(matches!(err, StageError::EmptyRgRange { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn progress_messages_are_persisted() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Pdb, MdEngine::OpenMm);
        let ctx = test_support::context(root.path(), &job, ScriptedRunner::succeeding(), test_support::settings(root.path(), 1, 1)).await;
        std::fs::write(ctx.path("input.pdb"), "ATOM\n").unwrap();

        MdStage.execute(&ctx, &job).await.unwrap();

        let saved = ctx.job().await.unwrap();
        let md = saved.step(StepName::Md).unwrap();
        assert_eq!(md.status, StepState::Running);
        assert_eq!(md.message, "MD: 6 of 6 tasks finished.");
    }

    #[tokio::test]
    async fn dcd2pdb_fans_out_per_window_and_run() {
        let root = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        std::fs::write(templates.path().join("dcd2pdb.tmpl"), "! rg {{ rg }} run {{ run }} -> {{ foxs_dir }}\n").unwrap();
        let mut job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        job.conformational_sampling = 2;
        let runner = ScriptedRunner::succeeding();
        let mut settings = test_support::settings(root.path(), 0, 3);
        settings.tools.charmm_templates = templates.path().to_path_buf();
        let ctx = test_support::context(root.path(), &job, runner.clone(), settings).await;

        Dcd2PdbStage.execute(&ctx, &job).await.unwrap();

        assert_eq!(runner.calls_to("charmm").len(), 12);
        assert!(runner.peak_in_flight() <= 3);
        assert!(ctx.path("foxs/rg44").is_dir());
        let inp = std::fs::read_to_string(ctx.path("dcd2pdb_rg26_run2.inp")).unwrap();
        assert_eq!(inp, "! rg 26 run 2 -> foxs/rg26\n");
    }
}
