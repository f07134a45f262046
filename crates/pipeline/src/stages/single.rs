//! Single-shot stages. Any failure here fails the job attempt.

use std::path::Path;

use async_trait::async_trait;
use refinery_core::{Job, MdEngine, StepName};
use refinery_exec::CommandSpec;

use crate::context::StageContext;
use crate::engine::{
    charmm_command, minimized_pdb, openmm_command, prepare_openmm_config, render_charmm_input,
    CharmmParams,
};
use crate::error::StageError;
use crate::stage::Stage;

/// Render (CHARMM) or configure (OpenMM) and run one engine step.
async fn run_engine_step(
    ctx: &StageContext,
    job: &Job,
    name: &str,
    script: &str,
) -> Result<(), StageError> {
    match job.engine {
        MdEngine::Charmm => {
            ctx.require_field(job.psf_file.as_deref(), "psf_file")?;
            ctx.require_field(job.crd_file.as_deref(), "crd_file")?;
            let params = CharmmParams::for_job(ctx, job, name);
            render_charmm_input(ctx, name, &params).await?;
            let spec = charmm_command(ctx, name).timeout(ctx.step_timeout());
            ctx.run_logged(&ctx.work_dir, name, &spec).await
        }
        MdEngine::OpenMm => {
            ctx.require_field(job.pdb_file.as_deref(), "pdb_file")?;
            prepare_openmm_config(ctx, job).await?;
            let spec = openmm_command(ctx, script).timeout(ctx.step_timeout());
            ctx.run_logged(&ctx.work_dir, name, &spec).await
        }
    }
}

pub struct MinimizeStage;

#[async_trait]
impl Stage for MinimizeStage {
    fn step(&self) -> StepName {
        StepName::Minimize
    }

    fn label(&self) -> &'static str {
        "Minimization"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        run_engine_step(ctx, job, "minimize", "minimize.py").await?;
        ctx.require(minimized_pdb(job.engine))?;
        Ok("Minimization has completed.".into())
    }
}

pub struct HeatStage;

#[async_trait]
impl Stage for HeatStage {
    fn step(&self) -> StepName {
        StepName::Heat
    }

    fn label(&self) -> &'static str {
        "Heating"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        ctx.require(minimized_pdb(job.engine))?;
        run_engine_step(ctx, job, "heat", "heat.py").await?;
        Ok("Heating has completed.".into())
    }
}

/// Scores the minimized structure against the data once, before sampling.
pub struct InitFoxsStage;

#[async_trait]
impl Stage for InitFoxsStage {
    fn step(&self) -> StepName {
        StepName::Initfoxs
    }

    fn label(&self) -> &'static str {
        "Initial FoXS"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let pdb = ctx.require(minimized_pdb(job.engine))?;
        let spec = foxs_command(ctx, &pdb).timeout(ctx.script_timeout());
        ctx.run_logged(&ctx.work_dir, "initfoxs", &spec).await?;

        let curve = format!("{}.dat", pdb.display());
        ctx.require(&curve)?;
        Ok("Initial FoXS has completed.".into())
    }
}

/// `foxs -p <file>` run next to the file so the curve lands beside it.
pub(crate) fn foxs_command(ctx: &StageContext, pdb: &Path) -> CommandSpec {
    let dir = pdb.parent().unwrap_or(&ctx.work_dir);
    let file = pdb
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    CommandSpec::new(&ctx.settings.tools.foxs_bin)
        .arg("-p")
        .arg(file)
        .cwd(dir)
}
