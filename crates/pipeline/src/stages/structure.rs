//! Early stages that derive inputs: coordinates, constraints and the Rg range.

use async_trait::async_trait;
use refinery_core::{Job, MdEngine, RgRange, StepName};
use refinery_exec::settle_all;
use serde::Deserialize;
use tracing::{debug, info};

use crate::context::StageContext;
use crate::engine::{charmm_command, OPENMM_CONSTRAINTS};
use crate::error::StageError;
use crate::stage::Stage;
use crate::stages::Tally;

const PDB2CRD_PSF: &str = "bilbomd_pdb2crd.psf";
const PDB2CRD_CRD: &str = "bilbomd_pdb2crd.crd";
const PDB2CRD_MELD: &str = "pdb2crd_charmm_meld";
const CONST_INP: &str = "const.inp";
const AUTORG_OUTPUT: &str = "autorg_output.json";

/// PDB to CHARMM psf/crd: the script splits chains into CHARMM inputs, each
/// chain is converted, then a meld step joins them.
pub struct Pdb2CrdStage;

#[async_trait]
impl Stage for Pdb2CrdStage {
    fn step(&self) -> StepName {
        StepName::Pdb2crd
    }

    fn label(&self) -> &'static str {
        "PDB2CRD"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let pdb = ctx.require_field(job.pdb_file.as_deref(), "pdb_file")?;

        let script = ctx
            .python("pdb2crd.py")
            .arg(pdb.display().to_string())
            .arg(".")
            .cwd(&ctx.work_dir)
            .timeout(ctx.script_timeout());
        ctx.run_logged(&ctx.work_dir, "pdb2crd-python", &script).await?;

        let chains = chain_inputs(ctx).await?;
        if chains.is_empty() {
            return Err(StageError::MissingInput(ctx.path("pdb2crd_charmm_*.inp")));
        }
        debug!(job_id = %ctx.job_id, chains = chains.len(), "converting chains");

        let limiter = ctx.settings.cpu_limiter();
        let results = settle_all(&limiter, chains, |_, basename: String| async move {
            let spec = charmm_command(ctx, &basename).timeout(ctx.step_timeout());
            ctx.run_logged(&ctx.work_dir, &basename, &spec).await
        })
        .await;
        Tally::of(results).within("pdb2crd", 0.0)?;

        let meld = charmm_command(ctx, PDB2CRD_MELD).timeout(ctx.step_timeout());
        ctx.run_logged(&ctx.work_dir, PDB2CRD_MELD, &meld).await?;

        ctx.require(PDB2CRD_PSF)?;
        ctx.require(PDB2CRD_CRD)?;
        ctx.update_job(Box::new(|job| {
            job.psf_file = Some(PDB2CRD_PSF.to_string());
            job.crd_file = Some(PDB2CRD_CRD.to_string());
        }))
        .await?;

        Ok("PDB2CRD has completed.".into())
    }
}

/// Per-chain CHARMM inputs (`pdb2crd_charmm_*.inp` minus the meld), by basename.
async fn chain_inputs(ctx: &StageContext) -> Result<Vec<String>, StageError> {
    let mut entries = tokio::fs::read_dir(&ctx.work_dir)
        .await
        .map_err(StageError::io(&ctx.work_dir))?;
    let mut chains = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(StageError::io(&ctx.work_dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(base) = name.strip_suffix(".inp") {
            if base.starts_with("pdb2crd_charmm_") && base != PDB2CRD_MELD {
                chains.push(base.to_string());
            }
        }
    }
    chains.sort();
    Ok(chains)
}

/// Predicted-aligned-error matrix to a CHARMM `const.inp` (and, for OpenMM,
/// `openmm_const.yml`).
pub struct PaeStage;

#[async_trait]
impl Stage for PaeStage {
    fn step(&self) -> StepName {
        StepName::Pae
    }

    fn label(&self) -> &'static str {
        "PAE to const.inp"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let pae = ctx.require_field(job.pae_file.as_deref(), "pae_file")?;

        let mut spec = ctx.python("pae2const.py").cwd(&ctx.work_dir).timeout(ctx.script_timeout());
        spec = match job.engine {
            MdEngine::Charmm => {
                let crd = ctx.require_field(job.crd_file.as_deref(), "crd_file")?;
                spec.arg("--crd_file").arg(crd.display().to_string())
            }
            MdEngine::OpenMm => {
                let pdb = ctx.require_field(job.pdb_file.as_deref(), "pdb_file")?;
                spec.arg("--pdb_file")
                    .arg(pdb.display().to_string())
                    .arg("--openmm-const-file")
                    .arg(OPENMM_CONSTRAINTS)
            }
        };
        let spec = spec.arg(pae.display().to_string());
        ctx.run_logged(&ctx.work_dir, "pae2const", &spec).await?;

        ctx.require(CONST_INP)?;
        ctx.update_job(Box::new(|job| job.const_inp_file = Some(CONST_INP.to_string())))
            .await?;
        Ok("PAE to const.inp has completed.".into())
    }
}

#[derive(Debug, Deserialize)]
struct AutoRgOutput {
    rg: f64,
    rg_min: f64,
    rg_max: f64,
}

/// Estimates Rg from the scattering curve and stores the sampling range.
pub struct AutoRgStage;

#[async_trait]
impl Stage for AutoRgStage {
    fn step(&self) -> StepName {
        StepName::Autorg
    }

    fn label(&self) -> &'static str {
        "Calculate Rg"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let data = ctx.require(&job.data_file)?;
        let output = ctx.path(AUTORG_OUTPUT);

        let spec = ctx
            .python("autorg.py")
            .arg(data.display().to_string())
            .arg(output.display().to_string())
            .cwd(&ctx.work_dir)
            .timeout(ctx.script_timeout());
        ctx.run_logged(&ctx.work_dir, "autoRg", &spec).await?;

        let raw = tokio::fs::read_to_string(&output)
            .await
            .map_err(|_| StageError::MissingInput(output.clone()))?;
        let parsed: AutoRgOutput =
            serde_json::from_str(&raw).map_err(|e| StageError::parse("autorg output", e))?;
        let range = rg_range_from(&parsed)?;
        info!(job_id = %ctx.job_id, rg = parsed.rg, rg_min = range.min, rg_max = range.max, "estimated Rg");

        ctx.update_job(Box::new(move |job| job.rg = Some(range))).await?;
        Ok(format!("Calculate Rg completed (Rg {:.1}, range {}-{}).", parsed.rg, range.min, range.max))
    }
}

fn rg_range_from(out: &AutoRgOutput) -> Result<RgRange, StageError> {
    let (min, max) = (out.rg_min.round(), out.rg_max.round());
    if !(min.is_finite() && max.is_finite()) || min < 1.0 || max < min {
        return Err(StageError::parse(
            "autorg output",
            format!("invalid range {}-{}", out.rg_min, out.rg_max),
        ));
    }
    Ok(RgRange::new(min as u32, max as u32))
}
