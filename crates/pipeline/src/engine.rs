//! MD engine specifics: CHARMM input templates and the OpenMM run config.
//!
//! CHARMM reads one `.inp` script per invocation, rendered from a minijinja
//! template in the configured template directory (`<name>.tmpl`). OpenMM
//! scripts share a single `openmm_config.yaml` in the job directory.

use std::path::Path;

use refinery_core::{Job, MdEngine};
use refinery_exec::CommandSpec;
use serde::{Deserialize, Serialize};

use crate::context::{write_atomic, StageContext};
use crate::error::StageError;

pub const OPENMM_CONFIG: &str = "openmm_config.yaml";
pub const OPENMM_CONSTRAINTS: &str = "openmm_const.yml";

/// Minimized structure, relative to the job directory.
pub fn minimized_pdb(engine: MdEngine) -> &'static str {
    match engine {
        MdEngine::Charmm => "minimization_output.pdb",
        MdEngine::OpenMm => "minimize/minimized.pdb",
    }
}

// ── CHARMM ────────────────────────────────────────────────────

/// Values visible to CHARMM templates. Absent fields render as `none`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CharmmParams {
    pub topology: String,
    pub in_psf_file: String,
    pub in_crd_file: String,
    pub constinp: String,
    pub inp_basename: String,
    pub rg: Option<u32>,
    pub rg_min: u32,
    pub rg_max: u32,
    pub conf_sample: u32,
    pub run: Option<u32>,
    pub timestep: f64,
    pub pdb_file: Option<String>,
    pub foxs_dir: Option<String>,
}

impl CharmmParams {
    pub fn for_job(ctx: &StageContext, job: &Job, basename: &str) -> Self {
        let range = job.rg_range();
        Self {
            topology: ctx.settings.tools.charmm_topology.display().to_string(),
            in_psf_file: job.psf_file.clone().unwrap_or_default(),
            in_crd_file: job.crd_file.clone().unwrap_or_default(),
            constinp: job.const_inp_file.clone().unwrap_or_default(),
            inp_basename: basename.to_string(),
            rg: None,
            rg_min: range.min,
            rg_max: range.max,
            conf_sample: job.conformational_sampling,
            run: None,
            timestep: 0.001,
            pdb_file: job.pdb_file.clone(),
            foxs_dir: None,
        }
    }
}

/// Render `<template>.tmpl` into `<work_dir>/<basename>.inp`.
pub async fn render_charmm_input(
    ctx: &StageContext,
    template: &str,
    params: &CharmmParams,
) -> Result<String, StageError> {
    let template_path = ctx.settings.tools.charmm_templates.join(format!("{template}.tmpl"));
    let source = tokio::fs::read_to_string(&template_path)
        .await
        .map_err(|_| StageError::MissingInput(template_path.clone()))?;

    let rendered = render_template(&source, params)?;
    let inp = format!("{}.inp", params.inp_basename);
    write_atomic(&ctx.path(&inp), rendered.as_bytes()).await?;
    Ok(inp)
}

pub fn render_template<S: Serialize>(source: &str, params: &S) -> Result<String, StageError> {
    let env = minijinja::Environment::new();
    Ok(env.render_str(source, params)?)
}

/// `charmm -o <basename>.out -i <basename>.inp` in the job directory.
pub fn charmm_command(ctx: &StageContext, basename: &str) -> CommandSpec {
    CommandSpec::new(&ctx.settings.tools.charmm_bin)
        .args(["-o".to_string(), format!("{basename}.out"), "-i".to_string(), format!("{basename}.inp")])
        .cwd(&ctx.work_dir)
}

// ── OpenMM ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenMmConfig {
    pub input: OpenMmInput,
    pub output: OpenMmOutput,
    pub steps: OpenMmSteps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenMmInput {
    pub dir: String,
    pub pdb_file: String,
    pub forcefield: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenMmOutput {
    pub output_dir: String,
    pub min_dir: String,
    pub heat_dir: String,
    pub md_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenMmSteps {
    pub minimization: Minimization,
    pub heating: Heating,
    pub md: MolecularDynamics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minimization {
    pub max_iterations: u32,
    pub output_pdb: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heating {
    pub first_temp: u32,
    pub final_temp: u32,
    pub total_steps: u32,
    pub timestep: f64,
    pub output_pdb: String,
    pub output_restart: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MolecularDynamics {
    pub temperature: u32,
    pub friction: f64,
    pub nsteps: u32,
    pub timestep: f64,
    pub rgyr: Rgyr,
    pub output_pdb: String,
    pub output_restart: String,
    pub output_dcd: String,
    pub pdb_report_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rgyr {
    pub rgs: Vec<u32>,
    pub k_rg: u32,
    pub report_interval: u32,
    pub filename: String,
}

impl OpenMmConfig {
    pub fn for_job(job: &Job, work_dir: &Path) -> Self {
        let dir = work_dir.display().to_string();
        Self {
            input: OpenMmInput {
                dir: dir.clone(),
                pdb_file: job.pdb_file.clone().unwrap_or_default(),
                forcefield: vec!["charmm36.xml".into(), "implicit/hct.xml".into()],
            },
            output: OpenMmOutput {
                output_dir: dir,
                min_dir: "minimize".into(),
                heat_dir: "heat".into(),
                md_dir: "md".into(),
            },
            steps: OpenMmSteps {
                minimization: Minimization { max_iterations: 1000, output_pdb: "minimized.pdb".into() },
                heating: Heating {
                    first_temp: 300,
                    final_temp: 600,
                    total_steps: 10000,
                    timestep: 0.001,
                    output_pdb: "heated.pdb".into(),
                    output_restart: "heated.xml".into(),
                },
                md: MolecularDynamics {
                    temperature: 600,
                    friction: 0.1,
                    nsteps: 10000,
                    timestep: 0.001,
                    rgyr: Rgyr {
                        rgs: job.rg_range().windows(),
                        k_rg: 10,
                        report_interval: 1000,
                        filename: "rgyr.csv".into(),
                    },
                    output_pdb: "md.pdb".into(),
                    output_restart: "md.xml".into(),
                    output_dcd: "md.dcd".into(),
                    pdb_report_interval: 100,
                },
            },
            constraints: None,
        }
    }
}

/// Write `openmm_config.yaml` for the job, folding in `openmm_const.yml`
/// constraints when constraint inference produced them. Rewritten on every
/// call so a retry picks up a changed Rg range.
pub async fn prepare_openmm_config(ctx: &StageContext, job: &Job) -> Result<OpenMmConfig, StageError> {
    let mut cfg = OpenMmConfig::for_job(job, &ctx.work_dir);

    let const_path = ctx.path(OPENMM_CONSTRAINTS);
    if let Ok(raw) = tokio::fs::read_to_string(&const_path).await {
        match serde_yaml::from_str::<serde_yaml::Value>(&raw) {
            Ok(doc) => cfg.constraints = doc.get("constraints").cloned(),
            Err(e) => {
                tracing::warn!(path = %const_path.display(), error = %e, "ignoring unreadable OpenMM constraints");
            }
        }
    }

    let yaml = serde_yaml::to_string(&cfg).map_err(|e| StageError::parse("openmm config", e))?;
    write_atomic(&ctx.path(OPENMM_CONFIG), yaml.as_bytes()).await?;
    Ok(cfg)
}

/// `python <script> openmm_config.yaml` in the job directory.
pub fn openmm_command(ctx: &StageContext, script: &str) -> CommandSpec {
    ctx.python(&format!("openmm/{script}"))
        .arg(ctx.path(OPENMM_CONFIG).display().to_string())
        .cwd(&ctx.work_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;
    use refinery_core::JobMode;
    use refinery_exec::testing::ScriptedRunner;

    #[test]
    fn template_renders_params() {
        let params = CharmmParams { rg: Some(26), inp_basename: "dynamics_rg26".into(), ..Default::default() };
        let out = render_template("set rg = {{ rg }}\n! {{ inp_basename }}", &params).unwrap();
        assert_eq!(out, "set rg = 26\n! dynamics_rg26");
    }

    #[test]
    fn broken_template_is_template_error() {
        let err = render_template("{% if %}", &CharmmParams::default()).unwrap_err();
        assert!(matches!(err, StageError::Template(_)));
    }

    #[tokio::test]
    async fn openmm_config_carries_rg_windows_and_constraints() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Pdb, MdEngine::OpenMm);
        let ctx = test_support::context(
            root.path(),
            &job,
            ScriptedRunner::succeeding(),
            test_support::settings(root.path(), 1, 1),
        )
        .await;
        std::fs::write(
            ctx.path(OPENMM_CONSTRAINTS),
            "constraints:\n  fixed_bodies:\n    - name: core\n",
        )
        .unwrap();

        let cfg = prepare_openmm_config(&ctx, &job).await.unwrap();
        assert_eq!(cfg.steps.md.rgyr.rgs, vec![20, 26, 32, 38, 44, 50]);
        assert!(cfg.constraints.is_some());

        let written: OpenMmConfig =
            serde_yaml::from_str(&std::fs::read_to_string(ctx.path(OPENMM_CONFIG)).unwrap()).unwrap();
        assert_eq!(written, cfg);
    }

    #[tokio::test]
    async fn charmm_input_is_written_next_to_job() {
        let root = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        std::fs::write(templates.path().join("minimize.tmpl"), "read psf card name {{ in_psf_file }}\n").unwrap();

        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let mut settings = test_support::settings(root.path(), 0, 1);
        settings.tools.charmm_templates = templates.path().to_path_buf();
        let ctx = test_support::context(root.path(), &job, ScriptedRunner::succeeding(), settings).await;

        let params = CharmmParams::for_job(&ctx, &job, "minimize");
        let inp = render_charmm_input(&ctx, "minimize", &params).await.unwrap();
        assert_eq!(inp, "minimize.inp");
        assert_eq!(std::fs::read_to_string(ctx.path(inp)).unwrap(), "read psf card name input.psf\n");
    }

    #[tokio::test]
    async fn missing_template_is_missing_input() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let mut settings = test_support::settings(root.path(), 0, 1);
        settings.tools.charmm_templates = root.path().join("nope");
        let ctx = test_support::context(root.path(), &job, ScriptedRunner::succeeding(), settings).await;

        let err = render_charmm_input(&ctx, "heat", &CharmmParams::for_job(&ctx, &job, "heat"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingInput(_)));
    }
}
