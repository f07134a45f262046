//! Results assembly: the last pipeline stage.
//!
//! Everything here is best effort except the archive. Missing copies,
//! failed analyses and an unreadable README are logged and the stage goes
//! on; a failed `tar` fails the stage.

pub mod assembly;
mod readme;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{
    ExecutionBackend, Job, JobMode, JobStatus, MdEngine, RgRange, StepName, Steps,
};
use refinery_exec::CommandSpec;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::{ensure_dir, open_log, write_atomic, StageContext};
use crate::engine::{minimized_pdb, OPENMM_CONFIG, OPENMM_CONSTRAINTS};
use crate::error::StageError;
use crate::stage::Stage;
use crate::stages::{MULTIFOXS_DIR, MULTIFOXS_LOG};

pub use assembly::{assemble_ensembles, concatenate_models, count_ensembles, to_model_block};
pub use readme::render_readme;

pub const RESULTS_DIR: &str = "results";
const SUMMARY_FILE: &str = "bilbomd_job.json";
const FEEDBACK_FILE: &str = "feedback.json";

pub fn archive_name(job: &Job) -> String {
    format!("results-{}.tar.gz", job.short_id())
}

pub struct ResultsStage;

#[async_trait]
impl Stage for ResultsStage {
    fn step(&self) -> StepName {
        StepName::Results
    }

    fn label(&self) -> &'static str {
        "Gather Results"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let results = ctx.path(RESULTS_DIR);
        ensure_dir(&results).await?;
        let multifoxs = ctx.path(MULTIFOXS_DIR);

        // Minimized structure and its curve.
        let minimized = minimized_pdb(job.engine);
        copy_best_effort(&ctx.path(minimized), &results).await;
        copy_best_effort(&ctx.path(format!("{minimized}.dat")), &results).await;

        // MultiFoXS listings and fitted curves.
        for file in matching_files(&multifoxs, |name| {
            (name.starts_with("ensembles_size_") && name.ends_with(".txt"))
                || (name.starts_with("multi_state_model_") && name.ends_with("_1_1.dat"))
        })
        .await
        {
            copy_best_effort(&file, &results).await;
        }

        for input in input_files(job) {
            copy_best_effort(&ctx.path(input), &results).await;
        }

        let log = multifoxs.join(format!("{MULTIFOXS_LOG}.log"));
        let ensembles = match tokio::fs::read_to_string(&log).await {
            Ok(text) => count_ensembles(&text),
            Err(e) => {
                warn!(job_id = %ctx.job_id, file = %log.display(), error = %e, "no MultiFoXS log, no ensembles");
                0
            }
        };
        let assembled = assemble_ensembles(&multifoxs, &results, ensembles).await;
        info!(job_id = %ctx.job_id, ensembles, assembled, "ensemble models assembled");

        if let Err(e) = write_summary(&results, job, ensembles).await {
            warn!(job_id = %ctx.job_id, error = %e, "could not write job summary");
        }

        let feedback = run_feedback(ctx, &results).await;
        if let Some(value) = feedback.clone() {
            if let Err(e) = ctx.update_job(Box::new(move |job| job.feedback = Some(value))).await {
                warn!(job_id = %ctx.job_id, error = %e, "could not store feedback");
            }
        }

        let rgyr = ctx.python("rgyr_v_dmax.py").arg(ctx.work_dir.display().to_string())
            .cwd(&ctx.work_dir)
            .timeout(ctx.script_timeout());
        if let Err(e) = ctx.run_logged(&ctx.work_dir, "rgyr_v_dmax", &rgyr).await {
            warn!(job_id = %ctx.job_id, error = %e, "Rg vs Dmax analysis failed");
            ctx.task_log.log(&format!("warning: rgyr_v_dmax failed: {e}")).await;
        }

        let mut readme_job = job.clone();
        readme_job.feedback = feedback;
        let readme_minimized = Path::new(minimized)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| minimized.to_string());
        match render_readme(&readme_job, ensembles, &readme_minimized, Utc::now()) {
            Ok(text) => {
                if let Err(e) = write_atomic(&results.join("README.md"), text.as_bytes()).await {
                    warn!(job_id = %ctx.job_id, error = %e, "could not write README");
                }
            }
            Err(e) => warn!(job_id = %ctx.job_id, error = %e, "could not render README"),
        }

        let archive = archive_name(job);
        create_archive(ctx, &archive).await?;
        Ok(format!("Results archive {archive} is ready ({ensembles} ensembles)."))
    }
}

/// Inputs worth shipping, relative to the job directory.
fn input_files(job: &Job) -> Vec<String> {
    let mut files = vec![job.data_file.clone()];
    files.extend(
        [&job.pdb_file, &job.psf_file, &job.crd_file, &job.pae_file, &job.const_inp_file]
            .into_iter()
            .flatten()
            .cloned(),
    );
    if job.engine == MdEngine::OpenMm {
        files.push(OPENMM_CONSTRAINTS.to_string());
        files.push(OPENMM_CONFIG.to_string());
    }
    files
}

async fn matching_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if keep(&entry.file_name().to_string_lossy()) {
            out.push(entry.path());
        }
    }
    out.sort();
    out
}

async fn copy_best_effort(src: &Path, dest_dir: &Path) {
    let Some(name) = src.file_name() else { return };
    if let Err(e) = tokio::fs::copy(src, dest_dir.join(name)).await {
        warn!(file = %src.display(), error = %e, "could not copy into results");
    }
}

/// Job fields safe to hand back to the user.
#[derive(Debug, Serialize)]
struct JobSummary<'a> {
    id: Uuid,
    title: &'a str,
    mode: JobMode,
    engine: MdEngine,
    backend: ExecutionBackend,
    status: JobStatus,
    data_file: &'a str,
    pdb_file: Option<&'a str>,
    psf_file: Option<&'a str>,
    crd_file: Option<&'a str>,
    const_inp_file: Option<&'a str>,
    pae_file: Option<&'a str>,
    rg: RgRange,
    conformational_sampling: u32,
    steps: &'a Steps,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ensembles: usize,
}

async fn write_summary(results: &Path, job: &Job, ensembles: usize) -> Result<(), StageError> {
    let summary = JobSummary {
        id: job.id,
        title: &job.title,
        mode: job.mode,
        engine: job.engine,
        backend: job.backend,
        status: job.status,
        data_file: &job.data_file,
        pdb_file: job.pdb_file.as_deref(),
        psf_file: job.psf_file.as_deref(),
        crd_file: job.crd_file.as_deref(),
        const_inp_file: job.const_inp_file.as_deref(),
        pae_file: job.pae_file.as_deref(),
        rg: job.rg_range(),
        conformational_sampling: job.conformational_sampling,
        steps: &job.steps,
        submitted_at: job.submitted_at,
        started_at: job.started_at,
        ensembles,
    };
    let json = serde_json::to_vec_pretty(&summary).map_err(|e| StageError::parse("job summary", e))?;
    write_atomic(&results.join(SUMMARY_FILE), &json).await
}

/// Run the decision-tree analysis and read back its `feedback.json`.
async fn run_feedback(ctx: &StageContext, results: &Path) -> Option<serde_json::Value> {
    let spec = ctx
        .python("pipeline_decision_tree.py")
        .arg(results.display().to_string())
        .cwd(&ctx.work_dir)
        .timeout(ctx.script_timeout());
    if let Err(e) = ctx.run_logged(&ctx.work_dir, "feedback", &spec).await {
        warn!(job_id = %ctx.job_id, error = %e, "feedback analysis failed");
        ctx.task_log.log(&format!("warning: feedback analysis failed: {e}")).await;
        return None;
    }
    let path = results.join(FEEDBACK_FILE);
    let raw = match tokio::fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(job_id = %ctx.job_id, file = %path.display(), error = %e, "feedback analysis wrote no output");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(job_id = %ctx.job_id, error = %e, "feedback output is not JSON");
            None
        }
    }
}

/// `tar czf results-<id>.tar.gz results` in the job directory.
async fn create_archive(ctx: &StageContext, archive: &str) -> Result<(), StageError> {
    let spec = CommandSpec::new(&ctx.settings.tools.tar_bin)
        .args(["czf", archive, RESULTS_DIR])
        .cwd(&ctx.work_dir)
        .timeout(ctx.step_timeout());
    let log = open_log(&ctx.work_dir, "results").await?;
    ctx.run_into(&spec, &log)
        .await
        .map_err(|e| StageError::Archive(e.to_string()))?;
    let path = ctx.path(archive);
    if !path.exists() {
        return Err(StageError::Archive(format!("{} was not created", path.display())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;
    use refinery_exec::testing::{Scripted, ScriptedRunner};

    fn seed_job_dir(dir: &Path) {
        std::fs::write(dir.join("saxs.dat"), "0.01 1 0.1\n").unwrap();
        std::fs::write(dir.join("input.pdb"), "ATOM\nEND\n").unwrap();
        std::fs::write(dir.join("minimization_output.pdb"), "ATOM\nEND\n").unwrap();
        std::fs::write(dir.join("minimization_output.pdb.dat"), "# curve\n").unwrap();
        let mf = dir.join("multifoxs");
        std::fs::create_dir_all(&mf).unwrap();
        std::fs::write(mf.join("multi_foxs.log"), "number_of_states 1\n").unwrap();
        std::fs::write(
            mf.join("ensembles_size_1.txt"),
            "1 | 2.0 | x1 2.0 (1.0, 0.0)\n  5 | 1.0 (1.0, 0.0) | ../foxs/rg20/f_5.pdb.dat (1.0)\n",
        )
        .unwrap();
        std::fs::write(mf.join("multi_state_model_1_1_1.dat"), "# fit\n").unwrap();
        std::fs::create_dir_all(dir.join("foxs/rg20")).unwrap();
        std::fs::write(dir.join("foxs/rg20/f_5.pdb"), "ATOM 5\nEND\n").unwrap();
    }

    /// Behaves like tar (creates the archive) and fails the analysis scripts.
    fn runner(tar_ok: bool) -> std::sync::Arc<ScriptedRunner> {
        ScriptedRunner::new(move |spec| {
            if spec.program_name() == "tar" {
                if !tar_ok {
                    return Scripted::exit(2).with_stderr("tar: results: Cannot stat");
                }
                std::fs::write(spec.cwd.clone().unwrap().join(&spec.args[1]), b"gz").unwrap();
                return Scripted::ok();
            }
            Scripted::exit(1).with_stderr("Traceback (most recent call last)")
        })
    }

    #[tokio::test]
    async fn assembles_results_despite_failed_analyses() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let runner = runner(true);
        let ctx = test_support::context(root.path(), &job, runner.clone(), test_support::settings(root.path(), 0, 1)).await;
        seed_job_dir(&ctx.work_dir);

        let msg = ResultsStage.execute(&ctx, &job).await.unwrap();
        assert!(msg.contains("1 ensembles"));

        let results = ctx.path("results");
        for name in [
            "saxs.dat",
            "input.pdb",
            "minimization_output.pdb",
            "minimization_output.pdb.dat",
            "ensembles_size_1.txt",
            "multi_state_model_1_1_1.dat",
            "ensemble_size_1_model.pdb",
            "bilbomd_job.json",
            "README.md",
        ] {
            assert!(results.join(name).exists(), "missing {name}");
        }
        let summary: serde_json::Value =
            serde_json::from_slice(&std::fs::read(results.join("bilbomd_job.json")).unwrap()).unwrap();
        assert_eq!(summary["ensembles"], 1);
        assert!(summary.get("owner_email").is_none());
        assert!(ctx.path(archive_name(&job)).exists());

        let tar = &runner.calls_to("tar")[0];
        assert_eq!(tar.args, vec!["czf".to_string(), archive_name(&job), "results".to_string()]);
    }

    #[tokio::test]
    async fn archive_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let ctx = test_support::context(root.path(), &job, runner(false), test_support::settings(root.path(), 0, 1)).await;
        seed_job_dir(&ctx.work_dir);

        let err = ResultsStage.execute(&ctx, &job).await.unwrap_err();
        assert!(matches!(err, StageError::Archive(ref m) if m.contains("Cannot stat")));
    }

    #[tokio::test]
    async fn feedback_json_is_stored_on_job() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let runner = ScriptedRunner::new(|spec| {
            let cwd = spec.cwd.clone().unwrap();
            if spec.program_name() == "tar" {
                std::fs::write(cwd.join(&spec.args[1]), b"gz").unwrap();
            } else if spec.args[0].ends_with("pipeline_decision_tree.py") {
                std::fs::write(
                    PathBuf::from(&spec.args[1]).join(FEEDBACK_FILE),
                    r#"{"overall_chi_square": 1.2}"#,
                )
                .unwrap();
            }
            Scripted::ok()
        });
        let ctx = test_support::context(root.path(), &job, runner, test_support::settings(root.path(), 0, 1)).await;
        seed_job_dir(&ctx.work_dir);

        ResultsStage.execute(&ctx, &job).await.unwrap();
        let saved = ctx.job().await.unwrap();
        assert_eq!(saved.feedback.unwrap()["overall_chi_square"], 1.2);
        let readme = std::fs::read_to_string(ctx.path("results/README.md")).unwrap();
        assert!(readme.contains("## Feedback"));
    }
}
