//! MultiFoXS ensemble search over every scored conformer.

use async_trait::async_trait;
use refinery_core::{Job, StepName};
use refinery_exec::CommandSpec;
use tracing::info;
use walkdir::WalkDir;

use crate::context::{ensure_dir, write_atomic, StageContext};
use crate::error::StageError;
use crate::stage::Stage;

pub const MULTIFOXS_DIR: &str = "multifoxs";
pub const MULTIFOXS_LOG: &str = "multi_foxs";
const DAT_LIST: &str = "foxs_dat_files.txt";

pub struct MultiFoxsStage;

#[async_trait]
impl Stage for MultiFoxsStage {
    fn step(&self) -> StepName {
        StepName::Multifoxs
    }

    fn label(&self) -> &'static str {
        "MultiFoXS Calculations"
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let data = ctx.require(&job.data_file)?;
        let out_dir = ctx.path(MULTIFOXS_DIR);
        ensure_dir(&out_dir).await?;

        let curves: Vec<String> = WalkDir::new(ctx.path("foxs"))
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.path().display().to_string())
            .filter(|p| p.ends_with(".pdb.dat"))
            .collect();
        if curves.is_empty() {
            return Err(StageError::MissingInput(ctx.path("foxs/*/*.pdb.dat")));
        }
        let mut list = curves.join("\n");
        list.push('\n');
        write_atomic(&out_dir.join(DAT_LIST), list.as_bytes()).await?;
        info!(job_id = %ctx.job_id, curves = curves.len(), "starting MultiFoXS");

        let spec = CommandSpec::new(&ctx.settings.tools.multifoxs_bin)
            .arg("-o")
            .arg(data.display().to_string())
            .arg(DAT_LIST)
            .cwd(&out_dir)
            .timeout(ctx.step_timeout());
        ctx.run_logged(&out_dir, MULTIFOXS_LOG, &spec).await?;

        Ok(format!("MultiFoXS Calculations have completed ({} curves).", curves.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support;
    use refinery_core::{JobMode, MdEngine};
    use refinery_exec::testing::ScriptedRunner;

    #[tokio::test]
    async fn lists_every_curve_and_runs_in_multifoxs_dir() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let runner = ScriptedRunner::succeeding();
        let ctx = test_support::context(root.path(), &job, runner.clone(), test_support::settings(root.path(), 0, 1)).await;
        std::fs::write(ctx.path("saxs.dat"), "0.01 1 0.1\n").unwrap();
        for rg in ["rg20", "rg26"] {
            let dir = ctx.path("foxs").join(rg);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("a.pdb"), "").unwrap();
            std::fs::write(dir.join("a.pdb.dat"), "").unwrap();
        }

        MultiFoxsStage.execute(&ctx, &job).await.unwrap();

        let list = std::fs::read_to_string(ctx.path("multifoxs/foxs_dat_files.txt")).unwrap();
        assert_eq!(list.lines().count(), 2);
        assert!(list.lines().all(|l| l.ends_with(".pdb.dat")));
        let call = &runner.calls_to("multi_foxs")[0];
        assert_eq!(call.cwd.as_deref(), Some(ctx.path("multifoxs").as_path()));
        assert_eq!(call.args[0], "-o");
        assert!(ctx.path("multifoxs/multi_foxs.log").exists());
    }

    #[tokio::test]
    async fn no_curves_fails_before_spawning() {
        let root = tempfile::tempdir().unwrap();
        let job = test_support::job(JobMode::Crd, MdEngine::Charmm);
        let runner = ScriptedRunner::succeeding();
        let ctx = test_support::context(root.path(), &job, runner.clone(), test_support::settings(root.path(), 0, 1)).await;
        std::fs::write(ctx.path("saxs.dat"), "").unwrap();

        assert!(matches!(
            MultiFoxsStage.execute(&ctx, &job).await,
            Err(StageError::MissingInput(_))
        ));
        assert!(runner.calls().is_empty());
    }
}
