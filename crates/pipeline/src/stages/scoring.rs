//! FoXS scoring of every sampled conformer.
//!
//! All candidate files across all `foxs/rg*` directories form one flat task
//! list sharing a single CPU limiter. Partial failure is tolerated: the stage
//! only fails when no file could be scored.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use refinery_core::{Job, MdEngine, StepName, StepStatus};
use refinery_exec::settle_all;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::{ensure_dir, open_log, StageContext};
use crate::error::StageError;
use crate::stage::Stage;
use crate::stages::single::foxs_command;
use crate::stages::Tally;

const FOXS_DIR: &str = "foxs";
const MD_DIR: &str = "md";
/// Starting structure OpenMM leaves in every window directory.
const MD_START: &str = "md.pdb";

pub struct FoxsStage;

#[async_trait]
impl Stage for FoxsStage {
    fn step(&self) -> StepName {
        StepName::Foxs
    }

    fn label(&self) -> &'static str {
        "FoXS Calculations"
    }

    fn heartbeat(&self, ctx: &StageContext) -> Duration {
        ctx.settings.compute.scoring_heartbeat()
    }

    async fn execute(&self, ctx: &StageContext, job: &Job) -> Result<String, StageError> {
        let foxs_dir = ctx.path(FOXS_DIR);
        ensure_dir(&foxs_dir).await?;
        if job.engine == MdEngine::OpenMm {
            let mirrored = mirror_md_frames(&ctx.path(MD_DIR), &foxs_dir).await?;
            debug!(job_id = %ctx.job_id, mirrored, "mirrored MD frames for scoring");
        }

        let files = collect_pdbs(&foxs_dir);
        let total = files.len();
        if total == 0 {
            return Err(StageError::NothingSucceeded {
                what: "FoXS".into(),
                total: 0,
                messages: format!("no PDB files under {}", foxs_dir.display()),
            });
        }
        info!(job_id = %ctx.job_id, files = total, slots = ctx.settings.cpu_slots, "starting FoXS fan-out");

        let log = open_log(&ctx.work_dir, "foxs").await?;
        let every = ctx.settings.compute.scoring_progress_every.max(1);
        let done = AtomicUsize::new(0);
        let limiter = ctx.settings.cpu_limiter();

        let results = settle_all(&limiter, files, |_, pdb: PathBuf| {
            let (log, done) = (&log, &done);
            async move {
                let spec = foxs_command(ctx, &pdb).timeout(ctx.script_timeout());
                let result = ctx.run_into(&spec, log).await;
                if let Err(e) = &result {
                    warn!(job_id = %ctx.job_id, file = %pdb.display(), error = %e, "FoXS failed for file");
                }
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                if n % every == 0 || n == total {
                    ctx.set_step(
                        StepName::Foxs,
                        StepStatus::running(format!("FoXS: {n} of {total} files scored.")),
                    )
                    .await;
                }
                result
            }
        })
        .await;

        let tally = Tally::of(results);
        tally.any_success("FoXS")?;
        if !tally.failures.is_empty() {
            ctx.task_log
                .log(&format!("warning: FoXS failed for {} of {} files", tally.failures.len(), total))
                .await;
            return Ok(format!(
                "FoXS Calculations have completed ({} of {} files scored, {} failed).",
                tally.succeeded,
                total,
                tally.failures.len()
            ));
        }
        Ok(format!("FoXS Calculations have completed ({total} files scored)."))
    }
}

/// Every `*.pdb` one level below `foxs/`, in a stable order.
fn collect_pdbs(foxs_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(foxs_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() || e.path_is_symlink())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "pdb"))
        .collect()
}

/// Link `md/rg_<N>/*.pdb` into `foxs/rg<N>/`, skipping the starting
/// structure. Existing entries are left alone so a re-run is harmless.
async fn mirror_md_frames(md_dir: &Path, foxs_dir: &Path) -> Result<usize, StageError> {
    let mut windows = match tokio::fs::read_dir(md_dir).await {
        Ok(rd) => rd,
        Err(_) => return Err(StageError::MissingInput(md_dir.to_path_buf())),
    };

    let mut mirrored = 0;
    while let Some(window) = windows.next_entry().await.map_err(StageError::io(md_dir))? {
        let name = window.file_name().to_string_lossy().into_owned();
        let Some(rg) = name.strip_prefix("rg_") else { continue };
        if !window.path().is_dir() {
            continue;
        }
        let target_dir = foxs_dir.join(format!("rg{rg}"));
        ensure_dir(&target_dir).await?;

        let mut frames = tokio::fs::read_dir(window.path())
            .await
            .map_err(StageError::io(window.path()))?;
        while let Some(frame) = frames.next_entry().await.map_err(StageError::io(window.path()))? {
            let file_name = frame.file_name();
            let path = frame.path();
            if file_name == MD_START || path.extension().map_or(true, |e| e != "pdb") {
                continue;
            }
            let target = target_dir.join(&file_name);
            if tokio::fs::symlink_metadata(&target).await.is_ok() {
                continue;
            }
            link_or_copy(&path, &target).await?;
            mirrored += 1;
        }
    }
    Ok(mirrored)
}

async fn link_or_copy(src: &Path, dst: &Path) -> Result<(), StageError> {
    #[cfg(unix)]
    {
        if tokio::fs::symlink(src, dst).await.is_ok() {
            return Ok(());
        }
    }
    tokio::fs::copy(src, dst).await.map_err(StageError::io(dst))?;
    Ok(())
}
