//! MP4 renders of OpenMM trajectories, one per `md/rg_<N>/md.dcd`.
//!
//! Rendering follows sampling but is not a pipeline step: a failed or
//! missing movie is logged and never fails the job.

use std::path::{Path, PathBuf};

use refinery_core::config::MovieConfig;
use refinery_exec::{settle_all, CommandSpec};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::{ensure_dir, StageContext};

/// Movie output root, relative to the job directory.
pub const MOVIES_DIR: &str = "assets/movies";
pub const MOVIE_FILE: &str = "movie.mp4";
const MOVIE_SCRIPT: &str = "pymol/make_dcd_movie.py";

/// One MD run with both its starting structure and trajectory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trajectory {
    /// Directory name, e.g. `rg_26`.
    pub label: String,
    pub pdb: PathBuf,
    pub dcd: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MovieSummary {
    pub rendered: usize,
    /// Runs whose movie already existed from an earlier attempt.
    pub skipped: usize,
    pub failed: usize,
}

/// Every `md/rg_<N>/` holding both `md.pdb` and `md.dcd`, in name order.
pub fn find_trajectories(work_dir: &Path) -> Vec<Trajectory> {
    WalkDir::new(work_dir.join("md"))
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| {
            let label = e.file_name().to_string_lossy().into_owned();
            let digits = label.strip_prefix("rg_")?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let pdb = e.path().join("md.pdb");
            let dcd = e.path().join("md.dcd");
            if !pdb.is_file() || !dcd.is_file() {
                debug!(run = %label, "skipping run without md.pdb and md.dcd");
                return None;
            }
            Some(Trajectory { label, pdb, dcd })
        })
        .collect()
}

pub fn movie_command(ctx: &StageContext, traj: &Trajectory, out_dir: &Path, cfg: &MovieConfig) -> CommandSpec {
    let mut spec = CommandSpec::new(&ctx.settings.tools.pymol_python)
        .args(["-m", "pymol", "-cqr"])
        .arg(ctx.settings.tools.script(MOVIE_SCRIPT).display().to_string())
        .args(["--", "--pdb"])
        .arg(traj.pdb.display().to_string())
        .arg("--dcd")
        .arg(traj.dcd.display().to_string())
        .arg("--out")
        .arg(out_dir.join(MOVIE_FILE).display().to_string())
        .arg("--stride")
        .arg(cfg.stride.to_string())
        .args(["--viewport", "--align-ca", "--orient", "principal", "--clip"]);
    if cfg.ray {
        spec = spec.arg("--ray");
    }
    spec.args([
        "--width".to_string(),
        cfg.width.to_string(),
        "--height".to_string(),
        cfg.height.to_string(),
        "--crf".to_string(),
        cfg.crf.to_string(),
    ])
    .cwd(out_dir)
    .timeout(cfg.timeout())
}

/// Render a movie for every trajectory that does not have one yet, under
/// the CPU limiter. Never fails; the summary says what happened.
pub async fn render_movies(ctx: &StageContext) -> MovieSummary {
    let cfg = &ctx.settings.compute.movies;
    let mut summary = MovieSummary::default();
    if !cfg.enabled {
        return summary;
    }

    let mut pending = Vec::new();
    for traj in find_trajectories(&ctx.work_dir) {
        let out_dir = ctx.path(MOVIES_DIR).join(&traj.label);
        if out_dir.join(MOVIE_FILE).exists() {
            summary.skipped += 1;
        } else {
            pending.push((traj, out_dir));
        }
    }
    if pending.is_empty() {
        debug!(job_id = %ctx.job_id, skipped = summary.skipped, "no movies to render");
        return summary;
    }

    info!(job_id = %ctx.job_id, movies = pending.len(), "rendering trajectory movies");
    let limiter = ctx.settings.cpu_limiter();
    let results = settle_all(&limiter, pending, |_, (traj, out_dir): (Trajectory, PathBuf)| async move {
        ensure_dir(&out_dir).await?;
        let spec = movie_command(ctx, &traj, &out_dir, cfg);
        let result = ctx.run_logged(&out_dir, &format!("movie_{}", traj.label), &spec).await;
        if let Err(e) = &result {
            warn!(job_id = %ctx.job_id, run = %traj.label, error = %e, "movie render failed");
        }
        result
    })
    .await;

    for result in results {
        match result {
            Ok(()) => summary.rendered += 1,
            Err(_) => summary.failed += 1,
        }
    }
    ctx.task_log
        .log(&format!(
            "movies: {} rendered, {} failed, {} already present",
            summary.rendered, summary.failed, summary.skipped
        ))
        .await;
    summary
}
