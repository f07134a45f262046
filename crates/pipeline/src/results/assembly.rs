//! Turning MultiFoXS output into one multi-model PDB per ensemble size.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::context::write_atomic;
use crate::error::StageError;

const STATES_MARKER: &str = "number_of_states";

/// Ensemble sizes MultiFoXS reported: the last `number_of_states N` in its log.
pub fn count_ensembles(log: &str) -> usize {
    log.lines()
        .filter_map(|line| {
            let rest = &line[line.find(STATES_MARKER)? + STATES_MARKER.len()..];
            let digits: String = rest
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        })
        .last()
        .unwrap_or(0)
}

/// Conformer PDB files of the best-scoring `size`-state model.
///
/// `ensembles_size_<n>.txt` lists models best first; the state lines of the
/// first model are the first `size` lines naming a `.pdb.dat` curve. Curve
/// paths are relative to the MultiFoXS directory; the `.dat` suffix is
/// dropped to get the structure.
pub fn best_ensemble_members(content: &str, size: usize, multifoxs_dir: &Path) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().find(|tok| tok.contains(".pdb.dat")))
        .take(size)
        .map(|tok| {
            let pdb = tok.trim_end_matches(".dat");
            let path = Path::new(pdb);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                multifoxs_dir.join(path)
            }
        })
        .collect()
}

/// One conformer as a model block: its terminal `END` becomes `ENDMDL`.
pub fn to_model_block(pdb: &str) -> String {
    let mut lines: Vec<&str> = pdb.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.last().is_some_and(|l| l.trim_end() == "END") {
        lines.pop();
    }
    let mut block = lines.join("\n");
    if !block.is_empty() {
        block.push('\n');
    }
    block.push_str("ENDMDL\n");
    block
}

/// Multi-model PDB text: `MODEL n` before each conformer, numbered from 1.
pub fn concatenate_models(conformers: &[String]) -> String {
    let mut out = String::new();
    for (i, pdb) in conformers.iter().enumerate() {
        out.push_str(&format!("MODEL     {:>4}\n", i + 1));
        out.push_str(&to_model_block(pdb));
    }
    out
}

/// Write `ensemble_size_<n>_model.pdb` for every size `1..=count`.
///
/// A size that cannot be assembled is logged and skipped. Returns how many
/// files were written.
pub async fn assemble_ensembles(multifoxs_dir: &Path, results_dir: &Path, count: usize) -> usize {
    let mut written = 0;
    for size in 1..=count {
        match assemble_one(multifoxs_dir, results_dir, size).await {
            Ok(path) => {
                info!(size, file = %path.display(), "ensemble model written");
                written += 1;
            }
            Err(e) => warn!(size, error = %e, "could not assemble ensemble model"),
        }
    }
    written
}

async fn assemble_one(multifoxs_dir: &Path, results_dir: &Path, size: usize) -> Result<PathBuf, StageError> {
    let listing = multifoxs_dir.join(format!("ensembles_size_{size}.txt"));
    let content = tokio::fs::read_to_string(&listing)
        .await
        .map_err(|_| StageError::MissingInput(listing.clone()))?;

    let members = best_ensemble_members(&content, size, multifoxs_dir);
    if members.is_empty() {
        return Err(StageError::parse(listing.display().to_string(), "no .pdb.dat entries"));
    }

    let mut conformers = Vec::with_capacity(members.len());
    for pdb in &members {
        let text = tokio::fs::read_to_string(pdb)
            .await
            .map_err(|_| StageError::MissingInput(pdb.clone()))?;
        conformers.push(text);
    }

    let out = results_dir.join(format!("ensemble_size_{}_model.pdb", members.len()));
    write_atomic(&out, concatenate_models(&conformers).as_bytes()).await?;
    Ok(out)
}
