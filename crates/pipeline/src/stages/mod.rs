//! One executor per pipeline step.

mod ensemble;
mod md;
mod scoring;
mod single;
mod structure;

pub use ensemble::{MultiFoxsStage, MULTIFOXS_DIR, MULTIFOXS_LOG};
pub use md::{Dcd2PdbStage, MdStage};
pub use scoring::FoxsStage;
pub use single::{HeatStage, InitFoxsStage, MinimizeStage};
pub use structure::{AutoRgStage, PaeStage, Pdb2CrdStage};

use crate::error::StageError;

/// Outcome counts of a settled fan-out.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<String>,
}

impl Tally {
    pub fn of<R>(results: Vec<Result<R, StageError>>) -> Self {
        let total = results.len();
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        Self { total, succeeded: total - failures.len(), failures }
    }

    pub fn messages(&self) -> String {
        self.failures.join("; ")
    }

    /// Fail when the share of failed tasks exceeds `threshold` (0.0 tolerates none).
    pub fn within(&self, what: &str, threshold: f64) -> Result<(), StageError> {
        if self.failures.is_empty() || self.total == 0 {
            return Ok(());
        }
        let rate = self.failures.len() as f64 / self.total as f64;
        if rate > threshold {
            return Err(StageError::TooManyFailures {
                what: what.to_string(),
                failed: self.failures.len(),
                total: self.total,
                messages: self.messages(),
            });
        }
        Ok(())
    }

    /// Fail only when nothing succeeded.
    pub fn any_success(&self, what: &str) -> Result<(), StageError> {
        if self.succeeded == 0 {
            return Err(StageError::NothingSucceeded {
                what: what.to_string(),
                total: self.total,
                messages: self.messages(),
            });
        }
        Ok(())
    }
}
