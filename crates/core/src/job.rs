//! The Job document and its lifecycle.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::RemoteBatchInfo;
use crate::step::{StepName, StepState, StepStatus, Steps};

/// Which starting material a job was submitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Topology (psf) and coordinates (crd) supplied directly.
    Crd,
    /// A PDB structure.
    Pdb,
    /// A predicted structure plus its PAE matrix; constraints and the Rg
    /// window are derived automatically.
    Auto,
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobMode::Crd => "crd",
            JobMode::Pdb => "pdb",
            JobMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdEngine {
    #[default]
    Charmm,
    #[serde(rename = "openmm")]
    OpenMm,
}

impl fmt::Display for MdEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MdEngine::Charmm => f.write_str("CHARMM"),
            MdEngine::OpenMm => f.write_str("OpenMM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Submitted,
    Pending,
    Running,
    Completed,
    Error,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Statuses the remote monitor no longer polls.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Submitted => "Submitted",
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Error => "Error",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Target radius-of-gyration window for MD sampling, in Ångström.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgRange {
    pub min: u32,
    pub max: u32,
}

impl RgRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Step between consecutive windows: `max(round((max - min) / 5), 1)`.
    pub fn step(&self) -> u32 {
        let span = self.max.saturating_sub(self.min) as f64;
        ((span / 5.0).round() as u32).max(1)
    }

    /// Every window from `min` up to and including `max`.
    pub fn windows(&self) -> Vec<u32> {
        let step = self.step();
        let mut out = Vec::new();
        let mut rg = self.min;
        while rg <= self.max {
            out.push(rg);
            rg += step;
        }
        out
    }
}

impl Default for RgRange {
    fn default() -> Self {
        Self { min: 20, max: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub owner_email: Option<String>,
    pub mode: JobMode,
    #[serde(default)]
    pub engine: MdEngine,
    #[serde(default)]
    pub backend: ExecutionBackend,

    /// Experimental scattering curve, relative to the job directory.
    pub data_file: String,
    #[serde(default)]
    pub pdb_file: Option<String>,
    #[serde(default)]
    pub psf_file: Option<String>,
    #[serde(default)]
    pub crd_file: Option<String>,
    #[serde(default)]
    pub const_inp_file: Option<String>,
    #[serde(default)]
    pub pae_file: Option<String>,

    #[serde(default)]
    pub rg: Option<RgRange>,
    /// Independent MD runs per Rg window.
    #[serde(default = "default_sampling")]
    pub conformational_sampling: u32,

    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub steps: Steps,
    #[serde(default)]
    pub remote: Option<RemoteBatchInfo>,
    #[serde(default)]
    pub cleanup_in_progress: bool,

    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feedback: Option<serde_json::Value>,
}

fn default_sampling() -> u32 {
    1
}

impl Job {
    /// A freshly submitted job with every topology step `Waiting`.
    pub fn new(
        title: impl Into<String>,
        mode: JobMode,
        engine: MdEngine,
        backend: ExecutionBackend,
        data_file: impl Into<String>,
    ) -> Self {
        let mut job = Self {
            id: Uuid::new_v4(),
            title: title.into(),
            owner_email: None,
            mode,
            engine,
            backend,
            data_file: data_file.into(),
            pdb_file: None,
            psf_file: None,
            crd_file: None,
            const_inp_file: None,
            pae_file: None,
            rg: None,
            conformational_sampling: default_sampling(),
            status: JobStatus::Submitted,
            progress: 0,
            steps: Steps::new(),
            remote: None,
            cleanup_in_progress: false,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            feedback: None,
        };
        job.reset_steps();
        job
    }

    pub fn topology(&self) -> Vec<StepName> {
        StepName::topology(self.mode, self.engine, self.backend)
    }

    /// Put every topology step back to `Waiting`. Keys outside the topology
    /// are kept untouched.
    pub fn reset_steps(&mut self) {
        for step in self.topology() {
            self.steps.insert(step, StepStatus::waiting());
        }
    }

    pub fn step(&self, step: StepName) -> Option<&StepStatus> {
        self.steps.get(&step)
    }

    pub fn set_step(&mut self, step: StepName, status: StepStatus) {
        self.steps.insert(step, status);
    }

    /// Raise progress; lowering is only allowed once the job is in `Error`.
    pub fn set_progress(&mut self, progress: u8) {
        let progress = progress.min(100);
        if self.status == JobStatus::Error || progress > self.progress {
            self.progress = progress;
        }
    }

    /// Percentage of topology steps that succeeded, rounded.
    pub fn progress_from_steps(&self) -> u8 {
        let topology = self.topology();
        if topology.is_empty() {
            return 0;
        }
        let done = topology
            .iter()
            .filter(|s| self.steps.get(s).map(|st| st.status) == Some(StepState::Success))
            .count();
        ((done as f64 / topology.len() as f64) * 100.0).round() as u8
    }

    /// True when every topology step is `Success`.
    pub fn all_steps_succeeded(&self) -> bool {
        self.topology()
            .iter()
            .all(|s| self.steps.get(s).map(|st| st.status) == Some(StepState::Success))
    }

    /// Mark the job `Completed`, first re-applying the step statuses in
    /// `reached`. If a topology step is still not `Success`, the job goes to
    /// `Error` instead and that step carries the reason. Returns whether the
    /// job ended up `Completed`.
    pub fn complete(&mut self, reached: Vec<(StepName, StepStatus)>, at: DateTime<Utc>) -> bool {
        for (step, status) in reached {
            self.set_step(step, status);
        }
        let unfinished = self
            .topology()
            .into_iter()
            .find(|s| self.steps.get(s).map(|st| st.status) != Some(StepState::Success));

        match unfinished {
            None => {
                self.status = JobStatus::Completed;
                self.progress = 100;
                self.completed_at = Some(at);
                true
            }
            Some(step) => {
                let state = self.steps.get(&step).map(|st| st.status).unwrap_or_default();
                if state != StepState::Error {
                    self.set_step(
                        step,
                        StepStatus::error(format!("Step was still {state} when the job finished.")),
                    );
                }
                self.status = JobStatus::Error;
                false
            }
        }
    }

    /// The most recent step in `Error`, in pipeline order.
    pub fn failing_step(&self) -> Option<(StepName, &StepStatus)> {
        self.steps
            .iter()
            .rev()
            .find(|(_, st)| st.status == StepState::Error)
            .map(|(name, st)| (*name, st))
    }

    pub fn rg_range(&self) -> RgRange {
        self.rg.unwrap_or_default()
    }

    /// Working directory of this job under the upload root.
    pub fn work_dir(&self, upload_root: &Path) -> PathBuf {
        upload_root.join(self.id.to_string())
    }

    /// First eight characters of the id, used in archive names.
    pub fn short_id(&self) -> String {
        self.id.to_string().chars().take(8).collect()
    }
}
