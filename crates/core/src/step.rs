//! Per-step status tracking and the fixed step topology of each job mode.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::{ExecutionBackend, JobMode, MdEngine};

/// One named pipeline unit with its own status.
///
/// Declaration order is pipeline order; `BTreeMap<StepName, _>` therefore
/// iterates in the order stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    #[serde(rename = "nersc_prepare_slurm_batch")]
    PrepareBatch,
    #[serde(rename = "nersc_submit_slurm_batch")]
    SubmitBatch,
    Pdb2crd,
    Pae,
    Autorg,
    Minimize,
    Initfoxs,
    Heat,
    Md,
    Dcd2pdb,
    Foxs,
    Multifoxs,
    #[serde(rename = "nersc_job_status")]
    BatchStatus,
    #[serde(rename = "nersc_copy_results_to_cfs")]
    CopyResults,
    Results,
}

impl StepName {
    pub const ALL: [StepName; 15] = [
        StepName::PrepareBatch,
        StepName::SubmitBatch,
        StepName::Pdb2crd,
        StepName::Pae,
        StepName::Autorg,
        StepName::Minimize,
        StepName::Initfoxs,
        StepName::Heat,
        StepName::Md,
        StepName::Dcd2pdb,
        StepName::Foxs,
        StepName::Multifoxs,
        StepName::BatchStatus,
        StepName::CopyResults,
        StepName::Results,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::PrepareBatch => "nersc_prepare_slurm_batch",
            StepName::SubmitBatch => "nersc_submit_slurm_batch",
            StepName::Pdb2crd => "pdb2crd",
            StepName::Pae => "pae",
            StepName::Autorg => "autorg",
            StepName::Minimize => "minimize",
            StepName::Initfoxs => "initfoxs",
            StepName::Heat => "heat",
            StepName::Md => "md",
            StepName::Dcd2pdb => "dcd2pdb",
            StepName::Foxs => "foxs",
            StepName::Multifoxs => "multifoxs",
            StepName::BatchStatus => "nersc_job_status",
            StepName::CopyResults => "nersc_copy_results_to_cfs",
            StepName::Results => "results",
        }
    }

    /// Job progress once this step has succeeded in a local run.
    pub fn milestone(&self) -> u8 {
        match self {
            StepName::PrepareBatch => 2,
            StepName::SubmitBatch => 5,
            StepName::Pdb2crd => 10,
            StepName::Pae => 15,
            StepName::Autorg => 20,
            StepName::Minimize => 25,
            StepName::Initfoxs => 30,
            StepName::Heat => 40,
            StepName::Md => 50,
            StepName::Dcd2pdb => 60,
            StepName::Foxs => 80,
            StepName::Multifoxs => 95,
            StepName::BatchStatus => 96,
            StepName::CopyResults => 97,
            StepName::Results => 99,
        }
    }

    /// Ordered step list for a job of the given shape.
    ///
    /// Coordinate generation only exists for CHARMM, which needs a topology
    /// and coordinate pair; OpenMM reads the PDB directly.
    pub fn topology(mode: JobMode, engine: MdEngine, backend: ExecutionBackend) -> Vec<StepName> {
        let mut steps = Vec::with_capacity(14);
        if backend == ExecutionBackend::Remote {
            steps.push(StepName::PrepareBatch);
            steps.push(StepName::SubmitBatch);
        }
        if engine == MdEngine::Charmm && mode != JobMode::Crd {
            steps.push(StepName::Pdb2crd);
        }
        if mode == JobMode::Auto {
            steps.push(StepName::Pae);
            steps.push(StepName::Autorg);
        }
        steps.extend([StepName::Minimize, StepName::Initfoxs, StepName::Heat, StepName::Md]);
        if engine == MdEngine::Charmm {
            steps.push(StepName::Dcd2pdb);
        }
        steps.extend([StepName::Foxs, StepName::Multifoxs]);
        if backend == ExecutionBackend::Remote {
            steps.push(StepName::BatchStatus);
            steps.push(StepName::CopyResults);
        }
        steps.push(StepName::Results);
        steps
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        StepName::ALL
            .iter()
            .copied()
            .find(|step| step.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| format!("unknown step: {needle}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepState {
    #[default]
    Waiting,
    Running,
    Success,
    Error,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Success | StepState::Error)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Waiting => "Waiting",
            StepState::Running => "Running",
            StepState::Success => "Success",
            StepState::Error => "Error",
        };
        f.write_str(s)
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" => Ok(StepState::Waiting),
            "running" => Ok(StepState::Running),
            "success" => Ok(StepState::Success),
            "error" => Ok(StepState::Error),
            other => Err(format!("unknown step state: {other}")),
        }
    }
}

/// `{status, message}` for one step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepStatus {
    pub status: StepState,
    #[serde(default)]
    pub message: String,
}

impl StepStatus {
    pub fn waiting() -> Self {
        Self::default()
    }

    pub fn running(message: impl Into<String>) -> Self {
        Self { status: StepState::Running, message: message.into() }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self { status: StepState::Success, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: StepState::Error, message: message.into() }
    }
}

/// The Steps map of a job. Keys outside the job's topology may be present
/// (left over from an earlier shape) but are ignored by aggregation.
pub type Steps = BTreeMap<StepName, StepStatus>;

/// Parse one `<step>: <status>` line from a scheduler-side status file.
///
/// Returns `None` for blank lines, unknown step names and unknown states.
pub fn parse_status_line(line: &str) -> Option<(StepName, StepState)> {
    let (name, state) = line.split_once(':')?;
    let step = name.parse::<StepName>().ok()?;
    let state = state.parse::<StepState>().ok()?;
    Some((step, state))
}
