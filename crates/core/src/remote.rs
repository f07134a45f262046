//! Remote batch scheduler state as mirrored onto a job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized scheduler job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    NodeFail,
    Preempted,
    Suspended,
    #[default]
    Unknown,
}

impl BatchState {
    /// Normalize a raw scheduler state string.
    ///
    /// Only the first whitespace-separated token counts (`"CANCELLED by 123"`
    /// is `CANCELLED`). Node failure, out-of-memory and preemption collapse
    /// into `FAILED`; anything unrecognized is `UNKNOWN`.
    pub fn normalize(raw: &str) -> Self {
        let token = raw
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match token.as_str() {
            "PENDING" => BatchState::Pending,
            "RUNNING" => BatchState::Running,
            "COMPLETED" => BatchState::Completed,
            "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" => BatchState::Failed,
            "CANCELLED" => BatchState::Cancelled,
            "TIMEOUT" => BatchState::Timeout,
            "SUSPENDED" => BatchState::Suspended,
            _ => BatchState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Running => "RUNNING",
            BatchState::Completed => "COMPLETED",
            BatchState::Failed => "FAILED",
            BatchState::Cancelled => "CANCELLED",
            BatchState::Timeout => "TIMEOUT",
            BatchState::OutOfMemory => "OUT_OF_MEMORY",
            BatchState::NodeFail => "NODE_FAIL",
            BatchState::Preempted => "PREEMPTED",
            BatchState::Suspended => "SUSPENDED",
            BatchState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Present only on jobs executed by the remote batch backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteBatchInfo {
    pub external_job_id: String,
    #[serde(default)]
    pub state: BatchState,
    #[serde(default)]
    pub queue_class: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl RemoteBatchInfo {
    pub fn new(external_job_id: impl Into<String>) -> Self {
        Self { external_job_id: external_job_id.into(), ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_states() {
        assert_eq!(BatchState::normalize("COMPLETED"), BatchState::Completed);
        assert_eq!(BatchState::normalize("running"), BatchState::Running);
        assert_eq!(BatchState::normalize("CANCELLED by 48213"), BatchState::Cancelled);
        assert_eq!(BatchState::normalize("TIMEOUT"), BatchState::Timeout);
        assert_eq!(BatchState::normalize("SUSPENDED"), BatchState::Suspended);
    }

    #[test]
    fn resource_failures_collapse_to_failed() {
        assert_eq!(BatchState::normalize("OUT_OF_MEMORY"), BatchState::Failed);
        assert_eq!(BatchState::normalize("NODE_FAIL (nid001234)"), BatchState::Failed);
        assert_eq!(BatchState::normalize("PREEMPTED"), BatchState::Failed);
    }

    #[test]
    fn unrecognized_is_unknown() {
        assert_eq!(BatchState::normalize("REQUEUED_HOLD"), BatchState::Unknown);
        assert_eq!(BatchState::normalize(""), BatchState::Unknown);
        assert_eq!(BatchState::normalize("   "), BatchState::Unknown);
    }

    #[test]
    fn serializes_screaming_snake() {
        let json = serde_json::to_string(&BatchState::OutOfMemory).unwrap();
        assert_eq!(json, "\"OUT_OF_MEMORY\"");
    }
}
