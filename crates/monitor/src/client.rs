//! Scheduler REST client.
//!
//! [`SchedulerClient`] is the seam the monitor talks through; [`SfApiClient`]
//! implements it against the Superfacility API. Responses are parsed by free
//! functions so the mapping can be tested without a server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use refinery_core::config::RemoteConfig;
use refinery_core::BatchState;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::token::TokenProvider;

/// One accounting record for a scheduler job.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerJobState {
    pub state: BatchState,
    /// The state string as the scheduler reported it.
    pub raw_state: String,
    pub qos: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn job_state(&self, batch_id: &str) -> Result<SchedulerJobState, SchedulerError>;

    /// Contents of the per-step status file the batch script maintains.
    async fn status_file(&self, job_id: Uuid) -> Result<String, SchedulerError>;

    /// Copy a finished job's directory back to shared storage and wait for it.
    async fn copy_results(&self, job_id: Uuid) -> Result<(), SchedulerError>;
}

// ── Response parsing ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SacctRecord {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    qos: Option<String>,
    #[serde(default)]
    submit: Option<String>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
}

/// Scheduler timestamps come either as RFC 3339 or as a bare local
/// `YYYY-MM-DDTHH:MM:SS`, taken as UTC. `Unknown`, `None` and anything else
/// unparseable map to `None`.
pub fn parse_scheduler_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

/// Read `output[0]` of a `compute/jobs` response.
pub fn parse_job_state(batch_id: &str, body: &Value) -> Result<SchedulerJobState, SchedulerError> {
    let record = body
        .get("output")
        .and_then(|o| o.as_array())
        .and_then(|o| o.first())
        .ok_or_else(|| SchedulerError::NoRecord(batch_id.to_string()))?;
    let record: SacctRecord = serde_json::from_value(record.clone())
        .map_err(|e| SchedulerError::Decode(e.to_string()))?;

    let raw_state = record.state.unwrap_or_default();
    let state = BatchState::normalize(&raw_state);
    if state == BatchState::Unknown {
        warn!(batch_id, raw_state = %raw_state, "unrecognized scheduler state");
    }
    Ok(SchedulerJobState {
        state,
        raw_state,
        qos: record.qos.filter(|q| !q.is_empty()),
        submitted_at: parse_scheduler_time(record.submit.as_deref()),
        started_at: parse_scheduler_time(record.start.as_deref()),
        completed_at: parse_scheduler_time(record.end.as_deref()),
    })
}

/// Read the `file` field of a `utilities/download` response.
pub fn parse_download(body: &Value) -> Result<String, SchedulerError> {
    if let Some(err) = body.get("error").and_then(|e| e.as_str()).filter(|e| !e.is_empty()) {
        return Err(SchedulerError::Decode(err.to_string()));
    }
    body.get("file")
        .and_then(|f| f.as_str())
        .map(str::to_string)
        .ok_or_else(|| SchedulerError::Decode("download response has no file".into()))
}

/// Progress of an asynchronous API task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskProgress {
    Pending,
    Done,
    Failed(String),
}

/// Read a `tasks/{id}` response. The `result` field is itself a JSON string
/// whose `status` is `ok` on success.
pub fn parse_task(body: &Value) -> TaskProgress {
    let status = body.get("status").and_then(|s| s.as_str()).unwrap_or_default();
    match status {
        "completed" => {
            let result = body
                .get("result")
                .and_then(|r| r.as_str())
                .and_then(|r| serde_json::from_str::<Value>(r).ok());
            match result {
                Some(r) if r.get("status").and_then(|s| s.as_str()) == Some("ok") => TaskProgress::Done,
                Some(r) => TaskProgress::Failed(
                    r.get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("task reported an error")
                        .to_string(),
                ),
                None => TaskProgress::Done,
            }
        }
        "failed" => TaskProgress::Failed(
            body.get("result")
                .and_then(|r| r.as_str())
                .unwrap_or("task failed")
                .to_string(),
        ),
        _ => TaskProgress::Pending,
    }
}

// ── Superfacility API ─────────────────────────────────────────

pub struct SfApiClient {
    http: reqwest::Client,
    base_url: String,
    machine: String,
    scratch_dir: String,
    copy_script: String,
    token: Arc<dyn TokenProvider>,
    task_poll: Duration,
    task_timeout: Duration,
}

impl SfApiClient {
    pub fn new(config: &RemoteConfig, token: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            machine: config.machine.clone(),
            scratch_dir: config.scratch_dir.trim_end_matches('/').to_string(),
            copy_script: config.copy_script.clone(),
            token,
            task_poll: Duration::from_secs(5),
            task_timeout: Duration::from_secs(30 * 60),
        }
    }

    /// How often and how long to wait on asynchronous API tasks.
    pub fn with_task_polling(mut self, poll: Duration, timeout: Duration) -> Self {
        self.task_poll = poll;
        self.task_timeout = timeout;
        self
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, SchedulerError> {
        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            if status == 403 {
                warn!("scheduler API rejected the access token");
            }
            return Err(SchedulerError::Status { status, body });
        }
        Ok(response.json().await?)
    }

    async fn get(&self, url: &str) -> Result<Value, SchedulerError> {
        let token = self.token.token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await?;
        self.read_json(response).await
    }

    async fn run_command(&self, command: &str) -> Result<String, SchedulerError> {
        let url = format!("{}/utilities/command/{}", self.base_url, self.machine);
        let token = self.token.token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .form(&[("executable", command)])
            .send()
            .await?;
        let body = self.read_json(response).await?;
        body.get("task_id")
            .and_then(|t| t.as_str().map(str::to_string).or_else(|| t.as_u64().map(|n| n.to_string())))
            .ok_or_else(|| SchedulerError::Decode(format!("command response has no task_id: {body}")))
    }

    async fn wait_for_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let deadline = Instant::now() + self.task_timeout;
        loop {
            match parse_task(&self.get(&url).await?) {
                TaskProgress::Done => return Ok(()),
                TaskProgress::Failed(detail) => {
                    return Err(SchedulerError::Task { task_id: task_id.to_string(), detail })
                }
                TaskProgress::Pending => {
                    if Instant::now() >= deadline {
                        return Err(SchedulerError::Task {
                            task_id: task_id.to_string(),
                            detail: format!("not finished after {}s", self.task_timeout.as_secs()),
                        });
                    }
                    debug!(task_id, "remote task still running");
                    tokio::time::sleep(self.task_poll).await;
                }
            }
        }
    }
}

#[async_trait]
impl SchedulerClient for SfApiClient {
    async fn job_state(&self, batch_id: &str) -> Result<SchedulerJobState, SchedulerError> {
        let url = format!(
            "{}/compute/jobs/{}/{}?sacct=true",
            self.base_url, self.machine, batch_id
        );
        parse_job_state(batch_id, &self.get(&url).await?)
    }

    async fn status_file(&self, job_id: Uuid) -> Result<String, SchedulerError> {
        let url = format!(
            "{}/utilities/download/{}/{}/{}/status.txt",
            self.base_url,
            self.machine,
            self.scratch_dir.trim_start_matches('/'),
            job_id
        );
        parse_download(&self.get(&url).await?)
    }

    async fn copy_results(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let task_id = self.run_command(&format!("bash {} {}", self.copy_script, job_id)).await?;
        debug!(job_id = %job_id, task_id = %task_id, "copy-back task submitted");
        self.wait_for_task(&task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn job_state_reads_first_record() {
        let body = json!({
            "status": "OK",
            "output": [{
                "jobid": "31337",
                "state": "CANCELLED by 48213",
                "qos": "regular_1",
                "submit": "2025-03-01T09:00:00",
                "start": "2025-03-01T09:05:30",
                "end": "Unknown"
            }]
        });
        let state = parse_job_state("31337", &body).unwrap();
        assert_eq!(state.state, BatchState::Cancelled);
        assert_eq!(state.raw_state, "CANCELLED by 48213");
        assert_eq!(state.qos.as_deref(), Some("regular_1"));
        assert_eq!(state.started_at, Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, 5, 30).unwrap()));
        assert_eq!(state.completed_at, None);
    }

    #[test]
    fn empty_output_is_no_record() {
        let err = parse_job_state("1", &json!({"output": []})).unwrap_err();
        assert!(matches!(err, SchedulerError::NoRecord(id) if id == "1"));
    }

    #[test]
    fn out_of_memory_maps_to_failed() {
        let body = json!({"output": [{"state": "OUT_OF_MEMORY"}]});
        assert_eq!(parse_job_state("9", &body).unwrap().state, BatchState::Failed);
    }

    #[test]
    fn download_error_is_surfaced() {
        assert_eq!(parse_download(&json!({"file": "md: Success\n", "error": null})).unwrap(), "md: Success\n");
        assert!(parse_download(&json!({"file": null, "error": "No such file"})).is_err());
    }

    #[test]
    fn task_progress() {
        assert_eq!(parse_task(&json!({"status": "active"})), TaskProgress::Pending);
        assert_eq!(
            parse_task(&json!({"status": "completed", "result": "{\"status\": \"ok\", \"output\": \"\"}"})),
            TaskProgress::Done
        );
        assert_eq!(
            parse_task(&json!({"status": "completed", "result": "{\"status\": \"error\", \"error\": \"rsync: 23\"}"})),
            TaskProgress::Failed("rsync: 23".into())
        );
        assert!(matches!(parse_task(&json!({"status": "failed"})), TaskProgress::Failed(_)));
    }

    #[test]
    fn rfc3339_times_are_accepted() {
        let t = parse_scheduler_time(Some("2025-03-01T09:00:00-08:00")).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2025, 3, 1, 17, 0, 0).unwrap());
        assert_eq!(parse_scheduler_time(Some("None")), None);
        assert_eq!(parse_scheduler_time(None), None);
    }
}
