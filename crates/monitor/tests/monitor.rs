//! Monitor passes against an in-memory store and a fake scheduler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use refinery_core::{
    BatchState, Clock, Config, ExecutionBackend, Job, JobMode, JobStatus, JobStore, ManualClock, MdEngine,
    MemoryJobStore, RemoteBatchInfo, RgRange, StepName, StepState,
};
use refinery_exec::testing::{Scripted, ScriptedRunner};
use refinery_monitor::{RemoteBatchMonitor, SchedulerClient, SchedulerError, SchedulerJobState};
use refinery_notify::{CompletionNotifier, NotifyError};
use refinery_pipeline::{archive_name, PipelineSettings};
use uuid::Uuid;

struct FakeScheduler {
    state: Mutex<String>,
    status_file: Mutex<Option<String>>,
    copies: AtomicUsize,
    copy_delay: Duration,
    fail_copy: bool,
    fail_state: bool,
}

impl FakeScheduler {
    fn new(state: &str) -> Self {
        Self {
            state: Mutex::new(state.to_string()),
            status_file: Mutex::new(None),
            copies: AtomicUsize::new(0),
            copy_delay: Duration::ZERO,
            fail_copy: false,
            fail_state: false,
        }
    }

    fn with_status_file(self, text: &str) -> Self {
        *self.status_file.lock().unwrap() = Some(text.to_string());
        self
    }

    fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerClient for FakeScheduler {
    async fn job_state(&self, batch_id: &str) -> Result<SchedulerJobState, SchedulerError> {
        if self.fail_state {
            return Err(SchedulerError::Status { status: 503, body: "maintenance".into() });
        }
        let raw = self.state.lock().unwrap().clone();
        assert_eq!(batch_id, "48213");
        Ok(SchedulerJobState {
            state: BatchState::normalize(&raw),
            raw_state: raw,
            qos: Some("regular".into()),
            submitted_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()),
            started_at: None,
            completed_at: None,
        })
    }

    async fn status_file(&self, _job_id: Uuid) -> Result<String, SchedulerError> {
        self.status_file
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SchedulerError::Decode("No such file".into()))
    }

    async fn copy_results(&self, _job_id: Uuid) -> Result<(), SchedulerError> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        if !self.copy_delay.is_zero() {
            tokio::time::sleep(self.copy_delay).await;
        }
        if self.fail_copy {
            return Err(SchedulerError::Task { task_id: "77".into(), detail: "rsync exited 23".into() });
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn send_completion_email(
        &self,
        recipient: &str,
        _base_url: &str,
        _job_id: &str,
        _title: &str,
        is_failure: bool,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((recipient.to_string(), is_failure));
        Ok(())
    }
}

fn settings(upload: &Path) -> Arc<PipelineSettings> {
    let vars: HashMap<&str, String> = HashMap::from([("UPLOAD_DIR", upload.display().to_string())]);
    let config = Config::from_lookup("", &|k| vars.get(k).cloned());
    Arc::new(PipelineSettings::from_config(&config))
}

fn tar_only() -> Arc<ScriptedRunner> {
    ScriptedRunner::new(|spec| {
        if spec.program_name() == "tar" {
            let cwd = spec.cwd.clone().unwrap_or_default();
            std::fs::write(cwd.join(&spec.args[1]), b"gz").unwrap();
        }
        Scripted::ok()
    })
}

async fn remote_job(store: &MemoryJobStore, status: JobStatus) -> Job {
    let mut job = Job::new("remote lysozyme", JobMode::Pdb, MdEngine::OpenMm, ExecutionBackend::Remote, "saxs.dat");
    job.pdb_file = Some("lyz.pdb".into());
    job.owner_email = Some("owner@example.org".into());
    job.rg = Some(RgRange::new(20, 40));
    job.status = status;
    job.remote = Some(RemoteBatchInfo::new("48213"));
    store.save(&job).await.unwrap();
    job
}

struct Harness {
    _upload: tempfile::TempDir,
    store: Arc<MemoryJobStore>,
    scheduler: Arc<FakeScheduler>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
    monitor: Arc<RemoteBatchMonitor>,
    upload_path: std::path::PathBuf,
}

fn harness(scheduler: FakeScheduler) -> Harness {
    let upload = tempfile::tempdir().unwrap();
    let upload_path = upload.path().to_path_buf();
    let store = Arc::new(MemoryJobStore::new());
    let scheduler = Arc::new(scheduler);
    let notifier = Arc::new(RecordingNotifier::default());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap()));
    let monitor = RemoteBatchMonitor::new(
        store.clone(),
        scheduler.clone(),
        settings(upload.path()),
        tar_only(),
        notifier.clone(),
    )
    .with_clock(clock.clone());
    Harness {
        _upload: upload,
        store,
        scheduler,
        notifier,
        clock,
        monitor: Arc::new(monitor),
        upload_path,
    }
}

#[tokio::test]
async fn completed_batch_is_cleaned_up_once() {
    let h = harness(FakeScheduler::new("COMPLETED"));
    let job = remote_job(&h.store, JobStatus::Running).await;

    let summary = h.monitor.poll_once().await.unwrap();
    assert_eq!((summary.polled, summary.cleaned_up, summary.errors), (1, 1, 0));

    let done = h.store.load(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.completed_at, Some(h.clock.now()));
    assert!(!done.cleanup_in_progress);
    assert_eq!(done.remote.as_ref().unwrap().state, BatchState::Completed);
    assert_eq!(done.step(StepName::CopyResults).unwrap().status, StepState::Success);
    assert_eq!(done.step(StepName::Results).unwrap().status, StepState::Success);
    assert!(done.all_steps_succeeded());
    assert!(job.work_dir(&h.upload_path).join(archive_name(&job)).exists());
    assert_eq!(h.notifier.sent.lock().unwrap().clone(), vec![("owner@example.org".to_string(), false)]);

    // Completed jobs drop out of the active set.
    let again = h.monitor.poll_once().await.unwrap();
    assert_eq!(again.polled, 0);
    assert_eq!(h.scheduler.copies(), 1);
}

#[tokio::test]
async fn concurrent_cleanups_run_exactly_once() {
    let mut scheduler = FakeScheduler::new("COMPLETED");
    scheduler.copy_delay = Duration::from_millis(50);
    let h = harness(scheduler);
    let job = remote_job(&h.store, JobStatus::Running).await;

    let (a, b) = tokio::join!(h.monitor.cleanup(job.id), h.monitor.cleanup(job.id));
    let ran = [a.unwrap(), b.unwrap()];
    assert_eq!(ran.iter().filter(|r| **r).count(), 1);
    assert_eq!(h.scheduler.copies(), 1);

    assert!(!h.monitor.cleanup(job.id).await.unwrap());
    assert_eq!(h.scheduler.copies(), 1);
    assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_copy_sets_error_and_releases_flag() {
    let mut scheduler = FakeScheduler::new("COMPLETED");
    scheduler.fail_copy = true;
    let h = harness(scheduler);
    let job = remote_job(&h.store, JobStatus::Running).await;

    let summary = h.monitor.poll_once().await.unwrap();
    assert_eq!(summary.errors, 1);

    let failed = h.store.load(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert!(!failed.cleanup_in_progress);
    let copy = failed.step(StepName::CopyResults).unwrap();
    assert_eq!(copy.status, StepState::Error);
    assert!(copy.message.contains("rsync exited 23"));
    assert_eq!(failed.step(StepName::Results).unwrap().status, StepState::Waiting);
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn completed_batch_with_failed_step_is_not_completed() {
    let scheduler = FakeScheduler::new("COMPLETED").with_status_file("minimize: Success\nmd: Error\n");
    let h = harness(scheduler);
    let job = remote_job(&h.store, JobStatus::Running).await;

    let summary = h.monitor.poll_once().await.unwrap();
    assert_eq!((summary.cleaned_up, summary.errors), (0, 1));

    let failed = h.store.load(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.completed_at, None);
    assert!(!failed.cleanup_in_progress);
    assert_eq!(failed.step(StepName::Md).unwrap().status, StepState::Error);
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn out_of_memory_marks_job_failed() {
    let h = harness(FakeScheduler::new("OUT_OF_MEMORY"));
    let job = remote_job(&h.store, JobStatus::Running).await;

    h.monitor.poll_once().await.unwrap();
    let failed = h.store.load(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.remote.unwrap().state, BatchState::Failed);
    assert_eq!(h.scheduler.copies(), 0);
}

#[tokio::test]
async fn cancelled_marks_job_cancelled() {
    let h = harness(FakeScheduler::new("CANCELLED by 48213"));
    let job = remote_job(&h.store, JobStatus::Pending).await;

    h.monitor.poll_once().await.unwrap();
    assert_eq!(h.store.load(job.id).await.unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn unknown_and_suspended_leave_status_unchanged() {
    for raw in ["REQUEUE_HOLD", "SUSPENDED"] {
        let h = harness(FakeScheduler::new(raw));
        let job = remote_job(&h.store, JobStatus::Running).await;

        let summary = h.monitor.poll_once().await.unwrap();
        assert_eq!(summary.errors, 0);

        let polled = h.store.load(job.id).await.unwrap();
        assert_eq!(polled.status, JobStatus::Running, "{raw}");
        let info = polled.remote.unwrap();
        assert_eq!(info.last_polled_at, Some(h.clock.now()));
        assert_eq!(info.queue_class.as_deref(), Some("regular"));
    }
}

#[tokio::test]
async fn status_file_is_mirrored_and_progress_recomputed() {
    let scheduler = FakeScheduler::new("RUNNING").with_status_file(
        "nersc_prepare_slurm_batch: Success\n\
         nersc_submit_slurm_batch: Success\n\
         minimize: Success\n\
         heat: Running\n\
         dcd2pdb: Success\n",
    );
    let h = harness(scheduler);
    let job = remote_job(&h.store, JobStatus::Pending).await;

    h.monitor.poll_once().await.unwrap();
    let polled = h.store.load(job.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::Running);
    assert_eq!(polled.step(StepName::Minimize).unwrap().status, StepState::Success);
    assert_eq!(polled.step(StepName::Heat).unwrap().status, StepState::Running);
    assert!(polled.step(StepName::Dcd2pdb).is_none());
    assert_eq!(polled.step(StepName::BatchStatus).unwrap().status, StepState::Success);
    // Prepare, submit, minimize and the status step of eleven.
    assert_eq!(polled.progress, 36);
}

#[tokio::test]
async fn missing_status_file_still_records_state() {
    let h = harness(FakeScheduler::new("PENDING"));
    let job = remote_job(&h.store, JobStatus::Submitted).await;

    h.monitor.poll_once().await.unwrap();
    let polled = h.store.load(job.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::Pending);
    assert_eq!(polled.remote.unwrap().state, BatchState::Pending);
}

#[tokio::test]
async fn scheduler_outage_is_logged_per_job() {
    let mut scheduler = FakeScheduler::new("RUNNING");
    scheduler.fail_state = true;
    let h = harness(scheduler);
    let job = remote_job(&h.store, JobStatus::Running).await;
    let local = Job::new("local", JobMode::Crd, MdEngine::Charmm, ExecutionBackend::Local, "d.dat");
    h.store.save(&local).await.unwrap();

    let summary = h.monitor.poll_once().await.unwrap();
    assert_eq!((summary.polled, summary.errors), (1, 1));

    let polled = h.store.load(job.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::Running);
    let step = polled.step(StepName::BatchStatus).unwrap();
    assert_eq!(step.status, StepState::Error);
    assert!(step.message.contains("503"));
}

#[tokio::test(start_paused = true)]
async fn spawned_monitor_polls_on_its_period() {
    let h = harness(FakeScheduler::new("RUNNING"));
    let job = remote_job(&h.store, JobStatus::Pending).await;

    let task = h.monitor.clone().spawn(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.store.load(job.id).await.unwrap().status, JobStatus::Pending);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.store.load(job.id).await.unwrap().status, JobStatus::Running);
    task.stop();
}
