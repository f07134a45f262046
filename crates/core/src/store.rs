//! Step Status Store: durable job documents with atomic per-job updates.
//!
//! Every write goes through [`JobStore::update`], which applies a mutation
//! to the current document under the store's lock and persists the result
//! before returning. Readers therefore never observe a half-applied change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, JobStatus};
use crate::step::{StepName, StepStatus};

/// A change applied to a job document while the store holds its lock.
pub type JobMutation = Box<dyn FnOnce(&mut Job) + Send>;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Insert or replace a whole document.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Atomically apply `mutation` and persist. Returns the updated job.
    async fn update(&self, id: Uuid, mutation: JobMutation) -> Result<Job, StoreError>;

    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    async fn update_step(
        &self,
        id: Uuid,
        step: StepName,
        status: StepStatus,
    ) -> Result<(), StoreError> {
        self.update(id, Box::new(move |job| job.set_step(step, status)))
            .await
            .map(|_| ())
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        self.update(id, Box::new(move |job| job.status = status))
            .await
            .map(|_| ())
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError> {
        self.update(id, Box::new(move |job| job.set_progress(progress)))
            .await
            .map(|_| ())
    }

    /// Test-and-set the cleanup flag. Returns `false` when another pass
    /// already holds it or the job is already `Completed`.
    async fn try_begin_cleanup(&self, id: Uuid) -> Result<bool, StoreError> {
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        self.update(
            id,
            Box::new(move |job| {
                if !job.cleanup_in_progress && job.status != JobStatus::Completed {
                    job.cleanup_in_progress = true;
                    flag.store(true, Ordering::SeqCst);
                }
            }),
        )
        .await?;
        Ok(acquired.load(Ordering::SeqCst))
    }

    async fn end_cleanup(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, Box::new(|job| job.cleanup_in_progress = false))
            .await
            .map(|_| ())
    }

    /// Remote jobs the monitor still has to poll.
    async fn list_remote_active(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|job| {
                job.remote.is_some() && !job.status.is_terminal() && !job.cleanup_in_progress
            })
            .collect())
    }
}

// ── In-memory ─────────────────────────────────────────────────

/// Volatile store for tests and single-shot tooling.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, id: Uuid) -> Result<Job, StoreError> {
        self.jobs.lock().await.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, mutation: JobMutation) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        mutation(job);
        Ok(job.clone())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }
}

// ── File-backed ───────────────────────────────────────────────

/// One pretty-printed JSON document per job under a directory.
///
/// Writes go to `<id>.json.tmp` and are renamed over `<id>.json`, so a crash
/// mid-write leaves the previous version intact.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read(&self, id: Uuid) -> Result<Job, StoreError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(job.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load(&self, id: Uuid) -> Result<Job, StoreError> {
        self.read(id).await
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(job).await
    }

    async fn update(&self, id: Uuid, mutation: JobMutation) -> Result<Job, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut job = self.read(id).await?;
        mutation(&mut job);
        self.write(&job).await?;
        Ok(job)
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Job>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job document");
                }
            }
        }
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }
}
