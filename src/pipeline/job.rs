use dashmap::DashMap;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Linear job stages. Ordering follows the declaration order, so a job may
/// only ever move to a stage that compares greater or equal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStage {
    Queued,
    Detecting,
    Tracking,
    Rendering,
    Encoding,
    Completed,
    Failed,
}

impl ProcessingStage {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStage::Completed | ProcessingStage::Failed)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub stage: ProcessingStage,
    /// Fraction done, in [0, 1]. Never decreases.
    pub progress: f32,
    pub message: String,
    pub started_at: SystemTime,
    pub error: Option<String>,
}

impl JobStatus {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            stage: ProcessingStage::Queued,
            progress: 0.0,
            message: "Job queued".into(),
            started_at: SystemTime::now(),
            error: None,
        }
    }

    /// Moves the job forward. Ignored once terminal or when `stage` would go
    /// backwards; progress is clamped and never lowered.
    pub fn advance(&mut self, stage: ProcessingStage, progress: f32, message: String) -> bool {
        if self.stage.is_terminal() || stage < self.stage {
            return false;
        }

        self.stage = stage;
        self.progress = progress.clamp(0.0, 1.0).max(self.progress);
        self.message = message;

        true
    }

    /// Terminal failure; progress stays where it was.
    pub fn fail(&mut self, error: String) -> bool {
        if self.stage.is_terminal() {
            return false;
        }

        self.stage = ProcessingStage::Failed;
        self.message = format!("Processing failed: {}", error);
        self.error = Some(error);

        true
    }
}

/// Concurrent job id to status map. Each running job writes only its own
/// entry; retention timers are owned here so they can be cancelled.
#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<DashMap<Uuid, JobStatus>>,
    timers: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: Uuid) -> JobStatus {
        let status = JobStatus::new(job_id);
        self.jobs.insert(job_id, status.clone());

        status
    }

    pub fn get(&self, job_id: &Uuid) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<JobStatus> {
        self.jobs.iter().map(|s| s.value().clone()).collect()
    }

    pub fn status(&self, job_id: &Uuid) -> Result<JobStatus> {
        self.get(job_id).ok_or(Error::JobNotFound(*job_id))
    }

    pub fn advance(
        &self,
        job_id: &Uuid,
        stage: ProcessingStage,
        progress: f32,
        message: impl Into<String>,
    ) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(mut s) => s.advance(stage, progress, message.into()),
            None => false,
        }
    }

    pub fn fail(&self, job_id: &Uuid, error: impl ToString) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(mut s) => s.fail(error.to_string()),
            None => false,
        }
    }

    /// Fails every job that has not reached a terminal stage. Returns how many
    /// were affected.
    pub fn fail_active(&self, error: &str) -> usize {
        self.jobs
            .iter_mut()
            .filter_map(|mut s| s.fail(error.to_string()).then_some(()))
            .count()
    }

    /// Drops the status of `job_id` after `delay`. Rescheduling replaces any
    /// pending timer for the same job.
    pub fn schedule_removal(&self, job_id: Uuid, delay: Duration) {
        let jobs = self.jobs.clone();
        let timers = self.timers.clone();

        let mut pending = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            jobs.remove(&job_id);
            timers.lock().remove(&job_id);
            debug!(job_id = %job_id, "job status expired");
        });

        if let Some(old) = pending.insert(job_id, handle) {
            old.abort();
        }
    }

    pub fn pending_removals(&self) -> usize {
        self.timers.lock().len()
    }

    /// Cancels all pending removal timers and waits for them to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.timers.lock().drain().map(|(_, h)| h).collect();

        for h in handles {
            h.abort();
            let _ = h.await;
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessingStage::*;

    #[test]
    fn progress_never_decreases() {
        let mut s = JobStatus::new(Uuid::new_v4());

        assert!(s.advance(Detecting, 0.1, "load".into()));
        assert!(s.advance(Tracking, 0.05, "frame".into()));
        assert_eq!(s.progress, 0.1);

        assert!(s.advance(Tracking, 7.0, "frame".into()));
        assert_eq!(s.progress, 1.0);
    }

    #[test]
    fn stage_only_moves_forward() {
        let mut s = JobStatus::new(Uuid::new_v4());
        s.advance(Encoding, 0.9, "encoding".into());

        assert!(!s.advance(Tracking, 0.95, "late frame".into()));
        assert_eq!(s.stage, Encoding);
        assert_eq!(s.message, "encoding");
    }

    #[test]
    fn failure_freezes_progress() {
        let mut s = JobStatus::new(Uuid::new_v4());
        s.advance(Tracking, 0.42, "frame".into());

        assert!(s.fail("disk full".into()));
        assert!(!s.advance(Completed, 1.0, "done".into()));
        assert!(!s.fail("again".into()));

        assert_eq!(s.stage, Failed);
        assert_eq!(s.progress, 0.42);
        assert_eq!(s.error.as_deref(), Some("disk full"));
        assert_eq!(s.message, "Processing failed: disk full");
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = JobStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.status(&id), Err(Error::JobNotFound(x)) if x == id));
        assert!(!store.advance(&id, Detecting, 0.1, "x"));
    }

    #[test]
    fn fail_active_skips_terminal_jobs() {
        let store = JobStore::new();
        let done = Uuid::new_v4();
        let running = Uuid::new_v4();

        store.insert(done);
        store.advance(&done, Completed, 1.0, "ok");
        store.insert(running);

        assert_eq!(store.fail_active("Service shutdown"), 1);
        assert_eq!(store.status(&done).unwrap().stage, Completed);
        assert_eq!(store.status(&running).unwrap().error.as_deref(), Some("Service shutdown"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_expires_after_retention() {
        let store = JobStore::new();
        let id = Uuid::new_v4();
        store.insert(id);
        store.schedule_removal(id, Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(store.get(&id).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get(&id).is_none());
        assert_eq!(store.pending_removals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_timers() {
        let store = JobStore::new();
        let id = Uuid::new_v4();
        store.insert(id);
        store.schedule_removal(id, Duration::from_secs(5));

        store.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(store.get(&id).is_some());
        assert_eq!(store.pending_removals(), 0);
    }
}
