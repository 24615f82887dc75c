//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use casefile_core::{InvestigationId, JobId};

use super::types::{Job, JobStatus, NewJob};

/// Job store abstraction.
///
/// Implementations must make `claim_next` atomic: two concurrent claims never
/// return the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new Queued job and assign its id.
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs of one investigation, newest first.
    async fn list_for_investigation(
        &self,
        investigation_id: InvestigationId,
        take: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Claim the oldest claimable job and move it to Running.
    /// Returns None if no jobs are available.
    async fn claim_next(
        &self,
        max_attempts: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Overwrite a job only if it is still in `expected_status` at `expected_attempt`.
    ///
    /// Returns `false` when the stored row moved on (or is gone).
    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempt: u32,
    ) -> Result<bool, JobStoreError>;

    /// Running jobs whose current attempt started at or before `started_before`.
    async fn list_expired_leases(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).insert(job, now).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_for_investigation(
        &self,
        investigation_id: InvestigationId,
        take: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_for_investigation(investigation_id, take).await
    }

    async fn claim_next(
        &self,
        max_attempts: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(max_attempts, worker_id, now).await
    }

    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempt: u32,
    ) -> Result<bool, JobStoreError> {
        (**self).update_if(job, expected_status, expected_attempt).await
    }

    async fn list_expired_leases(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_expired_leases(started_before).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("investigation not found: {0}")]
    InvestigationNotFound(InvestigationId),
    #[error("corrupt job row {job_id}: {message}")]
    Corrupt { job_id: i64, message: String },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    fn count(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Running => self.running += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.failed + self.cancelled
    }
}

pub(crate) fn stats_from_counts(
    counts: impl IntoIterator<Item = (JobStatus, usize)>,
) -> JobStats {
    let mut stats = JobStats::default();
    for (status, n) in counts {
        stats.count(status, n);
    }
    stats
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    next_id: i64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;
        inner.next_id += 1;
        let job = Job::new(JobId::new(inner.next_id), job, now);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn list_for_investigation(
        &self,
        investigation_id: InvestigationId,
        take: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.investigation_id == investigation_id)
            .cloned()
            .collect();

        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(take);
        Ok(result)
    }

    async fn claim_next(
        &self,
        max_attempts: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        // Oldest claimable job, FIFO by creation then id
        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(max_attempts, now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.mark_running(worker_id, now);
                job.clone()
            })
        }))
    }

    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempt: u32,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.write()?;
        match inner.jobs.get_mut(&job.id) {
            Some(current)
                if current.status == expected_status
                    && current.attempt_count == expected_attempt =>
            {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired_leases(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.last_attempt_started_at.is_some_and(|at| at <= started_before)
            })
            .cloned()
            .collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        Ok(stats_from_counts(inner.jobs.values().map(|j| (j.status, 1))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casefile_ai::AiJobType;
    use std::collections::HashSet;

    fn new_job(investigation: i64) -> NewJob {
        NewJob {
            investigation_id: InvestigationId::new(investigation),
            job_type: AiJobType::Analysis,
            model: None,
            prompt: Some("prompt".into()),
            debug: false,
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let store = InMemoryJobStore::new();
        let a = store.insert(new_job(1), Utc::now()).await.unwrap();
        let b = store.insert(new_job(1), Utc::now()).await.unwrap();

        assert_eq!(a.id, JobId::new(1));
        assert_eq!(b.id, JobId::new(2));
        assert_eq!(a.status, JobStatus::Queued);
        assert_eq!(store.get(b.id).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn claim_is_fifo() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        let first = store.insert(new_job(1), t0).await.unwrap();
        let second = store.insert(new_job(1), t0 + chrono::Duration::seconds(1)).await.unwrap();

        let claimed = store.claim_next(3, "w", Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt_count, 1);

        let claimed = store.claim_next(3, "w", Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(store.claim_next(3, "w", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_exhausted_and_backed_off_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job(1), now).await.unwrap();

        let mut exhausted = job.clone();
        exhausted.attempt_count = 3;
        assert!(store.update_if(&exhausted, JobStatus::Queued, 0).await.unwrap());
        assert!(store.claim_next(3, "w", now).await.unwrap().is_none());

        let mut backed_off = exhausted.clone();
        backed_off.attempt_count = 1;
        backed_off.next_attempt_at = Some(now + chrono::Duration::seconds(30));
        assert!(store.update_if(&backed_off, JobStatus::Queued, 3).await.unwrap());
        assert!(store.claim_next(3, "w", now).await.unwrap().is_none());
        assert!(
            store
                .claim_next(3, "w", now + chrono::Duration::seconds(30))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn update_if_rejects_stale_writes() {
        let store = InMemoryJobStore::new();
        store.insert(new_job(1), Utc::now()).await.unwrap();
        let claimed = store.claim_next(3, "w", Utc::now()).await.unwrap().unwrap();

        let mut stale = claimed.clone();
        stale.status = JobStatus::Succeeded;
        assert!(!store.update_if(&stale, JobStatus::Running, 0).await.unwrap());
        assert!(!store.update_if(&stale, JobStatus::Queued, 1).await.unwrap());
        assert!(store.update_if(&stale, JobStatus::Running, 1).await.unwrap());

        let mut missing = stale.clone();
        missing.id = JobId::new(99);
        assert!(!store.update_if(&missing, JobStatus::Succeeded, 1).await.unwrap());
    }

    #[tokio::test]
    async fn lists_newest_first_and_respects_take() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        for i in 0..4 {
            store.insert(new_job(1), t0 + chrono::Duration::seconds(i)).await.unwrap();
        }
        store.insert(new_job(2), t0).await.unwrap();

        let jobs = store.list_for_investigation(InvestigationId::new(1), 3).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.get()).collect();
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn expired_leases_and_stats() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store.insert(new_job(1), t0).await.unwrap();
        store.insert(new_job(1), t0).await.unwrap();
        store.claim_next(3, "w", t0).await.unwrap();

        let expired = store.list_expired_leases(t0).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(store.list_expired_leases(t0 - chrono::Duration::seconds(1)).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.queued, stats.running, stats.total()), (1, 1, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_hand_out_the_same_job() {
        let store = InMemoryJobStore::arc();
        for _ in 0..50 {
            store.insert(new_job(1), Utc::now()).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let worker = format!("worker-{w}");
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(3, &worker, Utc::now()).await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(store.stats().await.unwrap().running, 50);
    }
}
