//! Job queue service: the only writer of job state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use casefile_ai::{AiJobErrorInfo, AiJobType};
use casefile_core::{InvestigationId, JobId};

use crate::investigations::{InvestigationReadError, InvestigationReader};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobFailure, JobStatus, JobSuccess, NewJob};

/// Error code recorded when a Running job outlives its lease.
pub const CODE_LEASE_EXPIRED: &str = "lease_expired";

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Attempts per budget (creation or operator retry).
    pub max_attempts: u32,
    /// Minimum delay before a re-queued job is claimable again.
    pub retry_backoff: Duration,
    /// A Running job older than this is recovered; `None` disables recovery.
    pub lease_timeout: Option<Duration>,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            lease_timeout: Some(Duration::from_secs(15 * 60)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("investigation not found: {0}")]
    InvestigationNotFound(InvestigationId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Investigations(#[from] InvestigationReadError),
}

/// Enqueue, claim and report on AI jobs.
///
/// Every write after a claim is a compare-and-swap on `(status, attempt_count)`,
/// so a report from an attempt that was cancelled or recovered is dropped.
pub struct JobQueueService<S: JobStore> {
    store: S,
    investigations: Arc<dyn InvestigationReader>,
    config: JobQueueConfig,
}

impl<S: JobStore> JobQueueService<S> {
    pub fn new(store: S, investigations: Arc<dyn InvestigationReader>, config: JobQueueConfig) -> Self {
        Self {
            store,
            investigations,
            config,
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    pub fn investigations(&self) -> &Arc<dyn InvestigationReader> {
        &self.investigations
    }

    /// Create a Queued job for an existing investigation.
    ///
    /// Blank `model` / `prompt` strings are treated as absent.
    pub async fn enqueue(
        &self,
        investigation_id: InvestigationId,
        job_type: AiJobType,
        model: Option<String>,
        prompt: Option<String>,
        debug: bool,
    ) -> Result<Job, JobQueueError> {
        if !self.investigations.investigation_exists(investigation_id).await? {
            return Err(JobQueueError::InvestigationNotFound(investigation_id));
        }

        let new = NewJob {
            investigation_id,
            job_type,
            model: non_blank(model),
            prompt: non_blank(prompt),
            debug,
        };

        let job = self.store.insert(new, Utc::now()).await.map_err(|e| match e {
            JobStoreError::InvestigationNotFound(id) => JobQueueError::InvestigationNotFound(id),
            other => other.into(),
        })?;

        info!(
            job_id = %job.id,
            investigation_id = %investigation_id,
            job_type = %job_type,
            debug = job.debug,
            "AI job enqueued"
        );
        Ok(job)
    }

    /// Claim the oldest eligible job for `worker_id`.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, JobQueueError> {
        let job = self
            .store
            .claim_next(self.config.max_attempts, worker_id, Utc::now())
            .await?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, worker = worker_id, attempt = job.attempt_count, "AI job claimed");
        }
        Ok(job)
    }

    /// Record a successful attempt.
    ///
    /// `attempt` is the attempt count observed at claim time. Reports for a
    /// missing job, or one that is no longer Running under that attempt, are
    /// dropped. Returns `true` when the result was stored.
    pub async fn mark_succeeded(
        &self,
        job_id: JobId,
        attempt: u32,
        success: JobSuccess,
    ) -> Result<bool, JobQueueError> {
        let Some(mut job) = self.running_attempt(job_id, attempt, "success").await? else {
            return Ok(false);
        };

        job.mark_succeeded(success, Utc::now());
        let applied = self.store.update_if(&job, JobStatus::Running, attempt).await?;
        if applied {
            info!(
                job_id = %job_id,
                attempt,
                duration_ms = job.last_attempt_duration_ms,
                "AI job succeeded"
            );
        } else {
            warn!(job_id = %job_id, attempt, "AI job changed while reporting success; result dropped");
        }
        Ok(applied)
    }

    /// Record a failed attempt. Returns `true` when nothing further will happen
    /// for this attempt (terminal failure, or the report was dropped).
    pub async fn mark_failed(
        &self,
        job_id: JobId,
        attempt: u32,
        failure: JobFailure,
    ) -> Result<bool, JobQueueError> {
        let Some(job) = self.running_attempt(job_id, attempt, "failure").await? else {
            return Ok(true);
        };
        Ok(self.fail_attempt(job, failure).await?.unwrap_or(true))
    }

    /// Operator retry: Failed | Cancelled -> Queued with a fresh attempt budget.
    pub async fn retry_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Ok(None);
        };

        if !job.status.can_retry() {
            warn!(job_id = %job_id, status = %job.status, "AI job cannot be retried from this status");
            return Ok(Some(job));
        }

        let (expected_status, expected_attempt) = (job.status, job.attempt_count);
        job.reset_for_retry();
        if self.store.update_if(&job, expected_status, expected_attempt).await? {
            info!(job_id = %job_id, previous_status = %expected_status, "AI job re-queued by operator");
            Ok(Some(job))
        } else {
            warn!(job_id = %job_id, "AI job changed during retry; returning current state");
            Ok(self.store.get(job_id).await?)
        }
    }

    /// Cancel a Queued or Running job.
    ///
    /// A Running job keeps executing, but its report is dropped.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Ok(None);
        };

        if !job.status.can_cancel() {
            warn!(job_id = %job_id, status = %job.status, "AI job cannot be cancelled from this status");
            return Ok(Some(job));
        }

        let (expected_status, expected_attempt) = (job.status, job.attempt_count);
        job.mark_cancelled(Utc::now());
        if self.store.update_if(&job, expected_status, expected_attempt).await? {
            info!(job_id = %job_id, previous_status = %expected_status, "AI job cancelled");
            Ok(Some(job))
        } else {
            warn!(job_id = %job_id, "AI job changed during cancel; returning current state");
            Ok(self.store.get(job_id).await?)
        }
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Jobs of an investigation, newest first.
    pub async fn get_jobs_for_investigation(
        &self,
        investigation_id: InvestigationId,
        take: usize,
    ) -> Result<Vec<Job>, JobQueueError> {
        Ok(self.store.list_for_investigation(investigation_id, take).await?)
    }

    /// Fail every Running job whose lease expired, re-queuing it when attempts remain.
    ///
    /// Returns the ids that were recovered.
    pub async fn recover_expired_leases(&self) -> Result<Vec<JobId>, JobQueueError> {
        let Some(timeout) = self.config.lease_timeout else {
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(Vec::new());
        };
        let expired = self.store.list_expired_leases(cutoff).await?;

        let mut recovered = Vec::with_capacity(expired.len());
        for job in expired {
            let job_id = job.id;
            let error = AiJobErrorInfo::new(
                CODE_LEASE_EXPIRED,
                format!(
                    "no report from worker {} within {}s",
                    job.worker_id.as_deref().unwrap_or("unknown"),
                    timeout.as_secs()
                ),
                true,
                now,
            );
            let attempt = job.attempt_count;
            warn!(job_id = %job_id, attempt, worker = ?job.worker_id, "AI job lease expired");

            if self.fail_attempt(job, JobFailure { error, debug: None }).await?.is_some() {
                recovered.push(job_id);
            }
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<JobStats, JobQueueError> {
        Ok(self.store.stats().await?)
    }

    /// The job if it is still Running under `attempt`; otherwise logs and returns None.
    async fn running_attempt(
        &self,
        job_id: JobId,
        attempt: u32,
        report: &str,
    ) -> Result<Option<Job>, JobQueueError> {
        match self.store.get(job_id).await? {
            None => {
                warn!(job_id = %job_id, report, "AI job not found; report dropped");
                Ok(None)
            }
            Some(job) if job.status != JobStatus::Running || job.attempt_count != attempt => {
                warn!(
                    job_id = %job_id,
                    report,
                    attempt,
                    current_attempt = job.attempt_count,
                    status = %job.status,
                    "AI job no longer running under this attempt; report dropped"
                );
                Ok(None)
            }
            Some(job) => Ok(Some(job)),
        }
    }

    /// Apply a failure to a Running job. `None` when the write lost the race,
    /// otherwise whether the failure was terminal.
    async fn fail_attempt(
        &self,
        mut job: Job,
        failure: JobFailure,
    ) -> Result<Option<bool>, JobQueueError> {
        let attempt = job.attempt_count;
        let code = failure.error.code.clone();
        let terminal = job.mark_failed(
            failure,
            self.config.max_attempts,
            self.config.retry_backoff,
            Utc::now(),
        );

        if !self.store.update_if(&job, JobStatus::Running, attempt).await? {
            warn!(job_id = %job.id, attempt, "AI job changed while reporting failure; report dropped");
            return Ok(None);
        }

        if terminal {
            warn!(job_id = %job.id, attempt, code = %code, error = ?job.error, "AI job failed");
        } else {
            info!(
                job_id = %job.id,
                attempt,
                code = %code,
                next_attempt_at = ?job.next_attempt_at,
                "AI job re-queued after retryable failure"
            );
        }
        Ok(Some(terminal))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
