//! Core job types and state transitions.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use casefile_ai::{AiJobDebugInfo, AiJobErrorInfo, AiJobType, StructuredResult};
use casefile_core::{DomainError, InvestigationId, JobId};

/// Longest delay a retryable failure can put before the next attempt.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Earliest time a re-queued job may be claimed again.
fn retry_at(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff.min(MAX_RETRY_BACKOFF))
        .ok()
        .and_then(|backoff| now.checked_add_signed(backoff))
        .unwrap_or(now)
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker
    Running,
    /// Completed successfully
    Succeeded,
    /// Failed terminally (until an operator retries it)
    Failed,
    /// Cancelled by a user (until an operator retries it)
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No further automatic transition happens from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Operator retry is only valid from these states.
    pub fn can_retry(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("invalid job status: {other}"))),
        }
    }
}

/// Input of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub investigation_id: InvestigationId,
    pub job_type: AiJobType,
    pub model: Option<String>,
    /// Explicit prompt; when absent the worker builds one from findings.
    pub prompt: Option<String>,
    pub debug: bool,
}

/// Payload reported by the worker on success.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSuccess {
    pub raw_result: String,
    pub result_format: String,
    pub structured: StructuredResult,
    pub debug: Option<AiJobDebugInfo>,
}

/// Payload reported by the worker on failure.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub error: AiJobErrorInfo,
    pub debug: Option<AiJobDebugInfo>,
}

/// An AI text-generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub investigation_id: InvestigationId,
    pub job_type: AiJobType,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub debug: bool,

    pub status: JobStatus,
    /// Claims so far; +1 per claim, never decremented.
    pub attempt_count: u32,
    /// `attempt_count` at the last operator retry; attempts beyond it form the current budget.
    pub attempts_before_retry: u32,
    pub worker_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_attempt_started_at: Option<DateTime<Utc>>,
    pub last_attempt_completed_at: Option<DateTime<Utc>>,
    pub last_attempt_duration_ms: Option<i64>,
    /// A re-queued job is not claimable before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub result: Option<String>,
    pub result_format: Option<String>,
    pub structured_result: Option<StructuredResult>,

    pub error: Option<String>,
    pub error_info: Option<AiJobErrorInfo>,

    pub debug_info: Option<AiJobDebugInfo>,
}

impl Job {
    /// A freshly queued job.
    pub fn new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            investigation_id: new.investigation_id,
            job_type: new.job_type,
            model: new.model,
            prompt: new.prompt,
            debug: new.debug,
            status: JobStatus::Queued,
            attempt_count: 0,
            attempts_before_retry: 0,
            worker_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_attempt_started_at: None,
            last_attempt_completed_at: None,
            last_attempt_duration_ms: None,
            next_attempt_at: None,
            result: None,
            result_format: None,
            structured_result: None,
            error: None,
            error_info: None,
            debug_info: None,
        }
    }

    /// Attempts consumed since creation or the last operator retry.
    pub fn attempts_in_budget(&self) -> u32 {
        self.attempt_count.saturating_sub(self.attempts_before_retry)
    }

    pub fn has_attempts_remaining(&self, max_attempts: u32) -> bool {
        self.attempts_in_budget() < max_attempts
    }

    /// Whether a claim at `now` may pick this job.
    pub fn is_claimable(&self, max_attempts: u32, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.has_attempts_remaining(max_attempts)
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Queued -> Running. Clears everything left over from a previous attempt.
    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempt_count += 1;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.last_attempt_started_at = Some(now);
        self.last_attempt_completed_at = None;
        self.last_attempt_duration_ms = None;
        self.completed_at = None;
        self.next_attempt_at = None;
        self.clear_result();
        self.clear_error();
        self.debug_info = None;
    }

    /// Running -> Succeeded.
    pub fn mark_succeeded(&mut self, success: JobSuccess, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.result = Some(success.raw_result);
        self.result_format = Some(success.result_format);
        self.structured_result = Some(success.structured);
        self.debug_info = success.debug;
        self.clear_error();
        self.finish_attempt(now);
        self.completed_at = Some(now);
        self.next_attempt_at = None;
    }

    /// Running -> Queued (retryable, attempts left) or Running -> Failed.
    ///
    /// Returns `true` when the failure is terminal.
    pub fn mark_failed(
        &mut self,
        failure: JobFailure,
        max_attempts: u32,
        retry_backoff: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let retry = failure.error.is_retryable && self.has_attempts_remaining(max_attempts);

        self.error = Some(failure.error.message.clone());
        self.error_info = Some(failure.error);
        self.debug_info = failure.debug;
        self.clear_result();
        self.finish_attempt(now);

        if retry {
            self.status = JobStatus::Queued;
            self.completed_at = None;
            self.next_attempt_at = Some(retry_at(now, retry_backoff));
            false
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.next_attempt_at = None;
            self.attempt_count = self
                .attempt_count
                .min(self.attempts_before_retry.saturating_add(max_attempts));
            true
        }
    }

    /// Queued | Running -> Cancelled.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.next_attempt_at = None;
    }

    /// Failed | Cancelled -> Queued. Attempt history is kept; a fresh budget starts.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Queued;
        self.attempts_before_retry = self.attempt_count;
        self.worker_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.last_attempt_started_at = None;
        self.last_attempt_completed_at = None;
        self.last_attempt_duration_ms = None;
        self.next_attempt_at = None;
        self.clear_result();
        self.clear_error();
        self.debug_info = None;
    }

    fn finish_attempt(&mut self, now: DateTime<Utc>) {
        self.last_attempt_completed_at = Some(now);
        self.last_attempt_duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0));
    }

    fn clear_result(&mut self) {
        self.result = None;
        self.result_format = None;
        self.structured_result = None;
    }

    fn clear_error(&mut self) {
        self.error = None;
        self.error_info = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casefile_ai::ResultSection;

    fn new_job() -> Job {
        Job::new(
            JobId::new(1),
            NewJob {
                investigation_id: InvestigationId::new(7),
                job_type: AiJobType::Analysis,
                model: None,
                prompt: None,
                debug: false,
            },
            Utc::now(),
        )
    }

    fn failure(retryable: bool) -> JobFailure {
        JobFailure {
            error: AiJobErrorInfo::new("ollama_network", "connection refused", retryable, Utc::now()),
            debug: None,
        }
    }

    fn success() -> JobSuccess {
        JobSuccess {
            raw_result: "## Executive Summary\nok".into(),
            result_format: "sections.v1".into(),
            structured: StructuredResult {
                sections: vec![ResultSection::new("executive_summary", "Executive Summary", "ok")],
                ..Default::default()
            },
            debug: None,
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = new_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);

        job.mark_running("w1", Utc::now());
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.worker_id.as_deref(), Some("w1"));

        job.mark_succeeded(success(), Utc::now());
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.result.is_some() && job.error.is_none() && job.error_info.is_none());
        assert!(job.completed_at.is_some());
        assert!(job.last_attempt_duration_ms.unwrap() >= 0);
    }

    #[test]
    fn retryable_failure_requeues_with_backoff() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_running("w1", now);

        let terminal = job.mark_failed(failure(true), 3, Duration::from_secs(5), now);

        assert!(!terminal);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.completed_at.is_none());
        assert_eq!(job.next_attempt_at, Some(now + chrono::Duration::seconds(5)));
        assert_eq!(job.error.as_deref(), Some("connection refused"));
        assert!(!job.is_claimable(3, now));
        assert!(job.is_claimable(3, now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn oversized_backoff_is_capped() {
        let mut job = new_job();
        let now = Utc::now();
        job.mark_running("w1", now);

        let terminal = job.mark_failed(failure(true), 3, Duration::from_secs(10_000_000_000_000), now);

        assert!(!terminal);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.next_attempt_at, Some(now + chrono::Duration::days(7)));
    }

    #[test]
    fn exhausted_attempts_fail_terminally() {
        let mut job = new_job();
        for _ in 0..3 {
            job.mark_running("w1", Utc::now());
            job.mark_failed(failure(true), 3, Duration::ZERO, Utc::now());
        }
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
        assert!(job.completed_at.is_some());
        assert!(job.result.is_none());
    }

    #[test]
    fn non_retryable_failure_is_terminal_immediately() {
        let mut job = new_job();
        job.mark_running("w1", Utc::now());
        assert!(job.mark_failed(failure(false), 3, Duration::ZERO, Utc::now()));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn claim_clears_previous_attempt() {
        let mut job = new_job();
        job.mark_running("w1", Utc::now());
        job.mark_failed(failure(true), 3, Duration::ZERO, Utc::now());
        job.mark_running("w2", Utc::now());

        assert_eq!(job.attempt_count, 2);
        assert!(job.error.is_none() && job.error_info.is_none());
        assert!(job.last_attempt_completed_at.is_none());
        assert_eq!(job.worker_id.as_deref(), Some("w2"));
    }

    #[test]
    fn operator_retry_keeps_history_and_grants_new_budget() {
        let mut job = new_job();
        for _ in 0..3 {
            job.mark_running("w1", Utc::now());
            job.mark_failed(failure(true), 3, Duration::ZERO, Utc::now());
        }
        assert!(!job.has_attempts_remaining(3));

        job.reset_for_retry();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 3);
        assert!(job.is_claimable(3, Utc::now()));
        assert!(job.error_info.is_none() && job.started_at.is_none());
    }
}
