//! Background AI job worker.
//!
//! One cooperative polling loop per worker: claim, build the prompt, call the
//! generation service, parse, report. Job-level faults are classified and
//! reported; they never end the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use casefile_ai::{
    AiJobDebugInfo, GenerationClient, GenerationMetrics, GenerationRequest, HttpMetrics,
    RESULT_FORMAT_VERSION, build_prompt, classify_error, parse_completion,
};
use casefile_core::JobId;

use crate::generation::ModelDefaults;

use super::queue::{JobQueueError, JobQueueService};
use super::store::JobStore;
use super::types::{Job, JobFailure, JobSuccess};

/// Worker loop configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AiJobWorkerConfig {
    /// Identity recorded on claimed jobs
    pub worker_id: String,
    /// Sleep when no job is claimable
    pub idle_delay: Duration,
    /// Sleep after a successful job
    pub success_delay: Duration,
    /// How often to recover expired leases; `None` disables the sweep.
    pub lease_sweep_interval: Option<Duration>,
}

impl Default for AiJobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("casefile-worker-{}", uuid::Uuid::now_v7().simple()),
            idle_delay: Duration::from_secs(3),
            success_delay: Duration::from_millis(250),
            lease_sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl AiJobWorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    lease_recoveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    /// Results discarded because the job was cancelled or recovered meanwhile
    pub results_dropped: u64,
    pub lease_recoveries: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_requeued: self.requeued.load(Ordering::Relaxed),
            results_dropped: self.dropped.load(Ordering::Relaxed),
            lease_recoveries: self.lease_recoveries.load(Ordering::Relaxed),
        }
    }
}

/// What happened to a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Retryable failure; the job is Queued again.
    Requeued,
    /// Terminal failure, or a failure report dropped because the job moved on.
    Failed,
    /// The attempt succeeded but the job had been cancelled or recovered, so
    /// the result was discarded.
    Dropped,
}

/// What one attempt got to before it finished or failed.
#[derive(Debug, Default)]
struct AttemptTrace {
    prompt: Option<String>,
    model: Option<String>,
    request_started_at: Option<DateTime<Utc>>,
    response_received_at: Option<DateTime<Utc>>,
    generation: Option<GenerationMetrics>,
    http: Option<HttpMetrics>,
}

impl AttemptTrace {
    fn debug_info(&self) -> Option<AiJobDebugInfo> {
        let prompt = self.prompt.clone()?;
        Some(AiJobDebugInfo {
            prompt_length: prompt.chars().count(),
            prompt,
            model: self.model.clone().unwrap_or_default(),
            request_started_at: self.request_started_at.unwrap_or_else(Utc::now),
            response_received_at: self.response_received_at,
            generation: self.generation.clone(),
            http: self.http.clone(),
        })
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct AiJobWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<WorkerStats>,
}

impl AiJobWorkerHandle {
    /// Signal shutdown and wait for the loop to exit.
    ///
    /// An in-flight job is abandoned in Running; lease recovery picks it up.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown.send(true);
        self.join.await
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Background AI job worker.
pub struct AiJobWorker<S: JobStore> {
    queue: Arc<JobQueueService<S>>,
    client: Arc<dyn GenerationClient>,
    models: ModelDefaults,
    config: AiJobWorkerConfig,
    stats: Arc<WorkerStats>,
}

impl<S: JobStore + 'static> AiJobWorker<S> {
    pub fn new(
        queue: Arc<JobQueueService<S>>,
        client: Arc<dyn GenerationClient>,
        models: ModelDefaults,
        config: AiJobWorkerConfig,
    ) -> Self {
        Self {
            queue,
            client,
            models,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the loop on the tokio runtime.
    pub fn spawn(self) -> AiJobWorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(rx));
        AiJobWorkerHandle {
            shutdown,
            join,
            stats,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let worker = self.config.worker_id.clone();
        info!(
            worker = %worker,
            provider = self.client.provider(),
            idle_delay_ms = self.config.idle_delay.as_millis() as u64,
            "AI job worker started"
        );

        let mut last_sweep: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.sweep_expired_leases(&mut last_sweep).await;

            let delay = match self.queue.claim(&worker).await {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    let outcome = tokio::select! {
                        outcome = self.process(job) => outcome,
                        _ = shutdown.changed() => {
                            warn!(worker = %worker, job_id = %job_id, "shutdown with job in flight; leaving it for lease recovery");
                            break;
                        }
                    };
                    match outcome {
                        Ok(JobOutcome::Succeeded) => self.config.success_delay,
                        Ok(JobOutcome::Requeued) => self.queue.config().retry_backoff,
                        Ok(JobOutcome::Failed | JobOutcome::Dropped) => Duration::ZERO,
                        Err(err) => {
                            error!(worker = %worker, job_id = %job_id, error = %err, "failed to report AI job outcome");
                            self.config.idle_delay
                        }
                    }
                }
                Ok(None) => self.config.idle_delay,
                Err(err) => {
                    error!(worker = %worker, error = %err, "failed to claim AI job");
                    self.config.idle_delay
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        info!(worker = %worker, stats = ?self.stats.snapshot(), "AI job worker stopped");
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<Option<(JobId, JobOutcome)>, JobQueueError> {
        let Some(job) = self.queue.claim(&self.config.worker_id).await? else {
            return Ok(None);
        };
        let job_id = job.id;
        Ok(Some((job_id, self.process(job).await?)))
    }

    /// Execute a claimed job and report the outcome to the queue.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, JobQueueError> {
        let (job_id, attempt) = (job.id, job.attempt_count);
        let mut trace = AttemptTrace::default();
        let result = self.execute(&job, &mut trace).await;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(success) => {
                if self.queue.mark_succeeded(job_id, attempt, success).await? {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    Ok(JobOutcome::Succeeded)
                } else {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(JobOutcome::Dropped)
                }
            }
            Err(err) => {
                let error = classify_error(&err, Utc::now());
                warn!(
                    worker = %self.config.worker_id,
                    job_id = %job_id,
                    attempt,
                    code = %error.code,
                    retryable = error.is_retryable,
                    error = %format!("{err:#}"),
                    "AI job attempt failed"
                );

                let debug = if job.debug { trace.debug_info() } else { None };
                let terminal = self
                    .queue
                    .mark_failed(job_id, attempt, JobFailure { error, debug })
                    .await?;

                if terminal {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    Ok(JobOutcome::Failed)
                } else {
                    self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                    Ok(JobOutcome::Requeued)
                }
            }
        }
    }

    async fn execute(&self, job: &Job, trace: &mut AttemptTrace) -> anyhow::Result<JobSuccess> {
        let prompt = match &job.prompt {
            Some(prompt) => prompt.clone(),
            None => {
                let findings = self
                    .queue
                    .investigations()
                    .findings(job.investigation_id)
                    .await
                    .with_context(|| format!("failed to load findings for investigation {}", job.investigation_id))?;
                debug!(job_id = %job.id, findings = findings.len(), "building prompt from findings");
                build_prompt(&findings, job.job_type)
            }
        };
        let model = job
            .model
            .clone()
            .unwrap_or_else(|| self.models.for_job(job.job_type).to_string());

        trace.prompt = Some(prompt.clone());
        trace.model = Some(model.clone());
        trace.request_started_at = Some(Utc::now());

        let response = self.client.generate(&GenerationRequest::new(prompt, model)).await?;

        trace.response_received_at = Some(Utc::now());
        trace.generation = Some(response.metrics.clone());
        trace.http = Some(response.http.clone());

        let structured = parse_completion(&response.text, job.job_type);
        debug!(
            job_id = %job.id,
            model = %response.model,
            done_reason = ?response.done_reason,
            eval_count = ?response.metrics.eval_count,
            sections = structured.sections.len(),
            "generation completed"
        );

        Ok(JobSuccess {
            raw_result: response.text,
            result_format: RESULT_FORMAT_VERSION.to_string(),
            structured,
            debug: if job.debug { trace.debug_info() } else { None },
        })
    }

    async fn sweep_expired_leases(&self, last_sweep: &mut Option<Instant>) {
        let Some(interval) = self.config.lease_sweep_interval else {
            return;
        };
        if last_sweep.is_some_and(|at| at.elapsed() < interval) {
            return;
        }
        *last_sweep = Some(Instant::now());

        match self.queue.recover_expired_leases().await {
            Ok(recovered) if !recovered.is_empty() => {
                self.stats
                    .lease_recoveries
                    .fetch_add(recovered.len() as u64, Ordering::Relaxed);
                warn!(worker = %self.config.worker_id, count = recovered.len(), "recovered expired AI job leases");
            }
            Ok(_) => {}
            Err(err) => {
                error!(worker = %self.config.worker_id, error = %err, "lease recovery sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use casefile_ai::{AiJobType, GenerationError, GenerationResponse};
    use tokio::sync::Notify;
    use casefile_core::{Finding, FindingId, InvestigationId};

    use crate::investigations::InMemoryInvestigationReader;
    use crate::jobs::{InMemoryJobStore, JobQueueConfig, JobStatus};

    const INV: InvestigationId = InvestigationId::new(1);

    /// Replays scripted replies and records the requests it saw.
    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<Vec<Result<String, GenerationError>>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedClient {
        fn new(mut replies: Vec<Result<String, GenerationError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                requests: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(GenerationError::Network("no scripted reply".into())))?;
            Ok(response(request, reply))
        }
    }

    /// Blocks every generation until released, announcing when it starts.
    #[derive(Default)]
    struct GatedClient {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl GenerationClient for GatedClient {
        fn provider(&self) -> &str {
            "gated"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, GenerationError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(response(request, ANALYSIS_REPLY.into()))
        }
    }

    fn response(request: &GenerationRequest, text: String) -> GenerationResponse {
        GenerationResponse {
            text,
            model: request.model.clone(),
            done_reason: Some("stop".into()),
            metrics: GenerationMetrics {
                eval_count: Some(42),
                ..Default::default()
            },
            http: HttpMetrics {
                status_code: 200,
                attempts: 1,
                ..Default::default()
            },
        }
    }

    fn worker(
        client: Arc<dyn GenerationClient>,
    ) -> (AiJobWorker<Arc<InMemoryJobStore>>, Arc<JobQueueService<Arc<InMemoryJobStore>>>) {
        let reader = InMemoryInvestigationReader::with_findings([
            Finding::new(FindingId::new(1), INV, "spiderfoot", "EMAILADDR", Utc::now())
                .with_summary("alice@example.com"),
        ])
        .unwrap();
        let queue = Arc::new(JobQueueService::new(
            InMemoryJobStore::arc(),
            Arc::new(reader),
            JobQueueConfig {
                retry_backoff: Duration::ZERO,
                ..Default::default()
            },
        ));
        let worker = AiJobWorker::new(
            queue.clone(),
            client,
            ModelDefaults {
                analysis: "analysis-model".into(),
                inference: "inference-model".into(),
            },
            AiJobWorkerConfig::default().with_worker_id("test-worker"),
        );
        (worker, queue)
    }

    const ANALYSIS_REPLY: &str = "## Executive Summary\nA\n## Key Findings\nB\n## Entities & Relationships\nC\n## Risk Assessment\nD\n## Recommended Next Steps\nE";

    #[tokio::test]
    async fn builds_prompt_and_default_model_when_absent() {
        let client = ScriptedClient::new(vec![Ok(ANALYSIS_REPLY.into())]);
        let (worker, queue) = worker(client.clone());
        let job = queue.enqueue(INV, AiJobType::Analysis, None, None, true).await.unwrap();

        let (id, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!((id, outcome), (job.id, JobOutcome::Succeeded));

        let request = client.requests.lock().unwrap()[0].clone();
        assert_eq!(request.model, "analysis-model");
        assert!(request.prompt.contains("alice@example.com"));

        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.structured_result.unwrap().sections.len(), 5);
        let debug = stored.debug_info.unwrap();
        assert_eq!(debug.model, "analysis-model");
        assert_eq!(debug.prompt_length, request.prompt.chars().count());
        assert_eq!(debug.generation.unwrap().eval_count, Some(42));
        assert_eq!(worker.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn explicit_prompt_and_model_are_used_verbatim() {
        let client = ScriptedClient::new(vec![Ok("plain text".into())]);
        let (worker, queue) = worker(client.clone());
        let job = queue
            .enqueue(INV, AiJobType::Inference, Some("custom".into()), Some("my prompt".into()), false)
            .await
            .unwrap();

        worker.run_once().await.unwrap();

        let request = client.requests.lock().unwrap()[0].clone();
        assert_eq!(request, GenerationRequest::new("my prompt", "custom"));
        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.debug_info.is_none());
        assert_eq!(stored.structured_result.unwrap().sections[0].key, "full_response");
    }

    #[tokio::test]
    async fn non_retryable_fault_fails_job_with_debug_trace() {
        let client = ScriptedClient::new(vec![Err(GenerationError::Service {
            code: "ollama_model_not_found".into(),
            message: "model not found".into(),
            status: Some(404),
            status_name: Some("Not Found".into()),
            retryable: false,
        })]);
        let (worker, queue) = worker(client);
        let job = queue.enqueue(INV, AiJobType::Analysis, None, None, true).await.unwrap();

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Failed);

        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let info = stored.error_info.unwrap();
        assert_eq!(info.code, "ollama_model_not_found");
        assert_eq!(info.metadata.unwrap()["http_status"], serde_json::json!(404));
        let debug = stored.debug_info.unwrap();
        assert!(debug.response_received_at.is_none());
    }

    #[tokio::test]
    async fn retryable_fault_requeues_then_succeeds() {
        let client = ScriptedClient::new(vec![
            Err(GenerationError::Timeout("30s".into())),
            Ok(ANALYSIS_REPLY.into()),
        ]);
        let (worker, queue) = worker(client);
        let job = queue.enqueue(INV, AiJobType::Analysis, None, None, false).await.unwrap();

        assert_eq!(worker.run_once().await.unwrap().unwrap().1, JobOutcome::Requeued);
        let requeued = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.error_info.unwrap().code, "ollama_timeout");

        assert_eq!(worker.run_once().await.unwrap().unwrap().1, JobOutcome::Succeeded);
        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.error.is_none());
        assert_eq!(worker.stats().jobs_requeued, 1);
    }

    #[tokio::test]
    async fn spawned_worker_drains_queue_and_shuts_down() {
        let client = ScriptedClient::new(vec![Ok(ANALYSIS_REPLY.into()), Ok(ANALYSIS_REPLY.into())]);
        let (worker, queue) = worker(client);
        let a = queue.enqueue(INV, AiJobType::Analysis, None, None, false).await.unwrap();
        let b = queue.enqueue(INV, AiJobType::Analysis, None, None, false).await.unwrap();

        let handle = worker.spawn();
        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.stats().jobs_succeeded, 2);
        handle.shutdown().await.unwrap();

        for id in [a.id, b.id] {
            assert_eq!(queue.get_job(id).await.unwrap().unwrap().status, JobStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn result_for_job_cancelled_mid_generation_is_dropped() {
        let client = Arc::new(GatedClient::default());
        let (worker, queue) = worker(client.clone());
        let worker = Arc::new(worker);
        let job = queue.enqueue(INV, AiJobType::Analysis, None, None, false).await.unwrap();

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run_once().await }
        });
        client.started.notified().await;
        queue.cancel_job(job.id).await.unwrap();
        client.release.notify_one();

        let (id, outcome) = task.await.unwrap().unwrap().unwrap();
        assert_eq!((id, outcome), (job.id, JobOutcome::Dropped));

        let stats = worker.stats();
        assert_eq!(stats.jobs_succeeded, 0);
        assert_eq!(stats.results_dropped, 1);
        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.result.is_none() && stored.structured_result.is_none());
    }

    #[tokio::test]
    async fn shutdown_leaves_in_flight_job_running_for_lease_recovery() {
        let client = Arc::new(GatedClient::default());
        let (worker, queue) = worker(client.clone());
        let job = queue.enqueue(INV, AiJobType::Analysis, None, None, false).await.unwrap();

        let handle = worker.spawn();
        client.started.notified().await;
        handle.shutdown().await.unwrap();

        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.worker_id.as_deref(), Some("test-worker"));
        assert!(stored.result.is_none());
    }
}
