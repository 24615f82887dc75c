//! AI job queue: persistence, state transitions and the background worker.
//!
//! ## Components
//!
//! - `Job`: the persisted job record and its state machine
//! - `JobStore`: persistence (in-memory or Postgres), with an atomic claim
//! - `JobQueueService`: the only writer of job state after creation
//! - `AiJobWorker`: polling loop that executes claimed jobs

pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use postgres::PostgresJobStore;
pub use queue::{CODE_LEASE_EXPIRED, JobQueueConfig, JobQueueError, JobQueueService};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobFailure, JobStatus, JobSuccess, MAX_RETRY_BACKOFF, NewJob};
pub use worker::{
    AiJobWorker, AiJobWorkerConfig, AiJobWorkerHandle, JobOutcome, WorkerStats, WorkerStatsSnapshot,
};
