//! Queue backends for courierq.
//!
//! Every backend implements [`QueueAdapter`]:
//! - **Sync**: runs the job inline inside `push`, for tests and local development
//! - **Database**: a SQLite jobs table, polled by workers
//! - **Cloud**: an SQS-style queue service (`sqs` driver) or its in-process
//!   emulation (`memory` driver)
//! - **Beanstalk**: a beanstalkd daemon on a TCP socket
//!
//! Adapters are built from configuration by an [`AdapterFactory`]; see
//! [`AdapterRegistry`](crate::core::AdapterRegistry).

use crate::cache::FailedJobCache;
use crate::clock::{Clock, SystemClock};
use crate::core::JobRegistry;
use crate::core::failure::{self, FailedJob, JobFailure, RemovalReason, RetryDecision};
use crate::error::CourierResult;
use crate::job::{JobEnvelope, JobId};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub mod beanstalk;
pub mod cloud;
pub mod sync;

#[cfg(feature = "database-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "database-queue")))]
pub mod database;

pub use beanstalk::{BeanstalkFactory, BeanstalkQueue};
pub use cloud::{CloudQueue, CloudQueueClient, InMemoryCloudClient, MemoryQueueFactory};
pub use sync::{SyncFactory, SyncQueue};

#[cfg(feature = "database-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "database-queue")))]
pub use database::{DatabaseFactory, DatabaseQueue};

#[cfg(feature = "sqs-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqs-queue")))]
pub use cloud::{SqsClient, SqsFactory};

/// Result of a single poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was due
    Idle,
    /// A job ran and was acknowledged
    Completed,
    /// A job failed and was put back with its backoff
    Retried,
    /// A job failed and left the queue for good
    Removed(RemovalReason),
}

impl RunOutcome {
    /// Whether a job was handled during this cycle.
    pub fn handled_job(&self) -> bool {
        !matches!(self, RunOutcome::Idle)
    }

    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Idle => "idle",
            RunOutcome::Completed => "completed",
            RunOutcome::Retried => "retried",
            RunOutcome::Removed(_) => "removed",
        }
    }
}

impl From<RetryDecision> for RunOutcome {
    fn from(decision: RetryDecision) -> Self {
        match decision {
            RetryDecision::Release { .. } => RunOutcome::Retried,
            RetryDecision::Remove(reason) => RunOutcome::Removed(reason),
        }
    }
}

/// Polling settings a worker hands to its adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    /// Queue consumed by [`QueueAdapter::run_watched`]
    pub watch: String,
    /// Ceiling on the retries any job gets; `None` keeps each job's own budget
    pub retry: Option<u32>,
    /// Pause after an empty poll
    pub sleep: Duration,
    /// Upper bound on a single `process()` call
    pub job_timeout: Option<Duration>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            watch: crate::job::DEFAULT_QUEUE.to_string(),
            retry: None,
            sleep: Duration::from_secs(3),
            job_timeout: None,
        }
    }
}

/// [`PollState`] shared between an adapter and the worker driving it.
#[derive(Debug, Default)]
pub struct SharedPollState {
    inner: RwLock<PollState>,
}

impl SharedPollState {
    pub fn new(state: PollState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    /// Current settings.
    pub fn snapshot(&self) -> PollState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut PollState)) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }
}

/// Trait that all queue backends must implement.
///
/// `run` performs exactly one poll cycle and is safe to call in a loop. Job
/// failures never surface as `Err` from `run`: they are logged and routed
/// through the retry policy. `Err` means the backend itself misbehaved.
///
/// Delivery is at-least-once: a worker that dies after `process()` returns
/// but before the acknowledgement reaches the backend will see the job again.
#[async_trait]
pub trait QueueAdapter: Send + Sync + std::fmt::Debug {
    /// Driver name, used in logs and metrics
    fn driver(&self) -> &'static str;

    /// Polling settings of this adapter
    fn poll_state(&self) -> &SharedPollState;

    /// Enqueue a job and return the id the backend assigned to it.
    async fn push(&self, envelope: JobEnvelope) -> CourierResult<JobId>;

    /// Take at most one due job from `queue`, run it, and acknowledge or fail it.
    async fn run(&self, queue: &str) -> CourierResult<RunOutcome>;

    /// `run` on the queue selected with [`set_watch`](Self::set_watch).
    async fn run_watched(&self) -> CourierResult<RunOutcome> {
        let queue = self.poll_state().snapshot().watch;
        self.run(&queue).await
    }

    /// Number of jobs on `queue` that have not been processed yet.
    async fn size(&self, queue: &str) -> CourierResult<u64>;

    /// Remove a single record. Returns `false` if it was not there.
    async fn delete(&self, queue: &str, id: &str) -> CourierResult<bool>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> CourierResult<()> {
        Ok(())
    }

    /// Select the queue consumed by `run_watched`.
    fn set_watch(&self, queue: &str) {
        self.poll_state().update(|state| state.watch = queue.to_string());
    }

    /// Cap the retries of every job handled by this adapter.
    fn set_retry(&self, retry: Option<u32>) {
        self.poll_state().update(|state| state.retry = retry);
    }

    /// Set the pause a worker takes after an empty poll.
    fn set_sleep(&self, sleep: Duration) {
        self.poll_state().update(|state| state.sleep = sleep);
    }
}

/// Builds an adapter from one `connections.<name>` entry.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Validate `config` and build the adapter. Must not contact the backend.
    async fn configure(
        &self,
        connection: &str,
        config: &serde_json::Value,
        context: &AdapterContext,
    ) -> CourierResult<Arc<dyn QueueAdapter>>;
}

/// Collaborators every adapter receives.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Job types the adapter can run
    pub registry: Arc<JobRegistry>,
    /// Where failed jobs are quarantined
    pub cache: Option<Arc<dyn FailedJobCache>>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl AdapterContext {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            cache: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Attach a failed-job cache.
    pub fn with_cache(mut self, cache: Arc<dyn FailedJobCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// A job taken from a backend, decoded as far as possible.
pub(crate) struct Delivery<'a> {
    pub backend: &'static str,
    pub queue: &'a str,
    /// Backend record id (row id, message id, beanstalk job id)
    pub record_id: &'a str,
    pub raw: &'a str,
}

/// How a delivered job went.
pub(crate) enum Execution {
    Completed(JobEnvelope),
    Failed {
        envelope: Option<JobEnvelope>,
        failure: JobFailure,
    },
}

impl AdapterContext {
    /// Decode a delivered payload and run it.
    pub(crate) async fn execute(
        &self,
        delivery: &Delivery<'_>,
        limit: Option<Duration>,
    ) -> Execution {
        let envelope = match JobEnvelope::decode(delivery.raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(
                    "Undecodable payload for {} job {} on queue {}: {}",
                    delivery.backend,
                    delivery.record_id,
                    delivery.queue,
                    error
                );
                return Execution::Failed {
                    envelope: None,
                    failure: JobFailure::corrupt(error),
                };
            }
        };

        tracing::debug!(
            "Running job {} ({}) from {} queue {}",
            envelope.id,
            envelope.job_type,
            delivery.backend,
            delivery.queue
        );

        match self.registry.execute_with_timeout(&envelope, limit).await {
            Ok(()) => Execution::Completed(envelope),
            Err(failure) => {
                tracing::error!(
                    "Job {} ({}) failed: {}",
                    envelope.id,
                    envelope.job_type,
                    failure.error
                );
                Execution::Failed {
                    envelope: Some(envelope),
                    failure,
                }
            }
        }
    }

    /// Record a failure in the failed-job cache.
    pub(crate) async fn quarantine(
        &self,
        delivery: &Delivery<'_>,
        envelope: Option<&JobEnvelope>,
        failure: &JobFailure,
        decision: RetryDecision,
    ) {
        let record = FailedJob {
            id: envelope.map_or_else(|| delivery.record_id.to_string(), |e| e.id.clone()),
            backend: delivery.backend.to_string(),
            queue: delivery.queue.to_string(),
            job_type: envelope.map(|e| e.job_type.clone()),
            payload: delivery.raw.to_string(),
            error: failure.error.to_string(),
            disposition: failure.disposition,
            released: decision.is_release(),
            failed_at: self.clock.now_secs(),
        };
        failure::quarantine(self.cache.as_ref(), &record).await;
    }
}

/// Count a poll outcome.
pub(crate) fn record_outcome(backend: &'static str, queue: &str, outcome: RunOutcome) {
    tracing::trace!("{} queue {}: {}", backend, queue, outcome.label());
    #[cfg(feature = "metrics")]
    crate::metrics::record_outcome(backend, queue, outcome.label());
}

/// Count a pushed job.
pub(crate) fn record_push(backend: &'static str, queue: &str) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_push(backend, queue);
    #[cfg(not(feature = "metrics"))]
    let _ = (backend, queue);
}
