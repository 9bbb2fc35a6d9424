//! Worker loop.
//!
//! A worker drives one adapter: it polls the watched queue, sleeps when the
//! queue is empty, backs off when the backend misbehaves, and stops when its
//! [`CancellationToken`] fires. The token is only checked between poll
//! cycles, so a job that has started always finishes and is acknowledged.

use crate::config::WorkerConfig;
use crate::queue::{QueueAdapter, RunOutcome};
use crate::utils::calculate_backoff;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Counters collected while a worker runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    /// Jobs processed successfully
    pub jobs_completed: u64,
    /// Jobs that failed and were put back
    pub jobs_retried: u64,
    /// Jobs that failed and were removed or buried
    pub jobs_removed: u64,
    /// Poll cycles that found nothing
    pub idle_polls: u64,
    /// Poll cycles that failed because of the backend
    pub backend_errors: u64,
    /// Average time spent in a poll cycle that handled a job
    pub avg_job_duration: Option<Duration>,
}

impl WorkerStats {
    /// Jobs handled, whatever the outcome.
    pub fn jobs_handled(&self) -> u64 {
        self.jobs_completed + self.jobs_retried + self.jobs_removed
    }

    fn record(&mut self, outcome: RunOutcome, duration: Duration) {
        match outcome {
            RunOutcome::Idle => {
                self.idle_polls += 1;
                return;
            }
            RunOutcome::Completed => self.jobs_completed += 1,
            RunOutcome::Retried => self.jobs_retried += 1,
            RunOutcome::Removed(_) => self.jobs_removed += 1,
        }

        self.avg_job_duration = Some(match self.avg_job_duration {
            Some(avg) => (avg + duration) / 2,
            None => duration,
        });
    }
}

/// Polls one adapter until told to stop.
pub struct Worker {
    adapter: Arc<dyn QueueAdapter>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("driver", &self.adapter.driver())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(adapter: Arc<dyn QueueAdapter>) -> Self {
        Self {
            adapter,
            config: WorkerConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use the given worker settings.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Switch to another adapter.
    pub fn set_connection(&mut self, adapter: Arc<dyn QueueAdapter>) {
        self.adapter = adapter;
    }

    /// Token that stops this worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll `queue` until shutdown, applying `retry` as the retry ceiling.
    ///
    /// Also stops after `max_jobs` handled jobs, or at the first empty poll
    /// when `stop_when_empty` is set.
    pub async fn run(&self, queue: &str, retry: Option<u32>) -> WorkerStats {
        self.adapter.set_watch(queue);
        self.adapter.set_retry(retry);
        if let Some(sleep_ms) = self.config.idle_sleep_ms {
            self.adapter.set_sleep(Duration::from_millis(sleep_ms));
        }

        tracing::info!(
            "Worker started on {} queue '{}' (retry ceiling: {:?})",
            self.adapter.driver(),
            queue,
            retry
        );

        let mut stats = WorkerStats::default();
        let mut consecutive_errors = 0u32;
        let salt = u64::from(std::process::id());

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("Worker on '{}' received shutdown", queue);
                break;
            }
            if self
                .config
                .max_jobs
                .is_some_and(|max| stats.jobs_handled() >= max)
            {
                tracing::info!("Worker on '{}' reached its job limit", queue);
                break;
            }

            let started = Instant::now();
            match self.adapter.run_watched().await {
                Ok(RunOutcome::Idle) => {
                    consecutive_errors = 0;
                    stats.record(RunOutcome::Idle, started.elapsed());
                    if self.config.stop_when_empty {
                        tracing::info!("Queue '{}' is empty, worker stopping", queue);
                        break;
                    }

                    let sleep = self.adapter.poll_state().snapshot().sleep;
                    if !self.pause(sleep).await {
                        break;
                    }
                }
                Ok(outcome) => {
                    consecutive_errors = 0;
                    stats.record(outcome, started.elapsed());
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    stats.backend_errors += 1;
                    let backoff_ms = calculate_backoff(consecutive_errors, salt)
                        .min(self.config.error_backoff_max_ms);

                    tracing::error!(
                        "Polling '{}' failed ({} in a row), retrying in {}ms: {}",
                        queue,
                        consecutive_errors,
                        backoff_ms,
                        e
                    );
                    if !self.pause(Duration::from_millis(backoff_ms)).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "Worker on '{}' finished: {} completed, {} retried, {} removed, {} backend errors",
            queue,
            stats.jobs_completed,
            stats.jobs_retried,
            stats.jobs_removed,
            stats.backend_errors
        );
        stats
    }

    /// Sleep unless shutdown comes first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return !self.shutdown.is_cancelled();
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
