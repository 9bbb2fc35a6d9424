//! Synchronous backend: `push` runs the job before returning.
//!
//! Nothing is stored, so there is nothing for a worker to poll. Job errors
//! propagate straight out of `push`.

use super::{AdapterContext, AdapterFactory, QueueAdapter, RunOutcome, SharedPollState};
use crate::error::CourierResult;
use crate::job::{JobEnvelope, JobId};
use async_trait::async_trait;
use std::sync::Arc;

/// Inline backend.
#[derive(Debug)]
pub struct SyncQueue {
    context: AdapterContext,
    poll: SharedPollState,
}

impl SyncQueue {
    pub fn new(context: AdapterContext) -> Self {
        Self {
            context,
            poll: SharedPollState::default(),
        }
    }
}

#[async_trait]
impl QueueAdapter for SyncQueue {
    fn driver(&self) -> &'static str {
        "sync"
    }

    fn poll_state(&self) -> &SharedPollState {
        &self.poll
    }

    async fn push(&self, envelope: JobEnvelope) -> CourierResult<JobId> {
        tracing::debug!(
            "Running job {} ({}) inline",
            envelope.id,
            envelope.job_type
        );
        super::record_push(self.driver(), &envelope.queue);

        match self.context.registry.execute(&envelope).await {
            Ok(()) => {
                super::record_outcome(self.driver(), &envelope.queue, RunOutcome::Completed);
                Ok(envelope.id)
            }
            Err(failure) => {
                tracing::error!(
                    "Inline job {} ({}) failed: {}",
                    envelope.id,
                    envelope.job_type,
                    failure.error
                );
                Err(failure.error)
            }
        }
    }

    async fn run(&self, _queue: &str) -> CourierResult<RunOutcome> {
        Ok(RunOutcome::Idle)
    }

    async fn size(&self, _queue: &str) -> CourierResult<u64> {
        Ok(0)
    }

    async fn delete(&self, _queue: &str, _id: &str) -> CourierResult<bool> {
        Ok(false)
    }
}

/// Factory for the `sync` driver. Takes no settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncFactory;

#[async_trait]
impl AdapterFactory for SyncFactory {
    async fn configure(
        &self,
        _connection: &str,
        _config: &serde_json::Value,
        context: &AdapterContext,
    ) -> CourierResult<Arc<dyn QueueAdapter>> {
        Ok(Arc::new(SyncQueue::new(context.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobRegistry;
    use crate::error::CourierError;
    use crate::job::Job;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Serialize, Deserialize)]
    struct Tally {
        fail: bool,
    }

    #[async_trait]
    impl Job for Tally {
        fn job_type() -> &'static str {
            "sync_tally"
        }

        async fn process(&self) -> CourierResult<()> {
            RUNS.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CourierError::job("tally refused"))
            } else {
                Ok(())
            }
        }
    }

    fn adapter() -> SyncQueue {
        let mut registry = JobRegistry::new();
        registry.register::<Tally>();
        SyncQueue::new(AdapterContext::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_push_runs_inline_and_propagates_errors() {
        let queue = adapter();
        let before = RUNS.load(Ordering::SeqCst);

        let envelope = JobEnvelope::from_job(&Tally { fail: false }).unwrap();
        let id = queue.push(envelope.clone()).await.unwrap();
        assert_eq!(id, envelope.id);
        assert_eq!(RUNS.load(Ordering::SeqCst), before + 1);

        let failing = JobEnvelope::from_job(&Tally { fail: true }).unwrap();
        let err = queue.push(failing).await.unwrap_err();
        assert!(matches!(err, CourierError::JobFailed { .. }));
        assert_eq!(RUNS.load(Ordering::SeqCst), before + 2);

        assert_eq!(queue.run("default").await.unwrap(), RunOutcome::Idle);
        assert_eq!(queue.size("default").await.unwrap(), 0);
    }
}
