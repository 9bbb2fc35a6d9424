//! Cloud queue backend (SQS semantics).
//!
//! [`CloudQueue`] holds the job-handling logic and talks to the service
//! through a [`CloudQueueClient`]. Two transports ship with the crate:
//! [`SqsClient`] (feature `sqs-queue`) and [`InMemoryCloudClient`], which
//! emulates visibility timeouts and receive counts in process.
//!
//! A received message stays invisible for the visibility timeout. Success
//! deletes it. A retriable failure shortens its visibility to the job's
//! backoff, so the service redelivers it with a higher receive count; once
//! the receive count exceeds the retry budget the message is deleted.

use super::{
    AdapterContext, Delivery, Execution, PollState, QueueAdapter, RunOutcome, SharedPollState,
};
use crate::core::failure::{RetryDecision, decide, retries_left, retry_budget};
use crate::error::CourierResult;
use crate::job::{JobEnvelope, JobId};
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub use memory::{InMemoryCloudClient, MemoryQueueFactory};

#[cfg(feature = "sqs-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqs-queue")))]
pub mod sqs;

#[cfg(feature = "sqs-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqs-queue")))]
pub use sqs::{SqsClient, SqsFactory};

/// Longest delay SQS accepts on a message.
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Longest visibility timeout SQS accepts.
pub const MAX_VISIBILITY: Duration = Duration::from_secs(43_200);

/// A message handed out by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Service-assigned message id
    pub message_id: String,
    /// Handle used to delete or re-time this delivery
    pub receipt_handle: String,
    /// Message body
    pub body: String,
    /// How many times the message has been received, this delivery included
    pub receive_count: u32,
}

/// Transport to an SQS-style queue service.
#[async_trait]
pub trait CloudQueueClient: Send + Sync + std::fmt::Debug {
    /// Send a message, invisible for `delay`. Returns the message id.
    async fn send_message(&self, queue: &str, body: String, delay: Duration)
    -> CourierResult<String>;

    /// Receive at most one message, long-polling up to `wait`.
    async fn receive_message(
        &self,
        queue: &str,
        wait: Duration,
        visibility: Duration,
    ) -> CourierResult<Option<ReceivedMessage>>;

    /// Delete a received message. Returns `false` for an unknown handle.
    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> CourierResult<bool>;

    /// Make a received message visible again after `timeout`.
    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> CourierResult<()>;

    /// Approximate number of messages in the queue, in flight ones included.
    async fn approximate_size(&self, queue: &str) -> CourierResult<u64>;

    async fn health_check(&self) -> CourierResult<()> {
        Ok(())
    }
}

/// Polling parameters of a cloud queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudSettings {
    /// Long-poll wait per receive
    pub wait: Duration,
    /// Visibility timeout of received messages
    pub visibility: Duration,
}

/// Queue adapter on top of a cloud queue transport.
#[derive(Debug)]
pub struct CloudQueue<C> {
    driver: &'static str,
    client: C,
    settings: CloudSettings,
    context: AdapterContext,
    poll: SharedPollState,
}

impl<C: CloudQueueClient> CloudQueue<C> {
    pub fn new(
        driver: &'static str,
        client: C,
        settings: CloudSettings,
        context: AdapterContext,
    ) -> Self {
        // The long poll already waits; an empty receive goes straight to the next one.
        let poll = SharedPollState::new(PollState {
            sleep: Duration::ZERO,
            job_timeout: Some(settings.visibility),
            ..Default::default()
        });

        Self {
            driver,
            client,
            settings,
            context,
            poll,
        }
    }

    /// The transport.
    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: CloudQueueClient + 'static> QueueAdapter for CloudQueue<C> {
    fn driver(&self) -> &'static str {
        self.driver
    }

    fn poll_state(&self) -> &SharedPollState {
        &self.poll
    }

    async fn push(&self, envelope: JobEnvelope) -> CourierResult<JobId> {
        let mut delay = envelope.delay();
        if delay > MAX_DELAY {
            tracing::warn!(
                "Job {} delay {:?} exceeds the {:?} queue limit, clamping",
                envelope.id,
                delay,
                MAX_DELAY
            );
            delay = MAX_DELAY;
        }

        let message_id = self
            .client
            .send_message(&envelope.queue, envelope.encode()?, delay)
            .await?;

        tracing::debug!(
            "Pushed job {} ({}) to {} queue {} as message {}",
            envelope.id,
            envelope.job_type,
            self.driver,
            envelope.queue,
            message_id
        );
        super::record_push(self.driver, &envelope.queue);
        Ok(message_id)
    }

    async fn run(&self, queue: &str) -> CourierResult<RunOutcome> {
        let state = self.poll.snapshot();

        let Some(message) = self
            .client
            .receive_message(queue, self.settings.wait, self.settings.visibility)
            .await?
        else {
            super::record_outcome(self.driver, queue, RunOutcome::Idle);
            return Ok(RunOutcome::Idle);
        };

        let delivery = Delivery {
            backend: self.driver,
            queue,
            record_id: &message.message_id,
            raw: &message.body,
        };

        let outcome = match self.context.execute(&delivery, state.job_timeout).await {
            Execution::Completed(envelope) => {
                self.client
                    .delete_message(queue, &message.receipt_handle)
                    .await?;
                tracing::info!("Job {} ({}) processed", envelope.id, envelope.job_type);
                RunOutcome::Completed
            }
            Execution::Failed { envelope, failure } => {
                let (retries, backoff) = envelope
                    .as_ref()
                    .map(|e| (e.retries, e.backoff()))
                    .unwrap_or_default();
                let left = retries_left(retry_budget(retries, state.retry), message.receive_count);
                let decision = decide(failure.disposition, left, backoff);

                match decision {
                    RetryDecision::Release { remaining, backoff } => {
                        self.client
                            .change_visibility(
                                queue,
                                &message.receipt_handle,
                                backoff.min(MAX_VISIBILITY),
                            )
                            .await?;
                        tracing::warn!(
                            "Message {} released with {} retries left, visible in {:?}",
                            message.message_id,
                            remaining,
                            backoff
                        );
                    }
                    RetryDecision::Remove(reason) => {
                        self.client
                            .delete_message(queue, &message.receipt_handle)
                            .await?;
                        tracing::warn!("Message {} removed: {:?}", message.message_id, reason);
                    }
                }

                self.context
                    .quarantine(&delivery, envelope.as_ref(), &failure, decision)
                    .await;
                decision.into()
            }
        };

        super::record_outcome(self.driver, queue, outcome);
        Ok(outcome)
    }

    async fn size(&self, queue: &str) -> CourierResult<u64> {
        self.client.approximate_size(queue).await
    }

    /// `id` is the receipt handle of a received message.
    async fn delete(&self, queue: &str, id: &str) -> CourierResult<bool> {
        self.client.delete_message(queue, id).await
    }

    async fn health_check(&self) -> CourierResult<()> {
        self.client.health_check().await
    }
}
