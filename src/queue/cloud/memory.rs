//! In-process cloud queue transport.
//!
//! Messages live in memory with the same visibility-timeout model as SQS:
//! receiving a message hides it for the visibility timeout and bumps its
//! receive count, and a message that is neither deleted nor re-timed simply
//! reappears. Suitable for development, tests and single-process
//! deployments where losing queued jobs on restart is acceptable.

use super::{CloudQueue, CloudQueueClient, CloudSettings, ReceivedMessage};
use crate::clock::{Clock, SystemClock};
use crate::config::{MemoryQueueConfig, parse_backend_config};
use crate::error::{CourierError, CourierResult};
use crate::queue::{AdapterContext, AdapterFactory, QueueAdapter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    visible_at: SystemTime,
    receive_count: u32,
    receipt_handle: Option<String>,
}

/// In-memory message store with visibility timeouts.
#[derive(Debug)]
pub struct InMemoryCloudClient {
    /// Messages per queue, in send order
    queues: Mutex<HashMap<String, Vec<StoredMessage>>>,
    /// Wakes long polls when a message is sent or re-timed
    notify: Notify,
    clock: Arc<dyn Clock>,
    /// Maximum number of messages per queue (0 = unlimited)
    max_queue_size: usize,
}

impl Default for InMemoryCloudClient {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryCloudClient {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            clock,
            max_queue_size: 0,
        }
    }

    /// Limit the number of messages held per queue.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Hand out the first visible message of `queue`, if any.
    async fn try_receive(&self, queue: &str, visibility: Duration) -> Option<ReceivedMessage> {
        let now = self.clock.now();
        let mut queues = self.queues.lock().await;
        let message = queues
            .get_mut(queue)?
            .iter_mut()
            .find(|message| message.visible_at <= now)?;

        let receipt_handle = uuid::Uuid::new_v4().to_string();
        message.visible_at = now + visibility;
        message.receive_count += 1;
        message.receipt_handle = Some(receipt_handle.clone());

        tracing::trace!(
            "Received message {} from {} (receive count {})",
            message.id,
            queue,
            message.receive_count
        );

        Some(ReceivedMessage {
            message_id: message.id.clone(),
            receipt_handle,
            body: message.body.clone(),
            receive_count: message.receive_count,
        })
    }
}

#[async_trait]
impl CloudQueueClient for InMemoryCloudClient {
    async fn send_message(
        &self,
        queue: &str,
        body: String,
        delay: Duration,
    ) -> CourierResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut queues = self.queues.lock().await;
            let messages = queues.entry(queue.to_string()).or_default();

            if self.max_queue_size > 0 && messages.len() >= self.max_queue_size {
                return Err(CourierError::queue_msg(format!(
                    "Queue '{}' is full (max size: {})",
                    queue, self.max_queue_size
                )));
            }

            messages.push(StoredMessage {
                id: id.clone(),
                body,
                visible_at: self.clock.now() + delay,
                receive_count: 0,
                receipt_handle: None,
            });
        }

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive_message(
        &self,
        queue: &str,
        wait: Duration,
        visibility: Duration,
    ) -> CourierResult<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            // Register before checking so a send in between is not missed.
            let notified = self.notify.notified();

            if let Some(message) = self.try_receive(queue, visibility).await {
                return Ok(Some(message));
            }

            if wait.is_zero() || timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> CourierResult<bool> {
        let mut queues = self.queues.lock().await;
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(false);
        };

        let before = messages.len();
        messages.retain(|message| message.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(messages.len() < before)
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> CourierResult<()> {
        {
            let mut queues = self.queues.lock().await;
            let message = queues
                .get_mut(queue)
                .and_then(|messages| {
                    messages
                        .iter_mut()
                        .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
                })
                .ok_or_else(|| {
                    CourierError::queue_msg(format!(
                        "Unknown receipt handle '{receipt_handle}' on queue '{queue}'"
                    ))
                })?;
            message.visible_at = self.clock.now() + timeout;
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn approximate_size(&self, queue: &str) -> CourierResult<u64> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, |messages| messages.len() as u64))
    }
}

/// Factory for the `memory` driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryQueueFactory;

#[async_trait]
impl AdapterFactory for MemoryQueueFactory {
    async fn configure(
        &self,
        connection: &str,
        config: &serde_json::Value,
        context: &AdapterContext,
    ) -> CourierResult<Arc<dyn QueueAdapter>> {
        let config: MemoryQueueConfig = parse_backend_config(connection, config)?;
        if config.visibility_timeout_secs == 0 {
            return Err(CourierError::config(format!(
                "`connections.{connection}.visibility_timeout_secs` must be greater than 0"
            )));
        }

        let client = InMemoryCloudClient::new(context.clock.clone())
            .with_max_queue_size(config.max_queue_size);
        let settings = CloudSettings {
            wait: Duration::from_millis(config.wait_time_ms),
            visibility: Duration::from_secs(config.visibility_timeout_secs),
        };

        Ok(Arc::new(CloudQueue::new(
            "memory",
            client,
            settings,
            context.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_visibility_timeout_redelivers() {
        let clock = Arc::new(MockClock::at_secs(1_000));
        let client = InMemoryCloudClient::new(clock.clone());
        client
            .send_message("q", "hello".to_string(), Duration::ZERO)
            .await
            .unwrap();

        let first = client
            .receive_message("q", Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.receive_count, 1);
        assert!(
            client
                .receive_message("q", Duration::ZERO, VISIBILITY)
                .await
                .unwrap()
                .is_none()
        );

        clock.advance(VISIBILITY);
        let second = client
            .receive_message("q", Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.receive_count, 2);

        // The stale handle no longer matches
        assert!(!client.delete_message("q", &first.receipt_handle).await.unwrap());
        assert!(client.delete_message("q", &second.receipt_handle).await.unwrap());
        assert_eq!(client.approximate_size("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delay_and_queue_isolation() {
        let clock = Arc::new(MockClock::at_secs(1_000));
        let client = InMemoryCloudClient::new(clock.clone());
        client
            .send_message("a", "later".to_string(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(
            client
                .receive_message("a", Duration::ZERO, VISIBILITY)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            client
                .receive_message("b", Duration::ZERO, VISIBILITY)
                .await
                .unwrap()
                .is_none()
        );

        clock.advance(Duration::from_secs(10));
        assert!(
            client
                .receive_message("a", Duration::ZERO, VISIBILITY)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let client = Arc::new(InMemoryCloudClient::default());
        let receiver = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .receive_message("q", Duration::from_secs(5), VISIBILITY)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .send_message("q", "ping".to_string(), Duration::ZERO)
            .await
            .unwrap();

        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.body, "ping");
    }

    #[tokio::test]
    async fn test_max_queue_size() {
        let client = InMemoryCloudClient::default().with_max_queue_size(1);
        client
            .send_message("q", "one".to_string(), Duration::ZERO)
            .await
            .unwrap();
        let err = client
            .send_message("q", "two".to_string(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("full"));
    }
}
