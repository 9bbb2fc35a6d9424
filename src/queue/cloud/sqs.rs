//! Amazon SQS transport.
//!
//! The queue URL is the configured prefix followed by the queue name, e.g.
//! `https://sqs.eu-west-1.amazonaws.com/123456789012/emails`.

use super::{CloudQueue, CloudQueueClient, CloudSettings, ReceivedMessage};
use crate::config::{SqsConfig, parse_backend_config};
use crate::error::{CourierError, CourierResult};
use crate::queue::{AdapterContext, AdapterFactory, QueueAdapter};
use crate::utils::duration_secs_u32;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::Credentials;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use std::sync::Arc;
use std::time::Duration;

/// SQS client bound to a queue URL prefix.
#[derive(Debug, Clone)]
pub struct SqsClient {
    client: Client,
    prefix: String,
}

impl SqsClient {
    /// Build a client from configuration. No request is sent.
    pub async fn from_config(config: &SqsConfig) -> CourierResult<Self> {
        config.validate()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(key), Some(secret)) = (&config.key, &config.secret) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "courierq",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let sdk_config = loader.load().await;
        Ok(Self::new(Client::new(&sdk_config), config.prefix.clone()))
    }

    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// Full URL of `queue`.
    pub fn queue_url(&self, queue: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), queue)
    }
}

fn sqs_error<E: std::error::Error>(operation: &str, queue: &str, error: E) -> CourierError {
    CourierError::queue_msg(format!(
        "SQS {} on '{}' failed: {}",
        operation,
        queue,
        DisplayErrorContext(error)
    ))
}

fn secs_i32(duration: Duration) -> i32 {
    i32::try_from(duration_secs_u32(duration)).unwrap_or(i32::MAX)
}

#[async_trait]
impl CloudQueueClient for SqsClient {
    async fn send_message(
        &self,
        queue: &str,
        body: String,
        delay: Duration,
    ) -> CourierResult<String> {
        let output = self
            .client
            .send_message()
            .queue_url(self.queue_url(queue))
            .message_body(body)
            .delay_seconds(secs_i32(delay))
            .send()
            .await
            .map_err(|e| sqs_error("SendMessage", queue, e))?;

        output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| CourierError::protocol("SendMessage returned no message id"))
    }

    async fn receive_message(
        &self,
        queue: &str,
        wait: Duration,
        visibility: Duration,
    ) -> CourierResult<Option<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(self.queue_url(queue))
            .max_number_of_messages(1)
            .wait_time_seconds(secs_i32(wait))
            .visibility_timeout(secs_i32(visibility))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| sqs_error("ReceiveMessage", queue, e))?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| CourierError::protocol("ReceiveMessage returned no receipt handle"))?;

        let receive_count = message
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|count| count.parse::<u32>().ok())
            .unwrap_or(1);

        Ok(Some(ReceivedMessage {
            message_id: message.message_id().unwrap_or_default().to_string(),
            receipt_handle: receipt_handle.to_string(),
            body: message.body().unwrap_or_default().to_string(),
            receive_count,
        }))
    }

    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> CourierResult<bool> {
        self.client
            .delete_message()
            .queue_url(self.queue_url(queue))
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| sqs_error("DeleteMessage", queue, e))?;
        Ok(true)
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> CourierResult<()> {
        self.client
            .change_message_visibility()
            .queue_url(self.queue_url(queue))
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs_i32(timeout))
            .send()
            .await
            .map_err(|e| sqs_error("ChangeMessageVisibility", queue, e))?;
        Ok(())
    }

    async fn approximate_size(&self, queue: &str) -> CourierResult<u64> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(self.queue_url(queue))
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .send()
            .await
            .map_err(|e| sqs_error("GetQueueAttributes", queue, e))?;

        let Some(attributes) = output.attributes() else {
            return Ok(0);
        };

        Ok(attributes
            .values()
            .filter_map(|value| value.parse::<u64>().ok())
            .sum())
    }

    async fn health_check(&self) -> CourierResult<()> {
        self.client
            .list_queues()
            .max_results(1)
            .send()
            .await
            .map_err(|e| sqs_error("ListQueues", &self.prefix, e))?;
        Ok(())
    }
}

/// Factory for the `sqs` driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqsFactory;

#[async_trait]
impl AdapterFactory for SqsFactory {
    async fn configure(
        &self,
        connection: &str,
        config: &serde_json::Value,
        context: &AdapterContext,
    ) -> CourierResult<Arc<dyn QueueAdapter>> {
        let config: SqsConfig = parse_backend_config(connection, config)?;
        let client = SqsClient::from_config(&config).await?;
        let settings = CloudSettings {
            wait: Duration::from_secs(config.wait_time_secs),
            visibility: Duration::from_secs(config.visibility_timeout_secs),
        };

        tracing::info!(
            "Configured SQS connection '{}' ({}, {})",
            connection,
            config.region,
            config.prefix
        );
        Ok(Arc::new(CloudQueue::new("sqs", client, settings, context.clone())))
    }
}
