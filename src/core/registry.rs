//! Job registry: maps the job type stored in an envelope to the code that runs it.
//!
//! The registry is built once at startup and shared behind an `Arc`:
//!
//! ```rust
//! use courierq::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Cleanup;
//!
//! #[async_trait]
//! impl Job for Cleanup {
//!     async fn process(&self) -> CourierResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = JobRegistry::new();
//! registry.register::<Cleanup>();
//! let registry = Arc::new(registry);
//! assert!(registry.is_registered(Cleanup::job_type()));
//! ```

use crate::core::failure::{FailureDisposition, JobFailure};
use crate::error::CourierError;
use crate::job::{Job, JobEnvelope};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Runs jobs of one type from their serialized payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Decode the payload and run the job.
    async fn handle(&self, payload: serde_json::Value) -> Result<(), JobFailure>;

    /// Job type this handler runs.
    fn job_type(&self) -> &'static str;
}

struct TypedHandler<J> {
    _job: PhantomData<fn() -> J>,
}

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), JobFailure> {
        let job: J = serde_json::from_value(payload)
            .map_err(|e| JobFailure::corrupt(CourierError::Serialization(e)))?;

        match job.process().await {
            Ok(()) => Ok(()),
            Err(error) => {
                job.on_exception(&error).await;
                if job.should_delete(&error) {
                    Err(JobFailure::delete(error))
                } else {
                    Err(JobFailure::retry(error))
                }
            }
        }
    }

    fn job_type(&self) -> &'static str {
        J::job_type()
    }
}

/// Registry of every job type a worker can run.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("JobRegistry").field("job_types", &types).finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type. Registering the same type twice keeps the latest handler.
    pub fn register<J: Job>(&mut self) -> &mut Self {
        let job_type = J::job_type();
        let handler = TypedHandler::<J> {
            _job: PhantomData,
        };
        if self
            .handlers
            .insert(job_type.to_string(), Arc::new(handler))
            .is_some()
        {
            tracing::warn!("Job type '{}' registered twice, keeping the latest", job_type);
        } else {
            tracing::debug!("Registered job type: {}", job_type);
        }
        self
    }

    /// Register a custom handler under its own job type.
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type().to_string(), handler);
        self
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// All registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run the job carried by `envelope`.
    ///
    /// An unknown job type is a retriable failure: another deployment
    /// sharing the queue may know it.
    pub async fn execute(&self, envelope: &JobEnvelope) -> Result<(), JobFailure> {
        let handler = self.handler(&envelope.job_type)?;
        handler.handle(envelope.payload.clone()).await
    }

    /// Run the job on its own task, bounded by `limit`.
    ///
    /// A panic or an expired limit is reported as a retriable failure.
    pub async fn execute_with_timeout(
        &self,
        envelope: &JobEnvelope,
        limit: Option<Duration>,
    ) -> Result<(), JobFailure> {
        let handler = self.handler(&envelope.job_type)?;
        let payload = envelope.payload.clone();
        let mut handle = tokio::spawn(async move { handler.handle(payload).await });

        let joined = match limit {
            Some(limit) => match timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    tracing::error!("Job {} timed out after {:?}", envelope.id, limit);
                    return Err(JobFailure::retry(CourierError::Timeout {
                        timeout_secs: limit.as_secs(),
                    }));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!("Job {} panicked: {}", envelope.id, join_error);
                Err(JobFailure::retry(CourierError::job_with_source(
                    "job panicked",
                    join_error,
                )))
            }
        }
    }

    fn handler(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, JobFailure> {
        self.handlers.get(job_type).cloned().ok_or_else(|| JobFailure {
            error: CourierError::JobNotRegistered {
                job_type: job_type.to_string(),
            },
            disposition: FailureDisposition::Retry,
        })
    }
}
