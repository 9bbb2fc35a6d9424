//! # courierq
//!
//! Job dispatch and worker execution with pluggable queue backends.
//!
//! ## Features
//!
//! - **Pluggable backends**: run jobs inline (`sync`), from a SQLite table
//!   (`database`), from SQS or its in-process twin (`sqs`, `memory`), or from a
//!   beanstalkd daemon (`beanstalk`)
//! - **Retry policy**: per-job retry budget and backoff, capped by the worker
//! - **Failed-job quarantine**: removed jobs are recorded in a cache for inspection
//! - **Graceful shutdown**: a running job always finishes before the worker stops
//!
//! ## Quick Start
//!
//! ```rust
//! use courierq::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ResizeImage {
//!     path: String,
//! }
//!
//! #[async_trait]
//! impl Job for ResizeImage {
//!     async fn process(&self) -> CourierResult<()> {
//!         tracing::info!("resizing {}", self.path);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> CourierResult<()> {
//! let mut registry = JobRegistry::new();
//! registry.register::<ResizeImage>();
//!
//! let settings = QueueSettings::with_default("sync").with_connection("sync", json!({}));
//! let connection = Connection::new(settings, Arc::new(registry));
//!
//! // The sync driver runs the job before `push` returns
//! connection
//!     .push(&ResizeImage {
//!         path: "avatar.png".to_string(),
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod job;
pub mod logging;
pub mod queue;
pub mod utils;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;

pub mod prelude {
    pub use crate::cache::{FailedJobCache, InMemoryCache};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::{
        BeanstalkConfig, CacheConfig, CourierConfig, DatabaseConfig, LogLevel, LoggingConfig,
        MemoryQueueConfig, QueueSettings, SqsConfig, WorkerConfig,
    };
    pub use crate::core::{
        AdapterRegistry, Connection, FailedJob, JobFailure, JobRegistry, RemovalReason, Worker,
        WorkerStats,
    };
    pub use crate::error::{CourierError, CourierResult};
    pub use crate::job::{DEFAULT_QUEUE, Job, JobEnvelope, JobId, JobStatus};
    pub use crate::queue::{AdapterContext, AdapterFactory, QueueAdapter, RunOutcome};
    pub use async_trait::async_trait;
}

pub use crate::core::{Connection, JobRegistry, Worker};
pub use crate::error::{CourierError, CourierResult};
pub use crate::job::{Job, JobEnvelope};
