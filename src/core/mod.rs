//! Job execution core: the job registry, the retry policy, backend
//! selection and the worker loop.

pub mod connection;
pub mod failure;
pub mod registry;
pub mod worker;

pub use connection::{AdapterRegistry, Connection};
pub use failure::{FailedJob, FailureDisposition, JobFailure, RemovalReason, RetryDecision};
pub use registry::{JobHandler, JobRegistry};
pub use worker::{Worker, WorkerStats};
