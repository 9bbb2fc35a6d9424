//! Job definition and the envelope that carries it through a backend.

use crate::clock::{Clock, SystemClock};
use crate::error::{CourierError, CourierResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique identifier for an enqueued job
pub type JobId = String;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Status of a record in the database backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker
    Pending,
    /// Claimed by a worker
    Reserved,
    /// Finished successfully
    Processed,
}

impl JobStatus {
    /// Column value stored in the jobs table.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Reserved => "reserved",
            JobStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "reserved" => Ok(JobStatus::Reserved),
            "processed" => Ok(JobStatus::Processed),
            other => Err(CourierError::queue_msg(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Trait that every deferred unit of work implements.
///
/// The accessors describe how the job should be scheduled. Concrete jobs
/// override the ones they care about; they are read once when the job is
/// pushed and travel with it inside the [`JobEnvelope`].
///
/// ```rust
/// use courierq::prelude::*;
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendWelcomeEmail {
///     to: String,
/// }
///
/// #[async_trait]
/// impl Job for SendWelcomeEmail {
///     fn queue(&self) -> &str {
///         "emails"
///     }
///
///     fn delay(&self) -> Duration {
///         Duration::ZERO
///     }
///
///     async fn process(&self) -> CourierResult<()> {
///         tracing::info!("sending welcome email to {}", self.to);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key used to find the handler for this job in a [`JobRegistry`](crate::core::JobRegistry).
    ///
    /// Defaults to the Rust type name. Override it when producers and
    /// workers are built from different crates.
    fn job_type() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Logical queue this job is pushed to.
    fn queue(&self) -> &str {
        DEFAULT_QUEUE
    }

    /// Minimum time before the job becomes eligible to run.
    fn delay(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// How many times the job may be retried after its first failure.
    fn retries(&self) -> u32 {
        3
    }

    /// How long a failed job waits before it is eligible again.
    fn backoff(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Advisory priority. Only the beanstalk backend forwards it.
    fn priority(&self) -> u32 {
        1
    }

    /// Do the work.
    async fn process(&self) -> CourierResult<()>;

    /// Called after every failed `process`.
    async fn on_exception(&self, _error: &CourierError) {}

    /// Return `true` to drop the job instead of retrying it.
    fn should_delete(&self, _error: &CourierError) -> bool {
        false
    }
}

/// A job serialized for transport, together with its scheduling options.
///
/// This is the payload stored in a database row, sent as a cloud-queue
/// message body, or put into a beanstalk tube.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEnvelope {
    /// Unique job identifier
    pub id: JobId,
    /// Registry key of the job type
    pub job_type: String,
    /// Queue the job was pushed to
    pub queue: String,
    /// Serialized job
    pub payload: serde_json::Value,
    /// Seconds to wait before the first run
    pub delay_secs: u64,
    /// Retries left after the first failure
    pub retries: u32,
    /// Seconds to wait before a retry
    pub backoff_secs: u64,
    /// Advisory priority
    pub priority: u32,
    /// When the job was created, in unix seconds
    pub created_at: u64,
}

impl JobEnvelope {
    /// Serialize a job and capture its scheduling options, stamped with the system time.
    pub fn from_job<J: Job>(job: &J) -> CourierResult<Self> {
        Self::from_job_at(job, SystemClock.now_secs())
    }

    /// Like [`from_job`](Self::from_job), with `created_at` taken from the caller's clock.
    pub fn from_job_at<J: Job>(job: &J, created_at: u64) -> CourierResult<Self> {
        let payload = serde_json::to_value(job)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: J::job_type().to_string(),
            queue: job.queue().to_string(),
            payload,
            delay_secs: job.delay().as_secs(),
            retries: job.retries(),
            backoff_secs: job.backoff().as_secs(),
            priority: job.priority(),
            created_at,
        })
    }

    /// Encode the envelope as the text stored by persistent backends.
    pub fn encode(&self) -> CourierResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope previously produced by [`encode`](Self::encode).
    pub fn decode(data: &str) -> CourierResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Delay before the first run.
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Delay before a retry.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// Serialize a job into its transport envelope.
pub fn serialize_job<J: Job>(job: &J) -> CourierResult<JobEnvelope> {
    JobEnvelope::from_job(job)
}

/// Rebuild a concrete job from an envelope.
pub fn deserialize_job<J: Job>(envelope: &JobEnvelope) -> CourierResult<J> {
    Ok(serde_json::from_value(envelope.payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct ResizeImage {
        path: String,
        width: u32,
    }

    #[async_trait]
    impl Job for ResizeImage {
        fn queue(&self) -> &str {
            "images"
        }

        fn retries(&self) -> u32 {
            5
        }

        async fn process(&self) -> CourierResult<()> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Plain;

    #[async_trait]
    impl Job for Plain {
        fn job_type() -> &'static str {
            "plain"
        }

        async fn process(&self) -> CourierResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_envelope_captures_options() {
        let job = ResizeImage {
            path: "/tmp/cat.png".to_string(),
            width: 640,
        };
        let envelope = JobEnvelope::from_job(&job).unwrap();

        assert_eq!(envelope.queue, "images");
        assert_eq!(envelope.retries, 5);
        assert_eq!(envelope.delay_secs, 30);
        assert_eq!(envelope.backoff_secs, 60);
        assert_eq!(envelope.priority, 1);
        assert!(envelope.job_type.ends_with("ResizeImage"));
        assert!(!envelope.id.is_empty());
    }

    #[test]
    fn test_created_at_from_caller_clock() {
        let envelope = JobEnvelope::from_job_at(&Plain, 1_700_000_000).unwrap();
        assert_eq!(envelope.created_at, 1_700_000_000);

        let now = JobEnvelope::from_job(&Plain).unwrap();
        assert!(now.created_at > 1_700_000_000);
    }

    #[test]
    fn test_defaults_and_custom_job_type() {
        let envelope = JobEnvelope::from_job(&Plain).unwrap();
        assert_eq!(envelope.job_type, "plain");
        assert_eq!(envelope.queue, DEFAULT_QUEUE);
        assert_eq!(envelope.retries, 3);
    }

    #[test]
    fn test_encoded_envelope_rebuilds_job() {
        let job = ResizeImage {
            path: "/tmp/dog.png".to_string(),
            width: 128,
        };
        let encoded = serialize_job(&job).unwrap().encode().unwrap();
        let decoded = JobEnvelope::decode(&encoded).unwrap();
        let rebuilt: ResizeImage = deserialize_job(&decoded).unwrap();
        assert_eq!(rebuilt, job);
    }

    #[test]
    fn test_decode_rejects_foreign_payload() {
        assert!(matches!(
            JobEnvelope::decode("O:8:\"stdClass\":0:{}"),
            Err(CourierError::Serialization(_))
        ));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [JobStatus::Pending, JobStatus::Reserved, JobStatus::Processed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("buried".parse::<JobStatus>().is_err());
    }
}
