//! What happens to a job after `process()` fails.
//!
//! Every backend runs the same decision: a job that opted out, ran out of
//! retries, or could not be decoded is removed; anything else goes back to
//! its queue after its backoff. Each failure is also quarantined in the
//! failed-job cache, when one is attached, under `job:failed:<id>`.

use crate::cache::FailedJobCache;
use crate::error::CourierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How the failing job asked to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// Put the job back if it has retries left
    Retry,
    /// `should_delete` returned true; never retry
    Delete,
    /// The payload could not be decoded; never retry
    Corrupt,
}

/// A failed execution together with how the job wants it handled.
#[derive(Debug)]
pub struct JobFailure {
    /// The error raised by the job, its decoder or its timeout
    pub error: CourierError,
    /// Requested treatment
    pub disposition: FailureDisposition,
}

impl JobFailure {
    pub fn retry(error: CourierError) -> Self {
        Self {
            error,
            disposition: FailureDisposition::Retry,
        }
    }

    pub fn delete(error: CourierError) -> Self {
        Self {
            error,
            disposition: FailureDisposition::Delete,
        }
    }

    pub fn corrupt(error: CourierError) -> Self {
        Self {
            error,
            disposition: FailureDisposition::Corrupt,
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.error, self.disposition)
    }
}

/// Why a failed job left its queue for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// No retries left
    Exhausted,
    /// The job asked to be deleted
    OptedOut,
    /// The payload could not be decoded
    Corrupt,
}

/// What a backend must do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the job available again after `backoff`, with `remaining`
    /// retries left afterwards.
    Release { remaining: u32, backoff: Duration },
    /// Remove the job permanently.
    Remove(RemovalReason),
}

impl RetryDecision {
    pub fn is_release(&self) -> bool {
        matches!(self, RetryDecision::Release { .. })
    }
}

/// Retries a job still has, clamped by the worker's retry ceiling.
pub fn retry_budget(job_retries: u32, ceiling: Option<u32>) -> u32 {
    ceiling.map_or(job_retries, |ceiling| job_retries.min(ceiling))
}

/// Retries left for a job that has been delivered `deliveries` times
/// (the current delivery included) out of a budget of `budget` retries.
pub fn retries_left(budget: u32, deliveries: u32) -> u32 {
    budget.saturating_sub(deliveries.saturating_sub(1))
}

/// Decide what to do with a failed job that had `left` retries before this failure.
pub fn decide(disposition: FailureDisposition, left: u32, backoff: Duration) -> RetryDecision {
    match disposition {
        FailureDisposition::Corrupt => RetryDecision::Remove(RemovalReason::Corrupt),
        FailureDisposition::Delete => RetryDecision::Remove(RemovalReason::OptedOut),
        FailureDisposition::Retry if left == 0 => RetryDecision::Remove(RemovalReason::Exhausted),
        FailureDisposition::Retry => RetryDecision::Release {
            remaining: left - 1,
            backoff,
        },
    }
}

/// Dead-letter record written to the failed-job cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedJob {
    /// Envelope id, or the backend's record id when the envelope was unreadable
    pub id: String,
    /// Backend driver that ran the job
    pub backend: String,
    /// Queue the job was taken from
    pub queue: String,
    /// Registry key, when known
    pub job_type: Option<String>,
    /// Raw payload as stored by the backend
    pub payload: String,
    /// Error message
    pub error: String,
    /// Requested treatment
    pub disposition: FailureDisposition,
    /// Whether the job was put back on its queue
    pub released: bool,
    /// When the failure happened, in unix seconds
    pub failed_at: u64,
}

impl FailedJob {
    /// Cache key for a failed job id.
    pub fn cache_key_for(id: &str) -> String {
        format!("job:failed:{id}")
    }

    pub fn cache_key(&self) -> String {
        Self::cache_key_for(&self.id)
    }
}

/// Write a failed job into the cache. Cache errors are logged, never raised,
/// so a broken cache cannot stall the queue.
pub async fn quarantine(cache: Option<&Arc<dyn FailedJobCache>>, record: &FailedJob) {
    let Some(cache) = cache else {
        return;
    };

    let value = match serde_json::to_string(record) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Could not serialize failed job {}: {}", record.id, e);
            return;
        }
    };

    if let Err(e) = cache.set(&record.cache_key(), value).await {
        tracing::warn!("Could not quarantine failed job {}: {}", record.id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[test]
    fn test_budget_clamped_by_ceiling() {
        assert_eq!(retry_budget(3, None), 3);
        assert_eq!(retry_budget(3, Some(1)), 1);
        assert_eq!(retry_budget(1, Some(5)), 1);
        assert_eq!(retry_budget(4, Some(0)), 0);
    }

    #[test]
    fn test_retries_left_counts_deliveries() {
        assert_eq!(retries_left(2, 1), 2);
        assert_eq!(retries_left(2, 3), 0);
        assert_eq!(retries_left(2, 9), 0);
        assert_eq!(retries_left(0, 0), 0);
    }

    #[test]
    fn test_decide() {
        let backoff = Duration::from_secs(60);
        assert_eq!(
            decide(FailureDisposition::Retry, 2, backoff),
            RetryDecision::Release {
                remaining: 1,
                backoff
            }
        );
        assert_eq!(
            decide(FailureDisposition::Retry, 0, backoff),
            RetryDecision::Remove(RemovalReason::Exhausted)
        );
        assert_eq!(
            decide(FailureDisposition::Delete, 5, backoff),
            RetryDecision::Remove(RemovalReason::OptedOut)
        );
        assert_eq!(
            decide(FailureDisposition::Corrupt, 5, backoff),
            RetryDecision::Remove(RemovalReason::Corrupt)
        );
    }

    #[tokio::test]
    async fn test_quarantine_writes_record() {
        let memory = Arc::new(InMemoryCache::new());
        let cache: Arc<dyn FailedJobCache> = memory.clone();
        let record = FailedJob {
            id: "abc".to_string(),
            backend: "database".to_string(),
            queue: "default".to_string(),
            job_type: Some("send_email".to_string()),
            payload: "{}".to_string(),
            error: "smtp down".to_string(),
            disposition: FailureDisposition::Retry,
            released: true,
            failed_at: 1_700_000_000,
        };

        quarantine(Some(&cache), &record).await;
        quarantine(None, &record).await;

        let stored = memory.get("job:failed:abc").await.unwrap().unwrap();
        let decoded: FailedJob = serde_json::from_str(&stored).unwrap();
        assert_eq!(decoded, record);
    }
}
