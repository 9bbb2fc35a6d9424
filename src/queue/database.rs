//! Database backend: jobs live in a SQLite table and workers poll it.
//!
//! Row lifecycle: `pending -> reserved -> processed` on success. A failed
//! job goes back to `pending` with one retry less and `available_at` moved
//! by its backoff, or is deleted once it has no retries left.
//!
//! Reservation is a single `UPDATE ... RETURNING`, so two workers polling the
//! same table never receive the same row. A row whose worker disappeared
//! becomes eligible again once `reserved_at` is older than the reservation
//! timeout. Reclaiming a row costs it one retry; a stale row with none left
//! is deleted and quarantined instead of being run again.
//!
//! `reserved_at` doubles as the reservation token: a worker only finishes,
//! releases or deletes the row it reserved while the row still carries its
//! `reserved_at`, so a late worker cannot clobber a row someone reclaimed.

use super::{
    AdapterContext, AdapterFactory, Delivery, Execution, PollState, QueueAdapter, RunOutcome,
    SharedPollState,
};
use crate::config::{DatabaseConfig, parse_backend_config};
use crate::core::failure::{JobFailure, RemovalReason, RetryDecision, decide, retry_budget};
use crate::error::{CourierError, CourierResult};
use crate::job::{JobEnvelope, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Row counts of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Rows waiting for a worker
    pub pending: u64,
    /// Rows claimed by a worker
    pub reserved: u64,
    /// Rows finished successfully and not yet pruned
    pub processed: u64,
}

/// A row claimed by this worker.
#[derive(Debug)]
struct Reservation {
    id: String,
    payload: String,
    attempts: u32,
    reserved_at: u64,
}

/// SQLite-backed queue.
pub struct DatabaseQueue {
    pool: SqlitePool,
    config: DatabaseConfig,
    context: AdapterContext,
    poll: SharedPollState,
    installed: OnceCell<()>,
}

impl std::fmt::Debug for DatabaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseQueue")
            .field("table", &self.config.table)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl DatabaseQueue {
    /// Build the queue. The pool connects on first use.
    pub fn connect_lazy(config: DatabaseConfig, context: AdapterContext) -> CourierResult<Self> {
        config.validate()?;

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .connect_lazy(&config.url)
            .map_err(|e| {
                CourierError::config(format!("invalid database url '{}': {}", config.url, e))
            })?;

        Ok(Self::with_pool(pool, config, context))
    }

    /// Build the queue on an existing pool.
    ///
    /// Jobs are cut off a little before their reservation can go stale, so
    /// a slow job fails on this worker rather than running twice.
    pub fn with_pool(pool: SqlitePool, config: DatabaseConfig, context: AdapterContext) -> Self {
        // reserved_at is stored in whole seconds, so a row can go stale up to
        // one second early
        let job_timeout = config.reservation_timeout_secs.saturating_sub(2).max(1);
        let poll = SharedPollState::new(PollState {
            sleep: Duration::from_secs(config.sleep_secs),
            job_timeout: Some(Duration::from_secs(job_timeout)),
            ..Default::default()
        });

        Self {
            pool,
            config,
            context,
            poll,
            installed: OnceCell::new(),
        }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the jobs table and its polling index if they do not exist.
    pub async fn install(&self) -> CourierResult<()> {
        let table = &self.config.table;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id           TEXT PRIMARY KEY,
                queue        TEXT NOT NULL,
                payload      TEXT NOT NULL,
                attempts     INTEGER NOT NULL,
                status       TEXT NOT NULL,
                available_at DATETIME NOT NULL,
                reserved_at  DATETIME NULL,
                created_at   DATETIME NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_queue_status_available_idx \
             ON {table} (queue, status, available_at)"
        ))
        .execute(&self.pool)
        .await?;

        tracing::info!("Installed jobs table '{}'", table);
        Ok(())
    }

    async fn ensure_installed(&self) -> CourierResult<()> {
        if !self.config.auto_install {
            return Ok(());
        }
        self.installed.get_or_try_init(|| self.install()).await?;
        Ok(())
    }

    /// Delete processed rows last reserved before `now - older_than`.
    pub async fn prune_processed(&self, older_than: Duration) -> CourierResult<u64> {
        self.ensure_installed().await?;
        let cutoff = timestamp(
            self.context
                .clock
                .now_secs()
                .saturating_sub(older_than.as_secs()),
        )?;

        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE status = ? AND reserved_at <= ?",
            self.config.table
        ))
        .bind(JobStatus::Processed.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::info!("Pruned {} processed jobs from '{}'", pruned, self.config.table);
        }
        Ok(pruned)
    }

    /// Row counts per status for `queue`.
    pub async fn stats(&self, queue: &str) -> CourierResult<QueueStats> {
        self.ensure_installed().await?;
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS total FROM {} WHERE queue = ? GROUP BY status",
            self.config.table
        ))
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            let total = u64::try_from(total).unwrap_or_default();
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = total,
                JobStatus::Reserved => stats.reserved = total,
                JobStatus::Processed => stats.processed = total,
            }
        }
        Ok(stats)
    }

    /// Status and remaining retries of a row, if it exists.
    pub async fn job_state(&self, id: &str) -> CourierResult<Option<(JobStatus, u32)>> {
        self.ensure_installed().await?;
        let row = sqlx::query(&format!(
            "SELECT status, attempts FROM {} WHERE id = ?",
            self.config.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                let attempts: i64 = row.try_get("attempts")?;
                Ok(Some((
                    status.parse()?,
                    u32::try_from(attempts).unwrap_or_default(),
                )))
            }
            None => Ok(None),
        }
    }

    /// Claim the next due row of `queue`.
    ///
    /// A stale reservation is reclaimed with one retry less. Stale rows with
    /// no retries left are never claimed; see [`sweep_exhausted`](Self::sweep_exhausted).
    async fn reserve(
        &self,
        queue: &str,
        ceiling: Option<u32>,
    ) -> CourierResult<Option<Reservation>> {
        let table = &self.config.table;
        let now = self.context.clock.now_secs();
        let stale = now.saturating_sub(self.config.reservation_timeout_secs);
        let ceiling = ceiling.map_or(i64::MAX, i64::from);

        let row = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = ?1,
                reserved_at = ?2,
                attempts = CASE
                    WHEN status = ?1 THEN MIN(attempts, ?3) - 1
                    ELSE attempts
                END
            WHERE id = (
                SELECT id FROM {table}
                WHERE queue = ?4
                  AND available_at <= ?2
                  AND (
                    status = ?5
                    OR (status = ?1 AND reserved_at <= ?6 AND MIN(attempts, ?3) > 0)
                  )
                ORDER BY available_at, created_at
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#
        ))
        .bind(JobStatus::Reserved.as_str())
        .bind(timestamp(now)?)
        .bind(ceiling)
        .bind(queue)
        .bind(JobStatus::Pending.as_str())
        .bind(timestamp(stale)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let attempts: i64 = row.try_get("attempts")?;
                Ok(Some(Reservation {
                    id: row.try_get("id")?,
                    payload: row.try_get("payload")?,
                    attempts: u32::try_from(attempts).unwrap_or_default(),
                    reserved_at: now,
                }))
            }
            None => Ok(None),
        }
    }

    /// Delete one stale reservation of `queue` that has no retries left.
    ///
    /// Returns the deleted row's id and payload.
    async fn sweep_exhausted(
        &self,
        queue: &str,
        ceiling: Option<u32>,
    ) -> CourierResult<Option<(String, String)>> {
        let table = &self.config.table;
        let stale = self
            .context
            .clock
            .now_secs()
            .saturating_sub(self.config.reservation_timeout_secs);

        let row = sqlx::query(&format!(
            r#"
            DELETE FROM {table}
            WHERE id = (
                SELECT id FROM {table}
                WHERE queue = ?
                  AND status = ?
                  AND reserved_at <= ?
                  AND MIN(attempts, ?) <= 0
                LIMIT 1
            )
            RETURNING id, payload
            "#
        ))
        .bind(queue)
        .bind(JobStatus::Reserved.as_str())
        .bind(timestamp(stale)?)
        .bind(ceiling.map_or(i64::MAX, i64::from))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some((row.try_get("id")?, row.try_get("payload")?))),
            None => Ok(None),
        }
    }

    async fn mark_processed(&self, reservation: &Reservation) -> CourierResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ? WHERE id = ? AND status = ? AND reserved_at = ?",
            self.config.table
        ))
        .bind(JobStatus::Processed.as_str())
        .bind(&reservation.id)
        .bind(JobStatus::Reserved.as_str())
        .bind(timestamp(reservation.reserved_at)?)
        .execute(&self.pool)
        .await?;
        Ok(still_held(reservation, result.rows_affected()))
    }

    async fn release(
        &self,
        reservation: &Reservation,
        remaining: u32,
        backoff: Duration,
    ) -> CourierResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?, attempts = ?, available_at = ?, reserved_at = NULL \
             WHERE id = ? AND status = ? AND reserved_at = ?",
            self.config.table
        ))
        .bind(JobStatus::Pending.as_str())
        .bind(i64::from(remaining))
        .bind(timestamp(self.available_after(backoff))?)
        .bind(&reservation.id)
        .bind(JobStatus::Reserved.as_str())
        .bind(timestamp(reservation.reserved_at)?)
        .execute(&self.pool)
        .await?;
        Ok(still_held(reservation, result.rows_affected()))
    }

    async fn remove(&self, reservation: &Reservation) -> CourierResult<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ? AND status = ? AND reserved_at = ?",
            self.config.table
        ))
        .bind(&reservation.id)
        .bind(JobStatus::Reserved.as_str())
        .bind(timestamp(reservation.reserved_at)?)
        .execute(&self.pool)
        .await?;
        Ok(still_held(reservation, result.rows_affected()))
    }

    /// First second at which a record delayed by `delay` may run.
    fn available_after(&self, delay: Duration) -> u64 {
        if delay.is_zero() {
            self.context.clock.now_secs()
        } else {
            self.context.clock.now_secs_ceil() + delay.as_secs()
        }
    }
}

/// Whether a finishing write matched the reservation it was made for.
fn still_held(reservation: &Reservation, rows_affected: u64) -> bool {
    if rows_affected == 0 {
        tracing::warn!(
            "Job {} was reclaimed by another worker; leaving the row alone",
            reservation.id
        );
    }
    rows_affected > 0
}

fn timestamp(secs: u64) -> CourierResult<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| CourierError::queue_msg(format!("timestamp {secs} out of range")))
}

#[async_trait]
impl QueueAdapter for DatabaseQueue {
    fn driver(&self) -> &'static str {
        "database"
    }

    fn poll_state(&self) -> &SharedPollState {
        &self.poll
    }

    async fn push(&self, envelope: JobEnvelope) -> CourierResult<JobId> {
        self.ensure_installed().await?;
        let payload = envelope.encode()?;
        let available_at = self.available_after(envelope.delay());

        sqlx::query(&format!(
            r#"
            INSERT INTO {}
                (id, queue, payload, attempts, status, available_at, reserved_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?)
            "#,
            self.config.table
        ))
        .bind(&envelope.id)
        .bind(&envelope.queue)
        .bind(payload)
        .bind(i64::from(envelope.retries))
        .bind(JobStatus::Pending.as_str())
        .bind(timestamp(available_at)?)
        .bind(timestamp(self.context.clock.now_secs())?)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Pushed job {} ({}) to database queue {}",
            envelope.id,
            envelope.job_type,
            envelope.queue
        );
        super::record_push(self.driver(), &envelope.queue);
        Ok(envelope.id)
    }

    async fn run(&self, queue: &str) -> CourierResult<RunOutcome> {
        self.ensure_installed().await?;
        let state = self.poll.snapshot();

        if let Some((id, payload)) = self.sweep_exhausted(queue, state.retry).await? {
            let delivery = Delivery {
                backend: self.driver(),
                queue,
                record_id: &id,
                raw: &payload,
            };
            let failure = JobFailure::retry(CourierError::Timeout {
                timeout_secs: self.config.reservation_timeout_secs,
            });
            let decision = RetryDecision::Remove(RemovalReason::Exhausted);
            tracing::warn!("Job {} abandoned with no retries left, removed", id);

            let envelope = JobEnvelope::decode(&payload).ok();
            self.context
                .quarantine(&delivery, envelope.as_ref(), &failure, decision)
                .await;

            let outcome = decision.into();
            super::record_outcome(self.driver(), queue, outcome);
            return Ok(outcome);
        }

        let Some(reservation) = self.reserve(queue, state.retry).await? else {
            super::record_outcome(self.driver(), queue, RunOutcome::Idle);
            return Ok(RunOutcome::Idle);
        };

        let delivery = Delivery {
            backend: self.driver(),
            queue,
            record_id: &reservation.id,
            raw: &reservation.payload,
        };

        let outcome = match self.context.execute(&delivery, state.job_timeout).await {
            Execution::Completed(envelope) => {
                if self.mark_processed(&reservation).await? {
                    tracing::info!("Job {} ({}) processed", envelope.id, envelope.job_type);
                }
                RunOutcome::Completed
            }
            Execution::Failed { envelope, failure } => {
                let backoff = envelope
                    .as_ref()
                    .map(JobEnvelope::backoff)
                    .unwrap_or_default();
                let left = retry_budget(reservation.attempts, state.retry);
                let decision = decide(failure.disposition, left, backoff);

                match decision {
                    RetryDecision::Release { remaining, backoff } => {
                        if self.release(&reservation, remaining, backoff).await? {
                            tracing::warn!(
                                "Job {} released with {} retries left, available in {:?}",
                                reservation.id,
                                remaining,
                                backoff
                            );
                        }
                    }
                    RetryDecision::Remove(reason) => {
                        if self.remove(&reservation).await? {
                            tracing::warn!("Job {} removed: {:?}", reservation.id, reason);
                        }
                    }
                }

                self.context
                    .quarantine(&delivery, envelope.as_ref(), &failure, decision)
                    .await;
                decision.into()
            }
        };

        super::record_outcome(self.driver(), queue, outcome);
        Ok(outcome)
    }

    async fn size(&self, queue: &str) -> CourierResult<u64> {
        self.ensure_installed().await?;
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ? AND status != ?",
            self.config.table
        ))
        .bind(queue)
        .bind(JobStatus::Processed.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    async fn delete(&self, queue: &str, id: &str) -> CourierResult<bool> {
        self.ensure_installed().await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE queue = ? AND id = ?",
            self.config.table
        ))
        .bind(queue)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> CourierResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Factory for the `database` driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatabaseFactory;

#[async_trait]
impl AdapterFactory for DatabaseFactory {
    async fn configure(
        &self,
        connection: &str,
        config: &serde_json::Value,
        context: &AdapterContext,
    ) -> CourierResult<Arc<dyn QueueAdapter>> {
        let config: DatabaseConfig = parse_backend_config(connection, config)?;
        Ok(Arc::new(DatabaseQueue::connect_lazy(config, context.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FailedJobCache, InMemoryCache};
    use crate::clock::Clock;
    use crate::clock::mock::MockClock;
    use crate::core::JobRegistry;
    use crate::core::failure::{FailedJob, RemovalReason};
    use crate::job::Job;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};
    use tempfile::TempDir;

    static CALLS: LazyLock<Mutex<HashMap<String, u32>>> = LazyLock::new(Default::default);

    #[derive(Debug, Serialize, Deserialize)]
    struct Picky {
        name: String,
        fail_first: u32,
    }

    impl Picky {
        fn new(name: &str, fail_first: u32) -> Self {
            Self {
                name: name.to_string(),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl Job for Picky {
        fn job_type() -> &'static str {
            "picky"
        }

        fn delay(&self) -> Duration {
            Duration::ZERO
        }

        fn retries(&self) -> u32 {
            2
        }

        fn backoff(&self) -> Duration {
            Duration::from_secs(10)
        }

        async fn process(&self) -> CourierResult<()> {
            let call = {
                let mut calls = CALLS.lock().unwrap();
                let count = calls.entry(self.name.clone()).or_default();
                *count += 1;
                *count
            };
            if call <= self.fail_first {
                Err(CourierError::job(format!("attempt {call} refused")))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        queue: DatabaseQueue,
        clock: Arc<MockClock>,
        cache: Arc<InMemoryCache>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());

        let mut registry = JobRegistry::new();
        registry.register::<Picky>();

        let clock = Arc::new(MockClock::at_secs(1_700_000_000));
        let cache = Arc::new(InMemoryCache::new());
        let context = AdapterContext::new(Arc::new(registry))
            .with_clock(clock.clone())
            .with_cache(cache.clone());

        let queue = DatabaseQueue::connect_lazy(DatabaseConfig::new(url), context).unwrap();
        queue.install().await.unwrap();

        Fixture {
            _dir: dir,
            queue,
            clock,
            cache,
        }
    }

    #[tokio::test]
    async fn test_failed_job_waits_for_backoff_then_succeeds() {
        let fx = fixture().await;

        let envelope = JobEnvelope::from_job(&Picky::new("backoff", 1)).unwrap();
        let id = fx.queue.push(envelope).await.unwrap();

        assert_eq!(fx.queue.run("default").await.unwrap(), RunOutcome::Retried);
        assert_eq!(
            fx.queue.job_state(&id).await.unwrap(),
            Some((JobStatus::Pending, 1))
        );

        // Still inside the backoff window
        fx.clock.advance(Duration::from_secs(9));
        assert_eq!(fx.queue.run("default").await.unwrap(), RunOutcome::Idle);

        fx.clock.advance(Duration::from_secs(1));
        assert_eq!(fx.queue.run("default").await.unwrap(), RunOutcome::Completed);
        assert_eq!(
            fx.queue.job_state(&id).await.unwrap(),
            Some((JobStatus::Processed, 1))
        );
        assert_eq!(fx.queue.size("default").await.unwrap(), 0);

        let record = fx.cache.get(&FailedJob::cache_key_for(&id)).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_retry_ceiling_removes_job() {
        let fx = fixture().await;
        fx.queue.set_retry(Some(0));

        let envelope = JobEnvelope::from_job(&Picky::new("ceiling", 5)).unwrap();
        let id = fx.queue.push(envelope).await.unwrap();

        assert_eq!(
            fx.queue.run("default").await.unwrap(),
            RunOutcome::Removed(RemovalReason::Exhausted)
        );
        assert_eq!(fx.queue.job_state(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_deleted() {
        let fx = fixture().await;
        let now = timestamp(fx.clock.now_secs()).unwrap();

        sqlx::query(
            "INSERT INTO queue_jobs \
             (id, queue, payload, attempts, status, available_at, reserved_at, created_at) \
             VALUES ('broken', 'default', 'not json', 3, 'pending', ?, NULL, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(fx.queue.pool())
        .await
        .unwrap();

        assert_eq!(
            fx.queue.run("default").await.unwrap(),
            RunOutcome::Removed(RemovalReason::Corrupt)
        );
        assert_eq!(fx.queue.size("default").await.unwrap(), 0);
        assert_eq!(fx.cache.keys().await, vec!["job:failed:broken"]);
    }

    #[tokio::test]
    async fn test_reclaimed_row_ignores_late_worker() {
        let fx = fixture().await;
        let envelope = JobEnvelope::from_job(&Picky::new("late", 0)).unwrap();
        let id = fx.queue.push(envelope).await.unwrap();

        let first = fx.queue.reserve("default", None).await.unwrap().unwrap();
        assert_eq!(first.attempts, 2);

        fx.clock.advance(Duration::from_secs(90));
        let second = fx.queue.reserve("default", None).await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.attempts, 1);

        // The first worker wakes up after losing its reservation
        assert!(!fx.queue.mark_processed(&first).await.unwrap());
        assert!(!fx.queue.release(&first, 2, Duration::ZERO).await.unwrap());
        assert!(!fx.queue.remove(&first).await.unwrap());
        assert_eq!(
            fx.queue.job_state(&id).await.unwrap(),
            Some((JobStatus::Reserved, 1))
        );

        assert!(fx.queue.mark_processed(&second).await.unwrap());
        assert_eq!(
            fx.queue.job_state(&id).await.unwrap(),
            Some((JobStatus::Processed, 1))
        );
    }

    #[tokio::test]
    async fn test_stale_row_without_retries_is_swept() {
        let fx = fixture().await;
        let envelope = JobEnvelope::from_job(&Picky::new("swept", 0)).unwrap();
        let id = fx.queue.push(envelope).await.unwrap();

        // Reserved and abandoned three times: 2 retries, then 1, then none
        for left in [2, 1, 0] {
            let reservation = fx.queue.reserve("default", None).await.unwrap().unwrap();
            assert_eq!(reservation.attempts, left);
            fx.clock.advance(Duration::from_secs(90));
        }

        assert!(fx.queue.reserve("default", None).await.unwrap().is_none());
        assert_eq!(
            fx.queue.run("default").await.unwrap(),
            RunOutcome::Removed(RemovalReason::Exhausted)
        );
        assert_eq!(fx.queue.job_state(&id).await.unwrap(), None);
        assert_eq!(fx.cache.keys().await, vec![FailedJob::cache_key_for(&id)]);
        assert_eq!(CALLS.lock().unwrap().get("swept"), None);
    }

    #[tokio::test]
    async fn test_job_timeout_stays_inside_reservation() {
        let pool = SqlitePoolOptions::new().connect_lazy("sqlite::memory:").unwrap();
        let context = AdapterContext::new(Arc::new(JobRegistry::new()));

        let config = DatabaseConfig::new("sqlite::memory:").with_reservation_timeout(90);
        let queue = DatabaseQueue::with_pool(pool.clone(), config, context.clone());
        assert_eq!(queue.poll.snapshot().job_timeout, Some(Duration::from_secs(88)));

        let config = DatabaseConfig::new("sqlite::memory:").with_reservation_timeout(1);
        let queue = DatabaseQueue::with_pool(pool, config, context);
        assert_eq!(queue.poll.snapshot().job_timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_stats_delete_and_prune() {
        let fx = fixture().await;

        let keep = fx
            .queue
            .push(JobEnvelope::from_job(&Picky::new("stats", 0)).unwrap())
            .await
            .unwrap();
        let drop_me = fx
            .queue
            .push(JobEnvelope::from_job(&Picky::new("stats", 0)).unwrap())
            .await
            .unwrap();

        assert!(fx.queue.delete("default", &drop_me).await.unwrap());
        assert!(!fx.queue.delete("other", &keep).await.unwrap());

        assert_eq!(fx.queue.run("default").await.unwrap(), RunOutcome::Completed);
        assert_eq!(
            fx.queue.stats("default").await.unwrap(),
            QueueStats {
                pending: 0,
                reserved: 0,
                processed: 1
            }
        );

        assert_eq!(fx.queue.prune_processed(Duration::from_secs(60)).await.unwrap(), 0);
        fx.clock.advance(Duration::from_secs(61));
        assert_eq!(fx.queue.prune_processed(Duration::from_secs(60)).await.unwrap(), 1);
        fx.queue.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_table_rejected_by_factory() {
        let registry = Arc::new(JobRegistry::new());
        let err = DatabaseFactory
            .configure(
                "database",
                &serde_json::json!({"url": "sqlite::memory:", "table": "jobs;--"}),
                &AdapterContext::new(registry),
            )
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
