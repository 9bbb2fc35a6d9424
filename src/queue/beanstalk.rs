//! Beanstalk backend: a local beanstalkd daemon spoken to over TCP.
//!
//! Queues map to tubes. A worker `watch`es its tube and reserves jobs with
//! `reserve-with-timeout`; the daemon hands a reserved job to someone else
//! once its time-to-run expires. Success deletes the job. A retriable
//! failure releases it with the job's backoff as delay. A job that opted out
//! is deleted, and one that ran out of retries or cannot be decoded is
//! buried for an operator to inspect.
//!
//! Producers and the worker use separate connections, since a reserved job
//! is tied to the connection that reserved it.

use super::{
    AdapterContext, AdapterFactory, Delivery, Execution, PollState, QueueAdapter, RunOutcome,
    SharedPollState,
};
use crate::config::{BeanstalkConfig, parse_backend_config};
use crate::core::failure::{
    JobFailure, RemovalReason, RetryDecision, decide, retries_left, retry_budget,
};
use crate::error::{CourierError, CourierResult};
use crate::job::{JobEnvelope, JobId};
use crate::utils::duration_secs_u32;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

/// Priority used when a job's own priority is unknown.
pub const DEFAULT_PRIORITY: u32 = 1024;

const MAX_TUBE_NAME: usize = 200;

/// Check a tube name against the daemon's naming rules.
pub fn validate_tube(name: &str) -> CourierResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c));
    if name.is_empty() || name.len() > MAX_TUBE_NAME || name.starts_with('-') || !valid_chars {
        return Err(CourierError::queue_msg(format!("invalid tube name '{name}'")));
    }
    Ok(())
}

/// Parse the flat `key: value` YAML returned by the `stats-*` commands.
fn parse_stats(body: &str) -> HashMap<String, String> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn stat(stats: &HashMap<String, String>, key: &str) -> u64 {
    stats
        .get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

/// One protocol connection.
#[derive(Debug)]
struct Wire {
    stream: BufReader<TcpStream>,
    using: String,
    watching: String,
}

impl Wire {
    async fn connect(config: &BeanstalkConfig) -> CourierResult<Self> {
        let address = config.address();
        let stream = timeout(
            Duration::from_secs(config.connect_timeout_secs),
            TcpStream::connect(&address),
        )
        .await
        .map_err(|e| {
            CourierError::queue(format!("Timed out connecting to beanstalkd at {address}"), e)
        })??;

        tracing::debug!("Connected to beanstalkd at {}", address);
        Ok(Self {
            stream: BufReader::new(stream),
            using: crate::job::DEFAULT_QUEUE.to_string(),
            watching: crate::job::DEFAULT_QUEUE.to_string(),
        })
    }

    /// Send one command line, optionally followed by a data block, and read the reply line.
    async fn command(&mut self, line: &str, data: Option<&[u8]>) -> CourierResult<String> {
        let mut request = Vec::with_capacity(line.len() + 2 + data.map_or(0, |d| d.len() + 2));
        request.extend_from_slice(line.as_bytes());
        request.extend_from_slice(b"\r\n");
        if let Some(data) = data {
            request.extend_from_slice(data);
            request.extend_from_slice(b"\r\n");
        }

        self.stream.get_mut().write_all(&request).await?;
        self.stream.get_mut().flush().await?;

        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            return Err(CourierError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "beanstalkd closed the connection",
            )));
        }

        let reply = reply.trim_end().to_string();
        match reply.as_str() {
            "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND" => Err(
                CourierError::protocol(format!("'{line}' rejected: {reply}")),
            ),
            _ => Ok(reply),
        }
    }

    /// Read a `<bytes>`-long data block and its trailing CRLF.
    async fn read_data(&mut self, bytes: &str) -> CourierResult<Vec<u8>> {
        let len: usize = bytes
            .parse()
            .map_err(|_| CourierError::protocol(format!("bad data length '{bytes}'")))?;
        let mut buf = vec![0u8; len + 2];
        self.stream.read_exact(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn use_tube(&mut self, tube: &str) -> CourierResult<()> {
        if self.using == tube {
            return Ok(());
        }
        validate_tube(tube)?;
        let reply = self.command(&format!("use {tube}"), None).await?;
        if reply != format!("USING {tube}") {
            return Err(unexpected("use", &reply));
        }
        self.using = tube.to_string();
        Ok(())
    }

    /// Watch `tube` and nothing else.
    async fn watch_only(&mut self, tube: &str) -> CourierResult<()> {
        if self.watching == tube {
            return Ok(());
        }
        validate_tube(tube)?;

        let reply = self.command(&format!("watch {tube}"), None).await?;
        if !reply.starts_with("WATCHING ") {
            return Err(unexpected("watch", &reply));
        }

        let previous = std::mem::replace(&mut self.watching, tube.to_string());
        let reply = self.command(&format!("ignore {previous}"), None).await?;
        if !reply.starts_with("WATCHING ") && reply != "NOT_IGNORED" {
            return Err(unexpected("ignore", &reply));
        }
        Ok(())
    }

    async fn put(&mut self, priority: u32, delay: u32, ttr: u32, body: &str) -> CourierResult<u64> {
        let reply = self
            .command(
                &format!("put {priority} {delay} {ttr} {}", body.len()),
                Some(body.as_bytes()),
            )
            .await?;

        match reply.split_once(' ') {
            Some(("INSERTED", id)) => parse_id(id),
            Some(("BURIED", id)) => Err(CourierError::queue_msg(format!(
                "beanstalkd buried job {id} on insert (out of memory)"
            ))),
            _ if reply == "JOB_TOO_BIG" || reply == "DRAINING" || reply == "EXPECTED_CRLF" => {
                Err(CourierError::queue_msg(format!("put rejected: {reply}")))
            }
            _ => Err(unexpected("put", &reply)),
        }
    }

    async fn reserve(&mut self, wait: u32) -> CourierResult<Option<(u64, Vec<u8>)>> {
        let reply = self
            .command(&format!("reserve-with-timeout {wait}"), None)
            .await?;

        let mut parts = reply.split(' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("RESERVED"), Some(id), Some(bytes)) => {
                let id = parse_id(id)?;
                let body = self.read_data(bytes).await?;
                Ok(Some((id, body)))
            }
            (Some("TIMED_OUT" | "DEADLINE_SOON"), None, None) => Ok(None),
            _ => Err(unexpected("reserve-with-timeout", &reply)),
        }
    }

    /// Run a command whose reply is `<expected>` or `NOT_FOUND`.
    async fn simple(&mut self, line: &str, expected: &str) -> CourierResult<bool> {
        let reply = self.command(line, None).await?;
        if reply == expected {
            Ok(true)
        } else if reply == "NOT_FOUND" {
            Ok(false)
        } else {
            Err(unexpected(line, &reply))
        }
    }

    async fn delete(&mut self, id: u64) -> CourierResult<bool> {
        self.simple(&format!("delete {id}"), "DELETED").await
    }

    async fn release(&mut self, id: u64, priority: u32, delay: u32) -> CourierResult<bool> {
        self.simple(&format!("release {id} {priority} {delay}"), "RELEASED")
            .await
    }

    async fn bury(&mut self, id: u64, priority: u32) -> CourierResult<bool> {
        self.simple(&format!("bury {id} {priority}"), "BURIED").await
    }

    async fn stats(&mut self, line: &str) -> CourierResult<Option<HashMap<String, String>>> {
        let reply = self.command(line, None).await?;
        match reply.split_once(' ') {
            Some(("OK", bytes)) => {
                let body = self.read_data(bytes).await?;
                Ok(Some(parse_stats(&String::from_utf8_lossy(&body))))
            }
            _ if reply == "NOT_FOUND" => Ok(None),
            _ => Err(unexpected(line, &reply)),
        }
    }
}

fn parse_id(id: &str) -> CourierResult<u64> {
    id.parse()
        .map_err(|_| CourierError::protocol(format!("bad job id '{id}'")))
}

fn unexpected(command: &str, reply: &str) -> CourierError {
    CourierError::protocol(format!("unexpected reply to '{command}': {reply}"))
}

/// A connection checked out of its slot. Put back by [`Lease::finish`]
/// unless the operation broke it.
struct Lease<'a> {
    slot: MutexGuard<'a, Option<Wire>>,
    wire: Wire,
}

impl Lease<'_> {
    fn finish<T>(mut self, result: CourierResult<T>) -> CourierResult<T> {
        match &result {
            Err(CourierError::Io(e)) => {
                tracing::warn!("Dropping beanstalkd connection: {}", e);
            }
            Err(CourierError::Protocol { message }) => {
                tracing::warn!("Dropping beanstalkd connection: {}", message);
            }
            _ => *self.slot = Some(self.wire),
        }
        result
    }
}

/// Beanstalkd-backed queue.
#[derive(Debug)]
pub struct BeanstalkQueue {
    config: BeanstalkConfig,
    context: AdapterContext,
    poll: SharedPollState,
    producer: Mutex<Option<Wire>>,
    consumer: Mutex<Option<Wire>>,
}

impl BeanstalkQueue {
    /// Build the queue. Connections are opened on first use.
    pub fn new(config: BeanstalkConfig, context: AdapterContext) -> CourierResult<Self> {
        config.validate()?;
        let poll = SharedPollState::new(PollState {
            // reserve-with-timeout already blocks
            sleep: Duration::ZERO,
            job_timeout: Some(Duration::from_secs(u64::from(config.ttr_secs))),
            ..Default::default()
        });

        Ok(Self {
            config,
            context,
            poll,
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
        })
    }

    async fn lease<'a>(&self, slot: &'a Mutex<Option<Wire>>) -> CourierResult<Lease<'a>> {
        let mut slot = slot.lock().await;
        let wire = match slot.take() {
            Some(wire) => wire,
            None => Wire::connect(&self.config).await?,
        };
        Ok(Lease { slot, wire })
    }

    /// Reserve and handle at most one job on an already leased consumer connection.
    async fn run_on(&self, wire: &mut Wire, queue: &str) -> CourierResult<RunOutcome> {
        let state = self.poll.snapshot();
        wire.watch_only(queue).await?;

        let Some((id, body)) = wire.reserve(self.config.reserve_timeout_secs).await? else {
            return Ok(RunOutcome::Idle);
        };

        // A body that is not UTF-8 is the job's fault, not the connection's
        let (body, not_utf8) = match String::from_utf8(body) {
            Ok(body) => (body, None),
            Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), Some(e)),
        };

        let record_id = id.to_string();
        let delivery = Delivery {
            backend: self.driver(),
            queue,
            record_id: &record_id,
            raw: &body,
        };

        let execution = match not_utf8 {
            None => self.context.execute(&delivery, state.job_timeout).await,
            Some(error) => {
                tracing::error!(
                    "Undecodable body for beanstalk job {} on tube {}: {}",
                    id,
                    queue,
                    error
                );
                Execution::Failed {
                    envelope: None,
                    failure: JobFailure::corrupt(CourierError::protocol(format!(
                        "job body is not valid UTF-8: {error}"
                    ))),
                }
            }
        };

        match execution {
            Execution::Completed(envelope) => {
                wire.delete(id).await?;
                tracing::info!("Job {} ({}) processed", envelope.id, envelope.job_type);
                Ok(RunOutcome::Completed)
            }
            Execution::Failed { envelope, failure } => {
                let (retries, backoff, priority) = envelope.as_ref().map_or(
                    (0, Duration::ZERO, DEFAULT_PRIORITY),
                    |e| (e.retries, e.backoff(), e.priority),
                );

                let reserves = match wire.stats(&format!("stats-job {id}")).await? {
                    Some(stats) => u32::try_from(stat(&stats, "reserves")).unwrap_or(u32::MAX),
                    None => 1,
                };
                let left = retries_left(retry_budget(retries, state.retry), reserves);
                let decision = decide(failure.disposition, left, backoff);

                match decision {
                    RetryDecision::Release { remaining, backoff } => {
                        wire.release(id, priority, duration_secs_u32(backoff)).await?;
                        tracing::warn!(
                            "Beanstalk job {} released with {} retries left, delay {:?}",
                            id,
                            remaining,
                            backoff
                        );
                    }
                    RetryDecision::Remove(RemovalReason::OptedOut) => {
                        wire.delete(id).await?;
                        tracing::warn!("Beanstalk job {} deleted on request", id);
                    }
                    RetryDecision::Remove(reason) => {
                        wire.bury(id, priority).await?;
                        tracing::warn!("Beanstalk job {} buried: {:?}", id, reason);
                    }
                }

                self.context
                    .quarantine(&delivery, envelope.as_ref(), &failure, decision)
                    .await;
                Ok(decision.into())
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for BeanstalkQueue {
    fn driver(&self) -> &'static str {
        "beanstalk"
    }

    fn poll_state(&self) -> &SharedPollState {
        &self.poll
    }

    async fn push(&self, envelope: JobEnvelope) -> CourierResult<JobId> {
        let body = envelope.encode()?;
        let delay = duration_secs_u32(envelope.delay());

        let mut lease = self.lease(&self.producer).await?;
        let result = async {
            lease.wire.use_tube(&envelope.queue).await?;
            lease
                .wire
                .put(envelope.priority, delay, self.config.ttr_secs, &body)
                .await
        }
        .await;
        let id = lease.finish(result)?;

        tracing::debug!(
            "Pushed job {} ({}) to tube {} as {}",
            envelope.id,
            envelope.job_type,
            envelope.queue,
            id
        );
        super::record_push(self.driver(), &envelope.queue);
        Ok(id.to_string())
    }

    async fn run(&self, queue: &str) -> CourierResult<RunOutcome> {
        let mut lease = self.lease(&self.consumer).await?;
        let result = self.run_on(&mut lease.wire, queue).await;
        let outcome = lease.finish(result)?;

        super::record_outcome(self.driver(), queue, outcome);
        Ok(outcome)
    }

    /// Ready, delayed and reserved jobs of the tube. Buried jobs are not counted.
    async fn size(&self, queue: &str) -> CourierResult<u64> {
        validate_tube(queue)?;
        let mut lease = self.lease(&self.producer).await?;
        let result = lease.wire.stats(&format!("stats-tube {queue}")).await;

        Ok(lease.finish(result)?.map_or(0, |stats| {
            stat(&stats, "current-jobs-ready")
                + stat(&stats, "current-jobs-delayed")
                + stat(&stats, "current-jobs-reserved")
        }))
    }

    async fn delete(&self, _queue: &str, id: &str) -> CourierResult<bool> {
        let Ok(id) = id.parse::<u64>() else {
            return Ok(false);
        };
        let mut lease = self.lease(&self.producer).await?;
        let result = lease.wire.delete(id).await;
        lease.finish(result)
    }

    async fn health_check(&self) -> CourierResult<()> {
        let mut lease = self.lease(&self.producer).await?;
        let result = lease.wire.command("list-tube-used", None).await;
        match lease.finish(result)? {
            reply if reply.starts_with("USING ") => Ok(()),
            reply => Err(unexpected("list-tube-used", &reply)),
        }
    }
}

/// Factory for the `beanstalk` driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct BeanstalkFactory;

#[async_trait]
impl AdapterFactory for BeanstalkFactory {
    async fn configure(
        &self,
        connection: &str,
        config: &serde_json::Value,
        context: &AdapterContext,
    ) -> CourierResult<Arc<dyn QueueAdapter>> {
        let config: BeanstalkConfig = parse_backend_config(connection, config)?;
        Ok(Arc::new(BeanstalkQueue::new(config, context.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tube_names() {
        assert!(validate_tube("emails").is_ok());
        assert!(validate_tube("reports.daily_v2").is_ok());
        assert!(validate_tube("").is_err());
        assert!(validate_tube("-leading").is_err());
        assert!(validate_tube("two words").is_err());
        assert!(validate_tube("evil\r\ndelete 1").is_err());
        assert!(validate_tube(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats("---\nid: 7\ntube: emails\nreserves: 3\ncurrent-jobs-ready: 2\n");
        assert_eq!(stat(&stats, "reserves"), 3);
        assert_eq!(stat(&stats, "current-jobs-ready"), 2);
        assert_eq!(stat(&stats, "missing"), 0);
        assert_eq!(stats.get("tube").map(String::as_str), Some("emails"));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_transient() {
        let config = BeanstalkConfig {
            host: "127.0.0.1".to_string(),
            // Nothing listens on port 1 in a test environment
            port: 1,
            ..Default::default()
        };
        let registry = Arc::new(crate::core::JobRegistry::new());
        let queue = BeanstalkQueue::new(config, AdapterContext::new(registry)).unwrap();

        let err = queue.run("default").await.unwrap_err();
        assert!(!err.is_configuration());
    }
}
