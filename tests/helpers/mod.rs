#![allow(dead_code)]

use courierq::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

static CALLS: LazyLock<Mutex<HashMap<String, u32>>> = LazyLock::new(Default::default);

/// Number of times the job named `name` has run in this test binary.
pub fn calls(name: &str) -> u32 {
    CALLS.lock().unwrap().get(name).copied().unwrap_or_default()
}

fn bump(name: &str) -> u32 {
    let mut calls = CALLS.lock().unwrap();
    let count = calls.entry(name.to_string()).or_default();
    *count += 1;
    *count
}

/// Fails its first `fail_first` runs, then succeeds. Test names must be unique
/// since the call counters are shared by every test in a binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flaky {
    pub name: String,
    pub queue: String,
    pub fail_first: u32,
    pub retries: u32,
    pub backoff_secs: u64,
    pub delay_secs: u64,
}

impl Flaky {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            fail_first: 0,
            retries: 3,
            backoff_secs: 0,
            delay_secs: 0,
        }
    }

    pub fn on(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn failing(mut self, fail_first: u32) -> Self {
        self.fail_first = fail_first;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff(mut self, secs: u64) -> Self {
        self.backoff_secs = secs;
        self
    }

    pub fn delayed(mut self, secs: u64) -> Self {
        self.delay_secs = secs;
        self
    }
}

#[async_trait]
impl Job for Flaky {
    fn job_type() -> &'static str {
        "flaky"
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    async fn process(&self) -> CourierResult<()> {
        let call = bump(&self.name);
        if call <= self.fail_first {
            Err(CourierError::job(format!("{} refused attempt {}", self.name, call)))
        } else {
            Ok(())
        }
    }
}

/// Never finishes on its first run, succeeds afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stalls {
    pub name: String,
}

#[async_trait]
impl Job for Stalls {
    fn job_type() -> &'static str {
        "stalls"
    }

    fn delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn process(&self) -> CourierResult<()> {
        if bump(&self.name) == 1 {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<Flaky>().register::<Stalls>();
    registry
}
