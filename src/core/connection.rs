//! Backend selection.
//!
//! An [`AdapterRegistry`] maps driver names to the factories that build
//! adapters. A [`Connection`] picks a connection name (explicitly or via
//! `queue.default`), looks up its `connections.<name>` entry, builds the
//! adapter once and forwards queue operations to it.

use crate::cache::{FailedJobCache, InMemoryCache};
use crate::clock::Clock;
use crate::config::{CacheConfig, CourierConfig, QueueSettings};
use crate::core::JobRegistry;
use crate::error::{CourierError, CourierResult};
use crate::job::{Job, JobEnvelope, JobId};
use crate::queue::{
    AdapterContext, AdapterFactory, BeanstalkFactory, MemoryQueueFactory, QueueAdapter,
    RunOutcome, SyncFactory,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Driver name to adapter factory.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("drivers", &self.drivers())
            .finish()
    }
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every driver compiled into this build.
    pub fn with_defaults() -> Self {
        let mut factories: HashMap<String, Arc<dyn AdapterFactory>> = HashMap::new();
        factories.insert("sync".to_string(), Arc::new(SyncFactory));
        factories.insert("memory".to_string(), Arc::new(MemoryQueueFactory));
        factories.insert("beanstalk".to_string(), Arc::new(BeanstalkFactory));

        #[cfg(feature = "database-queue")]
        factories.insert(
            "database".to_string(),
            Arc::new(crate::queue::DatabaseFactory),
        );

        #[cfg(feature = "sqs-queue")]
        factories.insert("sqs".to_string(), Arc::new(crate::queue::SqsFactory));

        Self { factories }
    }

    /// Register a factory under `name`.
    ///
    /// Fails with [`CourierError::DuplicateConnection`] if the name is taken;
    /// the existing registration is kept.
    pub fn push_connection(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn AdapterFactory>,
    ) -> CourierResult<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(CourierError::DuplicateConnection { name });
        }
        tracing::debug!("Registered queue driver '{}'", name);
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Factory registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(name).cloned()
    }

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Entry point for producers and workers.
///
/// ```rust
/// use courierq::prelude::*;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> CourierResult<()> {
/// let settings = QueueSettings::with_default("sync").with_connection("sync", json!({}));
/// let connection = Connection::new(settings, Arc::new(JobRegistry::new()));
/// assert_eq!(connection.connection_name(), "sync");
/// connection.health_check().await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    drivers: AdapterRegistry,
    settings: QueueSettings,
    context: AdapterContext,
    selected: Option<String>,
    adapters: Mutex<HashMap<String, Arc<dyn QueueAdapter>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection", &self.connection_name())
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// A connection using every built-in driver.
    pub fn new(settings: QueueSettings, registry: Arc<JobRegistry>) -> Self {
        Self::with_context(settings, AdapterContext::new(registry))
    }

    /// A connection whose adapters receive `context`.
    pub fn with_context(settings: QueueSettings, context: AdapterContext) -> Self {
        Self {
            drivers: AdapterRegistry::with_defaults(),
            settings,
            context,
            selected: None,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Build a connection from a loaded configuration, including its failed-job cache.
    pub async fn from_config(
        config: &CourierConfig,
        registry: Arc<JobRegistry>,
    ) -> CourierResult<Self> {
        let mut context = AdapterContext::new(registry);

        match &config.cache {
            None => {}
            Some(CacheConfig::Memory) => {
                context = context.with_cache(Arc::new(InMemoryCache::new()));
            }
            #[cfg(feature = "redis-cache")]
            Some(CacheConfig::Redis(redis)) => {
                let cache: Arc<dyn FailedJobCache> =
                    Arc::new(crate::cache::RedisCache::new(redis.clone()).await?);
                context = context.with_cache(cache);
            }
        }

        Ok(Self::with_context(config.queue.clone(), context))
    }

    /// Replace the driver registry.
    pub fn with_adapters(mut self, drivers: AdapterRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    /// Attach a failed-job cache to adapters built from now on.
    pub fn with_cache(mut self, cache: Arc<dyn FailedJobCache>) -> Self {
        self.context = self.context.with_cache(cache);
        self
    }

    /// Register an extra driver. See [`AdapterRegistry::push_connection`].
    pub fn push_connection(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn AdapterFactory>,
    ) -> CourierResult<()> {
        self.drivers.push_connection(name, factory)
    }

    /// Select the connection used by [`adapter`](Self::adapter) and the delegating methods.
    pub fn set_connection(&mut self, name: impl Into<String>) -> &mut Self {
        self.selected = Some(name.into());
        self
    }

    /// Selected connection, or `queue.default` when none was selected.
    pub fn connection_name(&self) -> &str {
        self.selected.as_deref().unwrap_or(&self.settings.default)
    }

    /// Context handed to adapters.
    pub fn context(&self) -> &AdapterContext {
        &self.context
    }

    /// Adapter for the selected connection, built on first use.
    pub async fn adapter(&self) -> CourierResult<Arc<dyn QueueAdapter>> {
        self.adapter_for(self.connection_name()).await
    }

    /// Adapter for a named connection, built on first use.
    pub async fn adapter_for(&self, name: &str) -> CourierResult<Arc<dyn QueueAdapter>> {
        let mut adapters = self.adapters.lock().await;
        if let Some(adapter) = adapters.get(name) {
            return Ok(Arc::clone(adapter));
        }

        let config = self.settings.connection(name)?;
        let driver = self.settings.driver_of(name)?;
        let factory = self.drivers.get(&driver).ok_or_else(|| {
            CourierError::config(format!(
                "connection '{}' uses unknown driver '{}' (available: {})",
                name,
                driver,
                self.drivers.drivers().join(", ")
            ))
        })?;

        let adapter = factory.configure(name, config, &self.context).await?;
        tracing::info!("Configured queue connection '{}' ({})", name, driver);
        adapters.insert(name.to_string(), Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Serialize `job` and push it to the selected backend.
    pub async fn push<J: Job>(&self, job: &J) -> CourierResult<JobId> {
        let envelope = JobEnvelope::from_job_at(job, self.context.clock.now_secs())?;
        self.push_envelope(envelope).await
    }

    /// Push an already serialized job.
    pub async fn push_envelope(&self, envelope: JobEnvelope) -> CourierResult<JobId> {
        self.adapter().await?.push(envelope).await
    }

    /// One poll cycle on `queue`.
    pub async fn run(&self, queue: &str) -> CourierResult<RunOutcome> {
        self.adapter().await?.run(queue).await
    }

    /// Outstanding jobs on `queue`.
    pub async fn size(&self, queue: &str) -> CourierResult<u64> {
        self.adapter().await?.size(queue).await
    }

    /// Remove a record from `queue`.
    pub async fn delete(&self, queue: &str, id: &str) -> CourierResult<bool> {
        self.adapter().await?.delete(queue, id).await
    }

    pub async fn health_check(&self) -> CourierResult<()> {
        self.adapter().await?.health_check().await
    }

    /// Health of every configured connection, checked concurrently, sorted by name.
    pub async fn health_check_all(&self) -> Vec<(String, CourierResult<()>)> {
        let mut names: Vec<&String> = self.settings.connections.keys().collect();
        names.sort();

        join_all(names.into_iter().map(|name| async move {
            let result = match self.adapter_for(name).await {
                Ok(adapter) => adapter.health_check().await,
                Err(e) => Err(e),
            };
            (name.clone(), result)
        }))
        .await
    }
}
