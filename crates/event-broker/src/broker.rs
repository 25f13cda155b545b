//! Broker façade.
//!
//! The [`Broker`] ties a [`Provider`], the [`SubscriptionManager`] and (in
//! async mode) a [`WorkerPool`] together. Publishing stores the event
//! through the provider, then dispatches it to every matching handler
//! either on the caller's task (sync) or on the pool (async).
//!
//! Each handler gets its own retry budget and its own copy of the event.
//! A failing or panicking handler never prevents the others from running.

use crate::config::{default_instance_id, BrokerConfig, DeliveryMode};
use crate::error::{BrokerError, BrokerResult};
use crate::metrics::MetricsSink;
use crate::pool::{Processor, WorkerPool};
use crate::provider::{create_provider, Provider, ProviderStats};
use crate::retry::{with_retry, RetryPolicy};
use crate::subscription::{EventHandler, SubscriptionInfo, SubscriptionManager};
use crate::types::{Event, EventSource, EventStatus};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Broker statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerStats {
    pub mode: DeliveryMode,
    pub running: bool,
    /// Events accepted by the provider
    pub total_published: u64,
    /// Events whose handlers all succeeded
    pub total_processed: u64,
    /// Events with at least one handler failing after retries
    pub total_failed: u64,
    /// Handler retry attempts across all events
    pub total_retries: u64,
    /// Events published with no matching subscription
    pub total_unrouted: u64,
    pub active_subscribers: usize,
    /// Pool counters, present in async mode
    pub worker_count: Option<usize>,
    pub queue_size: Option<usize>,
    pub active_workers: Option<usize>,
    /// Provider snapshot; absent if the provider could not report
    pub provider: Option<ProviderStats>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    unrouted: AtomicU64,
}

/// State shared between the façade and pool workers.
struct BrokerInner {
    provider: Arc<dyn Provider>,
    subscriptions: SubscriptionManager,
    retry: RetryPolicy,
    metrics: Option<Arc<dyn MetricsSink>>,
    counters: Counters,
    /// Aborts retries of in-flight async work once a stop deadline passes
    shutdown: CancellationToken,
}

impl BrokerInner {
    /// Run every matching handler and persist the resulting status.
    ///
    /// Returns the last handler error, if any.
    async fn process_event(&self, mut event: Event, cancel: &CancellationToken) -> BrokerResult<()> {
        let subscriptions = self.subscriptions.get_matching(&event.event_type).await;
        if subscriptions.is_empty() {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "No subscribers for event");
            return Ok(());
        }

        let started = Instant::now();
        if event.mark_processing() {
            self.persist_status(&event.id, EventStatus::Processing, None).await;
        }

        let mut retries: u32 = 0;
        let mut last_error: Option<BrokerError> = None;

        for subscription in &subscriptions {
            let handler = &subscription.handler;
            let snapshot = &event;

            let result = with_retry(
                &self.retry,
                cancel,
                |attempt| {
                    retries += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event_id = %snapshot.id,
                        subscription_id = %subscription.id,
                        attempt = attempt,
                        "Retrying handler"
                    );
                },
                || invoke(handler, snapshot.clone()),
            )
            .await;

            if let Err(e) = result {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Handler failed"
                );
                let cancelled = matches!(e, BrokerError::Cancelled);
                last_error = Some(e);
                if cancelled {
                    break;
                }
            }
        }

        if retries > 0 {
            event.retry_count = event.retry_count.saturating_add(retries);
            if let Err(e) = self.provider.record_retries(&event.id, event.retry_count).await {
                tracing::warn!(event_id = %event.id, error = %e, "Failed to persist retry count");
            }
        }

        match &last_error {
            Some(e) => {
                event.mark_failed(e.to_string());
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                event.mark_completed();
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.persist_status(&event.id, event.status, event.error.as_deref())
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_event_processed(
                event.source,
                &event.event_type,
                event.status,
                started.elapsed(),
            );
        }

        tracing::debug!(
            event_id = %event.id,
            status = %event.status,
            handlers = subscriptions.len(),
            "Event processed"
        );

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Status writes are best-effort; dispatch continues if they fail.
    async fn persist_status(&self, id: &str, status: EventStatus, error: Option<&str>) {
        if let Err(e) = self.provider.update_status(id, status, error).await {
            tracing::warn!(event_id = %id, status = %status, error = %e, "Failed to persist event status");
        }
    }
}

async fn invoke(handler: &Arc<dyn EventHandler>, event: Event) -> BrokerResult<()> {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(BrokerError::handler(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    provider: Arc<dyn Provider>,
    mode: DeliveryMode,
    worker_count: usize,
    buffer_size: usize,
    retry: RetryPolicy,
    metrics: Option<Arc<dyn MetricsSink>>,
    shutdown_timeout: Duration,
    instance_id: String,
}

impl BrokerBuilder {
    /// Start a builder with default settings over a provider.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            mode: DeliveryMode::Async,
            worker_count: 10,
            buffer_size: 1000,
            retry: RetryPolicy::default(),
            metrics: None,
            shutdown_timeout: Duration::from_secs(30),
            instance_id: default_instance_id(),
        }
    }

    pub fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Build a stopped broker. Call [`Broker::start`] before publishing.
    pub fn build(self) -> Broker {
        let inner = Arc::new(BrokerInner {
            provider: self.provider,
            subscriptions: SubscriptionManager::new(),
            retry: self.retry,
            metrics: self.metrics,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });

        let pool = match self.mode {
            DeliveryMode::Async => {
                let shared = inner.clone();
                let processor: Processor = Arc::new(move |event| {
                    let inner = shared.clone();
                    async move {
                        let cancel = inner.shutdown.clone();
                        inner.process_event(event, &cancel).await
                    }
                    .boxed()
                });
                Some(WorkerPool::new(self.worker_count, self.buffer_size, processor))
            }
            DeliveryMode::Sync => None,
        };

        Broker {
            inner,
            pool,
            mode: self.mode,
            state: Mutex::new(Lifecycle::Idle),
            shutdown_timeout: self.shutdown_timeout,
            instance_id: self.instance_id,
        }
    }
}

/// Event broker.
pub struct Broker {
    inner: Arc<BrokerInner>,
    pool: Option<WorkerPool>,
    mode: DeliveryMode,
    state: Mutex<Lifecycle>,
    shutdown_timeout: Duration,
    instance_id: String,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("mode", &self.mode)
            .field("provider", &self.inner.provider.name())
            .field("state", &self.lifecycle())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Broker {
    /// Start building a broker over a provider.
    pub fn builder(provider: Arc<dyn Provider>) -> BrokerBuilder {
        BrokerBuilder::new(provider)
    }

    /// Validate a configuration, build its provider and the broker.
    pub async fn from_config(config: BrokerConfig) -> BrokerResult<Self> {
        config.validate()?;
        let provider = create_provider(&config).await?;

        Ok(BrokerBuilder::new(provider)
            .mode(config.mode)
            .worker_count(config.worker_count)
            .buffer_size(config.buffer_size)
            .retry_policy(config.retry_policy)
            .shutdown_timeout(config.shutdown_timeout)
            .instance_id(config.instance_id)
            .build())
    }

    /// Start dispatching. A broker starts once; restarting after
    /// [`Broker::stop`] fails with [`BrokerError::Stopped`].
    pub fn start(&self) -> BrokerResult<()> {
        let mut state = self.lock_state();
        match *state {
            Lifecycle::Running => return Err(BrokerError::AlreadyRunning),
            Lifecycle::Stopped => return Err(BrokerError::Stopped),
            Lifecycle::Idle => {}
        }

        if let Some(pool) = &self.pool {
            pool.start();
        }
        *state = Lifecycle::Running;

        tracing::info!(
            mode = %self.mode,
            provider = self.inner.provider.name(),
            "Broker started"
        );
        Ok(())
    }

    /// Stop with the configured shutdown timeout.
    pub async fn stop(&self) -> BrokerResult<()> {
        self.stop_with_timeout(self.shutdown_timeout).await
    }

    /// Stop admission, drain the pool within `deadline`, then close the
    /// provider. Calls after the first return `Ok(())`.
    ///
    /// If the pool does not drain in time, in-flight retries are cancelled
    /// and [`BrokerError::ShutdownTimeout`] is returned after the provider
    /// has been closed.
    pub async fn stop_with_timeout(&self, deadline: Duration) -> BrokerResult<()> {
        {
            let mut state = self.lock_state();
            if *state == Lifecycle::Stopped {
                return Ok(());
            }
            *state = Lifecycle::Stopped;
        }

        tracing::info!(deadline_ms = deadline.as_millis() as u64, "Stopping broker");

        let drained = match &self.pool {
            Some(pool) => pool.stop(deadline).await,
            None => Ok(()),
        };
        self.inner.shutdown.cancel();

        let closed = self.inner.provider.close().await;
        if let Err(e) = &closed {
            tracing::warn!(error = %e, "Provider close failed");
        }

        tracing::info!("Broker stopped");
        drained.and(closed)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Publish using the configured delivery mode.
    pub async fn publish(&self, event: Event) -> BrokerResult<()> {
        match self.mode {
            DeliveryMode::Sync => self.publish_sync(event).await,
            DeliveryMode::Async => self.publish_async(event).await,
        }
    }

    /// Store the event and run its handlers on the caller's task.
    ///
    /// Returns the last handler error after retries are exhausted.
    pub async fn publish_sync(&self, event: Event) -> BrokerResult<()> {
        let cancel = self.inner.shutdown.clone();
        self.publish_sync_with_cancel(event, &cancel).await
    }

    /// Like [`Broker::publish_sync`], aborting retry backoff with
    /// [`BrokerError::Cancelled`] when `cancel` fires.
    pub async fn publish_sync_with_cancel(
        &self,
        event: Event,
        cancel: &CancellationToken,
    ) -> BrokerResult<()> {
        self.accept(&event).await?;
        self.inner.process_event(event, cancel).await
    }

    /// Store the event and hand it to the worker pool.
    ///
    /// Returns once the event is admitted; handler outcomes are visible
    /// only through the event status and [`Broker::stats`]. A full queue
    /// fails with [`BrokerError::QueueFull`] and leaves the stored event
    /// `pending`. Without a pool the handlers run inline and their errors
    /// are logged, not returned.
    pub async fn publish_async(&self, event: Event) -> BrokerResult<()> {
        self.accept(&event).await?;

        match &self.pool {
            Some(pool) => {
                let submitted = pool.submit(event);
                if let Some(metrics) = &self.inner.metrics {
                    metrics.update_queue_size(pool.queue_size());
                }
                submitted
            }
            None => {
                let event_id = event.id.clone();
                let cancel = self.inner.shutdown.clone();
                if let Err(e) = self.inner.process_event(event, &cancel).await {
                    tracing::debug!(event_id = %event_id, error = %e, "Inline dispatch failed");
                }
                Ok(())
            }
        }
    }

    /// Register a handler for events matching `pattern`.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BrokerResult<String> {
        self.inner.subscriptions.subscribe(pattern, handler).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> BrokerResult<()> {
        self.inner.subscriptions.unsubscribe(subscription_id).await
    }

    /// Active subscriptions.
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.list().await
    }

    /// Underlying provider, for status queries and listing.
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner.provider
    }

    /// Build an event stamped with this broker's instance ID.
    pub fn new_event(
        &self,
        event_type: impl Into<String>,
        source: EventSource,
        payload: Vec<u8>,
    ) -> Event {
        Event::new(event_type, source, self.instance_id.clone(), payload)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Snapshot of broker, pool and provider counters.
    pub async fn stats(&self) -> BrokerStats {
        let counters = &self.inner.counters;
        let provider = match self.inner.provider.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "Provider stats unavailable");
                None
            }
        };

        BrokerStats {
            mode: self.mode,
            running: self.is_running(),
            total_published: counters.published.load(Ordering::Relaxed),
            total_processed: counters.processed.load(Ordering::Relaxed),
            total_failed: counters.failed.load(Ordering::Relaxed),
            total_retries: counters.retries.load(Ordering::Relaxed),
            total_unrouted: counters.unrouted.load(Ordering::Relaxed),
            active_subscribers: self.inner.subscriptions.count().await,
            worker_count: self.pool.as_ref().map(|p| p.worker_count()),
            queue_size: self.pool.as_ref().map(|p| p.queue_size()),
            active_workers: self.pool.as_ref().map(|p| p.active_workers()),
            provider,
        }
    }

    /// Check state, validate and store. Shared by both delivery modes.
    async fn accept(&self, event: &Event) -> BrokerResult<()> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        event.validate()?;

        self.inner.provider.publish(event).await?;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_event_published(event.source, &event.event_type);
        }

        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Event published");
        Ok(())
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use crate::subscription::handler_fn;
    use std::sync::atomic::AtomicU32;

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: Event) -> BrokerResult<()> {
            panic!("kaboom")
        }
    }

    fn sync_broker(retry: RetryPolicy) -> Broker {
        Broker::builder(Arc::new(MemoryProvider::with_capacity(100)))
            .mode(DeliveryMode::Sync)
            .retry_policy(retry)
            .instance_id("node-1")
            .build()
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let broker = sync_broker(RetryPolicy::no_retry());
        assert!(!broker.is_running());

        broker.start().unwrap();
        assert!(matches!(broker.start(), Err(BrokerError::AlreadyRunning)));
        assert!(broker.is_running());

        broker.stop().await.unwrap();
        broker.stop().await.unwrap();
        assert!(matches!(broker.start(), Err(BrokerError::Stopped)));
    }

    #[tokio::test]
    async fn test_publish_requires_running() {
        let broker = sync_broker(RetryPolicy::no_retry());
        let event = broker.new_event("a.b.c", EventSource::System, Vec::new());
        assert!(matches!(broker.publish(event).await, Err(BrokerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_invalid_event_rejected_before_storage() {
        let broker = sync_broker(RetryPolicy::no_retry());
        broker.start().unwrap();

        let event = Event::new("a.b.c", EventSource::System, "", Vec::new());
        let id = event.id.clone();
        assert!(matches!(broker.publish(event).await, Err(BrokerError::InvalidEvent(_))));
        assert!(broker.provider().get(&id).await.is_err());
        assert_eq!(broker.stats().await.total_published, 0);
    }

    #[tokio::test]
    async fn test_unrouted_event_keeps_status() {
        let broker = sync_broker(RetryPolicy::no_retry());
        broker.start().unwrap();

        let event = broker.new_event("nobody.listens.here", EventSource::System, Vec::new());
        let id = event.id.clone();
        broker.publish(event).await.unwrap();

        let stored = broker.provider().get(&id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(broker.stats().await.total_unrouted, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let broker = sync_broker(RetryPolicy::no_retry());
        broker.start().unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        broker
            .subscribe("a.b.*", Arc::new(PanickingHandler))
            .await
            .unwrap();
        broker
            .subscribe(
                "a.b.c",
                handler_fn(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let event = broker.new_event("a.b.c", EventSource::System, Vec::new());
        let id = event.id.clone();
        let err = broker.publish(event).await.unwrap_err();

        assert!(err.to_string().contains("kaboom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = broker.provider().get(&id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let broker = sync_broker(RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.0,
        });
        broker.start().unwrap();
        broker
            .subscribe("*", handler_fn(|_| async { Err(BrokerError::handler("down")) }))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let event = broker.new_event("a.b.c", EventSource::System, Vec::new());
        let result = broker.publish_sync_with_cancel(event, &cancel).await;
        assert!(matches!(result, Err(BrokerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_sync_fallback_without_pool() {
        let broker = sync_broker(RetryPolicy::no_retry());
        broker.start().unwrap();
        broker
            .subscribe("*", handler_fn(|_| async { Err(BrokerError::handler("nope")) }))
            .await
            .unwrap();

        // Handler errors are not surfaced on the async path.
        let event = broker.new_event("a.b.c", EventSource::System, Vec::new());
        let id = event.id.clone();
        broker.publish_async(event).await.unwrap();

        let stored = broker.provider().get(&id).await.unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("nope"));
    }
}
