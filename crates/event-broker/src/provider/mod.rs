//! Storage and transport backends.
//!
//! A [`Provider`] persists events and delivers them to stream subscribers.
//! Delivery guarantees depend on the backend:
//!
//! - [`MemoryProvider`]: single process, best-effort; full stream buffers
//!   drop deliveries and old events are evicted.
//! - `RedisProvider` (feature `redis`): append-only Redis Stream with
//!   consumer groups, at-least-once.
//! - `PostgresProvider` (feature `postgres`): append-only table polled
//!   per subscriber watermark, at-least-once.
//!
//! Networked backends may redeliver, so handlers must be idempotent.

pub mod memory;
pub mod record;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use crate::config::{BrokerConfig, ProviderKind};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{Event, EventFilter, EventStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryProvider;
#[cfg(feature = "postgres")]
pub use postgres::PostgresProvider;
#[cfg(feature = "redis")]
pub use redis::RedisProvider;

/// Live, possibly infinite sequence of events.
///
/// Ends when the cancellation token fires or the provider closes.
pub type EventStream = BoxStream<'static, Event>;

/// Storage/transport backend for events.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name for logs and stats.
    fn name(&self) -> &'static str;

    /// Persist an event.
    ///
    /// Fails with [`BrokerError::DuplicateEvent`] if the ID is already
    /// stored and not deleted.
    async fn store(&self, event: &Event) -> BrokerResult<()>;

    /// Fetch an event by ID.
    async fn get(&self, id: &str) -> BrokerResult<Event>;

    /// List events matching a filter.
    async fn list(&self, filter: &EventFilter) -> BrokerResult<Vec<Event>>;

    /// Record a status change.
    ///
    /// The change goes through the event state machine, so terminal
    /// statuses are never reverted.
    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> BrokerResult<()>;

    /// Persist the handler retry counter.
    async fn record_retries(&self, _id: &str, _retry_count: u32) -> BrokerResult<()> {
        Ok(())
    }

    /// Remove an event.
    async fn delete(&self, id: &str) -> BrokerResult<()>;

    /// Subscribe to events whose type matches `pattern`.
    async fn stream(&self, pattern: &str, cancel: CancellationToken) -> BrokerResult<EventStream>;

    /// Store the event and deliver it to stream subscribers.
    async fn publish(&self, event: &Event) -> BrokerResult<()>;

    /// Release resources and end every open stream.
    async fn close(&self) -> BrokerResult<()>;

    /// Snapshot of provider counters.
    async fn stats(&self) -> BrokerResult<ProviderStats>;
}

/// Provider statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Backend name
    pub provider: String,
    /// Events currently retained
    pub total_events: u64,
    pub pending_events: u64,
    pub processing_events: u64,
    pub completed_events: u64,
    pub failed_events: u64,
    /// Open stream subscriptions
    pub active_streams: usize,
    /// Stream deliveries dropped because a buffer was full
    pub dropped_deliveries: u64,
    /// Events removed by capacity eviction or retention cleanup
    pub evicted_events: u64,
    pub oldest_event: Option<DateTime<Utc>>,
    pub newest_event: Option<DateTime<Utc>>,
}

impl ProviderStats {
    /// Create an empty snapshot for a backend.
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    /// Count one event into the per-status and age fields.
    pub fn count(&mut self, event: &Event) {
        self.total_events += 1;
        match event.status {
            EventStatus::Pending => self.pending_events += 1,
            EventStatus::Processing => self.processing_events += 1,
            EventStatus::Completed => self.completed_events += 1,
            EventStatus::Failed => self.failed_events += 1,
        }
        if self.oldest_event.map_or(true, |t| event.created_at < t) {
            self.oldest_event = Some(event.created_at);
        }
        if self.newest_event.map_or(true, |t| event.created_at > t) {
            self.newest_event = Some(event.created_at);
        }
    }
}

/// Build the provider selected by the configuration.
///
/// Selecting a backend whose Cargo feature is disabled is a
/// [`BrokerError::ConfigError`].
pub async fn create_provider(config: &BrokerConfig) -> BrokerResult<Arc<dyn Provider>> {
    match config.provider {
        ProviderKind::Memory => Ok(Arc::new(MemoryProvider::new(config.memory.clone()))),

        #[cfg(feature = "redis")]
        ProviderKind::Redis => Ok(Arc::new(
            RedisProvider::connect(config.redis.clone(), &config.instance_id).await?,
        )),

        #[cfg(feature = "postgres")]
        ProviderKind::Postgres => Ok(Arc::new(
            PostgresProvider::connect(config.postgres.clone()).await?,
        )),

        #[allow(unreachable_patterns)]
        other => Err(BrokerError::ConfigError(format!(
            "provider '{other}' is not compiled in; enable the '{other}' feature"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventSource;

    #[tokio::test]
    async fn test_factory_builds_memory_provider() {
        let provider = create_provider(&BrokerConfig::default()).await.unwrap();
        assert_eq!(provider.name(), "memory");
        provider.close().await.unwrap();
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_factory_rejects_disabled_backend() {
        let config = BrokerConfig {
            provider: ProviderKind::Redis,
            ..Default::default()
        };
        let result = create_provider(&config).await;
        assert!(matches!(result, Err(BrokerError::ConfigError(_))));
    }

    #[test]
    fn test_stats_count() {
        let mut stats = ProviderStats::new("memory");
        let mut done = Event::new("a.b.c", EventSource::System, "node-1", Vec::new());
        done.mark_completed();
        stats.count(&done);
        stats.count(&Event::new("a.b.c", EventSource::System, "node-1", Vec::new()));

        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.completed_events, 1);
        assert_eq!(stats.pending_events, 1);
        assert_eq!(stats.oldest_event, Some(done.created_at));
    }
}
