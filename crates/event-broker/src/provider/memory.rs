//! In-memory provider.
//!
//! Suitable for single-process applications and testing. Events live in a
//! map plus an insertion-order queue; when `max_events` is exceeded the
//! oldest insertion is evicted. A background pass removes terminal events
//! older than `max_age`.
//!
//! Streams get a bounded buffer each. A full buffer drops the delivery for
//! that subscriber only; publishers never wait. Deliveries are copies, so
//! evicting an event never retracts one that is already buffered.

use super::{EventStream, Provider, ProviderStats};
use crate::config::MemoryConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::subscription::pattern_matches;
use crate::types::{Event, EventFilter, EventStatus};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, Event>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

impl MemoryState {
    fn remove(&mut self, id: &str) -> Option<Event> {
        let removed = self.events.remove(id)?;
        self.order.retain(|queued| queued != id);
        Some(removed)
    }
}

struct StreamSlot {
    pattern: String,
    sender: mpsc::Sender<Event>,
}

/// In-memory provider implementation.
pub struct MemoryProvider {
    config: MemoryConfig,
    state: Arc<RwLock<MemoryState>>,
    streams: RwLock<Vec<StreamSlot>>,
    dropped: AtomicU64,
    evicted: Arc<AtomicU64>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryProvider {
    /// Create a provider.
    ///
    /// When called inside a Tokio runtime and `cleanup_interval` is
    /// non-zero, a background retention pass is spawned; it stops on
    /// [`Provider::close`].
    pub fn new(config: MemoryConfig) -> Self {
        let provider = Self {
            config,
            state: Arc::new(RwLock::new(MemoryState::default())),
            streams: RwLock::new(Vec::new()),
            dropped: AtomicU64::new(0),
            evicted: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        };
        provider.spawn_cleanup();
        provider
    }

    /// Create with a capacity and default settings otherwise.
    pub fn with_capacity(max_events: usize) -> Self {
        Self::new(MemoryConfig {
            max_events,
            ..MemoryConfig::default()
        })
    }

    /// Remove terminal events older than `max_age`. Returns the count.
    pub async fn cleanup(&self) -> usize {
        cleanup_pass(&self.state, &self.config, &self.evicted).await
    }

    fn spawn_cleanup(&self) {
        let interval = self.config.cleanup_interval;
        if interval.is_zero() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let state = self.state.clone();
        let config = self.config.clone();
        let evicted = self.evicted.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cleanup_pass(&state, &config, &evicted).await;
                        if removed > 0 {
                            tracing::debug!(removed = removed, "Memory provider cleanup removed expired events");
                        }
                    }
                }
            }
        });
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ProviderClosed)
        } else {
            Ok(())
        }
    }

    async fn fan_out(&self, event: &Event) {
        let mut saw_closed = false;
        {
            let streams = self.streams.read().await;
            for slot in streams.iter() {
                if !pattern_matches(&slot.pattern, &event.event_type) {
                    continue;
                }
                match slot.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            event_id = %event.id,
                            pattern = %slot.pattern,
                            "Stream buffer full, dropping delivery"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            self.streams
                .write()
                .await
                .retain(|slot| !slot.sender.is_closed());
        }
    }
}

async fn cleanup_pass(
    state: &RwLock<MemoryState>,
    config: &MemoryConfig,
    evicted: &AtomicU64,
) -> usize {
    let Ok(max_age) = chrono::Duration::from_std(config.max_age) else {
        return 0;
    };
    let cutoff = Utc::now() - max_age;

    let mut state = state.write().await;
    let expired: Vec<String> = state
        .events
        .values()
        .filter(|e| e.status.is_terminal() && e.completed_at.unwrap_or(e.created_at) < cutoff)
        .map(|e| e.id.clone())
        .collect();

    for id in &expired {
        state.remove(id);
    }
    evicted.fetch_add(expired.len() as u64, Ordering::Relaxed);
    expired.len()
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, event: &Event) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut state = self.state.write().await;
        if state.events.contains_key(&event.id) {
            return Err(BrokerError::DuplicateEvent(event.id.clone()));
        }
        state.events.insert(event.id.clone(), event.clone());
        state.order.push_back(event.id.clone());

        while state.events.len() > self.config.max_events {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if state.events.remove(&oldest).is_some() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(event_id = %oldest, "Evicted oldest event");
            }
        }

        Ok(())
    }

    async fn get(&self, id: &str) -> BrokerResult<Event> {
        self.state
            .read()
            .await
            .events
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::EventNotFound(id.to_string()))
    }

    async fn list(&self, filter: &EventFilter) -> BrokerResult<Vec<Event>> {
        let state = self.state.read().await;
        Ok(filter.apply(state.events.values().cloned()))
    }

    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(id)
            .ok_or_else(|| BrokerError::EventNotFound(id.to_string()))?;

        if !event.transition_to(status, error) {
            tracing::debug!(
                event_id = %id,
                from = %event.status,
                to = %status,
                "Ignored status transition"
            );
        }
        Ok(())
    }

    async fn record_retries(&self, id: &str, retry_count: u32) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(id)
            .ok_or_else(|| BrokerError::EventNotFound(id.to_string()))?;
        event.retry_count = retry_count;
        Ok(())
    }

    async fn delete(&self, id: &str) -> BrokerResult<()> {
        self.state
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BrokerError::EventNotFound(id.to_string()))
    }

    async fn stream(&self, pattern: &str, cancel: CancellationToken) -> BrokerResult<EventStream> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        self.streams.write().await.push(StreamSlot {
            pattern: pattern.to_string(),
            sender: tx,
        });

        tracing::debug!(pattern = %pattern, "Memory stream opened");

        let stream = futures::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                event = rx.recv() => event.map(|e| (e, (rx, cancel))),
            }
        });

        Ok(stream.boxed())
    }

    async fn publish(&self, event: &Event) -> BrokerResult<()> {
        self.store(event).await?;
        self.fan_out(event).await;
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        // Dropping the senders ends every open stream.
        self.streams.write().await.clear();
        tracing::debug!("Memory provider closed");
        Ok(())
    }

    async fn stats(&self) -> BrokerResult<ProviderStats> {
        let mut stats = ProviderStats::new(self.name());
        {
            let state = self.state.read().await;
            for event in state.events.values() {
                stats.count(event);
            }
        }
        stats.active_streams = self
            .streams
            .read()
            .await
            .iter()
            .filter(|slot| !slot.sender.is_closed())
            .count();
        stats.dropped_deliveries = self.dropped.load(Ordering::Relaxed);
        stats.evicted_events = self.evicted.load(Ordering::Relaxed);
        Ok(stats)
    }
}

impl Drop for MemoryProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
