//! Subscription routing table
//!
//! Maps glob patterns to handlers and answers "which handlers match this
//! event type". No I/O happens here.

use crate::error::{BrokerError, BrokerResult};
use crate::types::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Event handler trait for processing events.
///
/// Handlers receive their own copy of the event and may be invoked more
/// than once for the same event (retries, at-least-once providers), so
/// they should be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: Event) -> BrokerResult<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = BrokerResult<()>> + Send,
{
    async fn handle(&self, event: Event) -> BrokerResult<()> {
        (self.f)(event).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust
/// use event_broker::handler_fn;
///
/// let handler = handler_fn(|event| async move {
///     println!("got {}", event.event_type);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BrokerResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Check if an event type matches a subscription pattern.
///
/// The bare pattern `*` matches everything. Otherwise pattern and type
/// must have the same number of `.`-separated segments, and each pattern
/// segment is either `*` (any single segment) or an exact, case-sensitive
/// match.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let type_parts: Vec<&str> = event_type.split('.').collect();

    if pattern_parts.len() != type_parts.len() {
        return false;
    }

    pattern_parts
        .iter()
        .zip(type_parts.iter())
        .all(|(p, t)| *p == "*" || p == t)
}

/// A registered (pattern, handler) pair.
#[derive(Clone)]
pub struct Subscription {
    /// Subscription ID
    pub id: String,
    /// Glob pattern
    pub pattern: String,
    /// Handler invoked for matching events
    pub handler: Arc<dyn EventHandler>,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Read-only view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub pattern: String,
}

/// In-process routing table.
#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager").finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a pattern and return the new subscription ID.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BrokerResult<String> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(BrokerError::InvalidSubscription(
                "pattern must not be empty".into(),
            ));
        }

        let id = uuid::Uuid::now_v7().to_string();
        let subscription = Subscription {
            id: id.clone(),
            pattern: pattern.to_string(),
            handler,
            created_at: Utc::now(),
        };

        self.subscriptions
            .write()
            .await
            .insert(id.clone(), subscription);

        tracing::debug!(subscription_id = %id, pattern = %pattern, "Subscription added");
        Ok(id)
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, subscription_id: &str) -> BrokerResult<()> {
        match self.subscriptions.write().await.remove(subscription_id) {
            Some(sub) => {
                tracing::debug!(subscription_id = %sub.id, pattern = %sub.pattern, "Subscription removed");
                Ok(())
            }
            None => Err(BrokerError::SubscriptionNotFound(
                subscription_id.to_string(),
            )),
        }
    }

    /// Collect every subscription whose pattern matches `event_type`.
    pub async fn get_matching(&self, event_type: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|sub| pattern_matches(&sub.pattern, event_type))
            .cloned()
            .collect()
    }

    /// List active subscriptions.
    pub async fn list(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .read()
            .await
            .values()
            .map(|sub| SubscriptionInfo {
                id: sub.id.clone(),
                pattern: sub.pattern.clone(),
            })
            .collect()
    }

    /// Number of active subscriptions.
    pub async fn count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Drop every subscription.
    pub async fn clear(&self) {
        self.subscriptions.write().await.clear();
    }
}
