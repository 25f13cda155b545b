//! # Event Broker
//!
//! This crate provides a publish/subscribe event broker that decouples
//! producers of domain events (such as CRUD side effects) from consumers.
//!
//! ## Overview
//!
//! The event-broker crate handles:
//! - **Events**: Typed envelopes with a routing type and a lifecycle status
//! - **Providers**: Pluggable storage/transport backends
//! - **Subscriptions**: Glob-pattern routing to handlers
//! - **Dispatch**: Synchronous or worker-pool delivery with retry/backoff
//!
//! ## Features
//!
//! - `memory` (default): In-memory provider for single-process apps
//! - `redis`: Redis Streams provider with consumer groups
//! - `postgres`: PostgreSQL provider polling an append-only table
//!
//! ## Event Lifecycle
//!
//! ```text
//! pending ──► processing ──► completed
//!                   └──────► failed
//! ```
//!
//! Once an event is `completed` or `failed` it never moves back.
//!
//! ## Usage
//!
//! ### Publishing Events
//!
//! ```rust,no_run
//! use event_broker::{Broker, DeliveryMode, EventSource, MemoryProvider, handler_fn};
//! use std::sync::Arc;
//!
//! async fn publish_example() -> event_broker::BrokerResult<()> {
//!     let broker = Broker::builder(Arc::new(MemoryProvider::default()))
//!         .mode(DeliveryMode::Sync)
//!         .build();
//!     broker.start()?;
//!
//!     broker
//!         .subscribe("public.users.*", handler_fn(|event| async move {
//!             println!("user changed: {}", event.event_type);
//!             Ok(())
//!         }))
//!         .await?;
//!
//!     let event = broker.new_event("public.users.create", EventSource::Database, b"{}".to_vec());
//!     broker.publish(event).await?;
//!
//!     broker.stop().await
//! }
//! ```
//!
//! ### From Configuration
//!
//! ```rust,no_run
//! use event_broker::{Broker, BrokerConfig};
//!
//! async fn from_env() -> event_broker::BrokerResult<Broker> {
//!     let broker = Broker::from_config(BrokerConfig::from_env()?).await?;
//!     broker.start()?;
//!     Ok(broker)
//! }
//! ```
//!
//! ## Subscription Patterns
//!
//! Event types are dot-separated, typically `{schema}.{entity}.{operation}`:
//! - `public.users.create` - Specific event
//! - `public.users.*` - Every operation on users
//! - `*.*.create` - Every create
//! - `*` - All events
//!
//! `*` inside a pattern matches exactly one segment; pattern and type must
//! have the same number of segments unless the pattern is the bare `*`.
//!
//! ## Delivery Guarantees
//!
//! The in-memory provider is best-effort: full stream buffers drop
//! deliveries and old events are evicted. Networked providers are
//! at-least-once and may redeliver, so handlers should be idempotent.

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod subscription;
pub mod types;

// Re-export main types
pub use broker::{Broker, BrokerBuilder, BrokerStats};
pub use config::{BrokerConfig, DeliveryMode, MemoryConfig, PostgresConfig, ProviderKind, RedisConfig};
pub use error::{BrokerError, BrokerResult};
pub use metrics::MetricsSink;
pub use pool::WorkerPool;
pub use provider::{create_provider, EventStream, MemoryProvider, Provider, ProviderStats};
pub use retry::RetryPolicy;
pub use subscription::{handler_fn, pattern_matches, EventHandler, SubscriptionInfo, SubscriptionManager};
pub use types::{Event, EventFilter, EventSource, EventStatus};

#[cfg(feature = "postgres")]
pub use provider::PostgresProvider;
#[cfg(feature = "redis")]
pub use provider::RedisProvider;
