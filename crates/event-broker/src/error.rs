//! Error types for broker operations
//!
//! This module defines all error types that can occur while validating,
//! publishing, storing and dispatching events.

use std::time::Duration;
use thiserror::Error;

/// Broker error types.
///
/// Variants fall into five groups: validation errors (rejected before any
/// I/O), not-found errors, transport errors raised by a provider, handler
/// errors raised by subscribers, and lifecycle errors raised by the broker
/// or worker pool state machine.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Event failed validation
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Subscription request was malformed
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// No event with the given ID
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// An event with the same ID is already stored
    #[error("Duplicate event: {0}")]
    DuplicateEvent(String),

    /// No subscription with the given ID
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Connection to the backend failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Failed to publish event through the provider
    #[error("Failed to publish event: {0}")]
    PublishError(String),

    /// Backend read or write failed
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Provider has been closed
    #[error("Provider is closed")]
    ProviderClosed,

    /// Subscriber handler failed; the message is the handler's own
    #[error("{0}")]
    HandlerError(String),

    /// Broker has not been started
    #[error("Broker is not running")]
    NotRunning,

    /// Broker was started twice
    #[error("Broker is already running")]
    AlreadyRunning,

    /// Broker was stopped and cannot be restarted
    #[error("Broker has been stopped")]
    Stopped,

    /// Worker pool queue is at capacity
    #[error("Worker pool queue is full")]
    QueueFull,

    /// Worker pool is not accepting work
    #[error("Worker pool is stopped")]
    PoolStopped,

    /// Workers were still running when the shutdown deadline elapsed
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Build a handler error from any displayable value.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        BrokerError::HandlerError(message.to_string())
    }

    /// Check if this is a lifecycle error.
    ///
    /// Lifecycle errors are surfaced immediately and never retried.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            BrokerError::NotRunning
                | BrokerError::AlreadyRunning
                | BrokerError::Stopped
                | BrokerError::QueueFull
                | BrokerError::PoolStopped
                | BrokerError::ShutdownTimeout(_)
        )
    }

    /// Check if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::HandlerError(_)
                | BrokerError::ConnectionError(_)
                | BrokerError::PublishError(_)
                | BrokerError::StorageError(_)
        )
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            BrokerError::InvalidEvent(_) => "INVALID_EVENT",
            BrokerError::InvalidSubscription(_) => "INVALID_SUBSCRIPTION",
            BrokerError::EventNotFound(_) => "EVENT_NOT_FOUND",
            BrokerError::DuplicateEvent(_) => "DUPLICATE_EVENT",
            BrokerError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            BrokerError::ConnectionError(_) => "CONNECTION_ERROR",
            BrokerError::PublishError(_) => "PUBLISH_ERROR",
            BrokerError::StorageError(_) => "STORAGE_ERROR",
            BrokerError::SerializationError(_) => "SERIALIZATION_ERROR",
            BrokerError::ProviderClosed => "PROVIDER_CLOSED",
            BrokerError::HandlerError(_) => "HANDLER_ERROR",
            BrokerError::NotRunning => "NOT_RUNNING",
            BrokerError::AlreadyRunning => "ALREADY_RUNNING",
            BrokerError::Stopped => "STOPPED",
            BrokerError::QueueFull => "QUEUE_FULL",
            BrokerError::PoolStopped => "POOL_STOPPED",
            BrokerError::ShutdownTimeout(_) => "SHUTDOWN_TIMEOUT",
            BrokerError::Cancelled => "CANCELLED",
            BrokerError::ConfigError(_) => "CONFIG_ERROR",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::SerializationError(e.to_string())
    }
}
