//! Metrics sink consumed by the broker.
//!
//! Calls are fire-and-forget: a sink must not block and cannot fail. The
//! broker works identically when no sink is installed.

use crate::types::{EventSource, EventStatus};
use std::time::Duration;

/// Receiver for broker metrics.
pub trait MetricsSink: Send + Sync {
    /// An event was accepted by the provider.
    fn record_event_published(&self, source: EventSource, event_type: &str);

    /// An event reached a terminal status.
    fn record_event_processed(
        &self,
        source: EventSource,
        event_type: &str,
        status: EventStatus,
        duration: Duration,
    );

    /// Worker pool queue depth changed.
    fn update_queue_size(&self, size: usize);
}
