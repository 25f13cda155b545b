//! Transport record shape for durable providers.
//!
//! Append-only backends store each event once as an [`EventRecord`]: the
//! JSON-serialized event plus routing headers that can be filtered on
//! without deserializing the body. Later status changes and deletions are
//! written as side-channel records ([`StatusRecord`], tombstones) instead
//! of rewriting history, and are layered back over the event on read.

use crate::error::BrokerResult;
use crate::types::{Event, EventStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FIELD_ID: &str = "id";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_INSTANCE_ID: &str = "instance_id";
pub const FIELD_DATA: &str = "data";

/// Event as written to an append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub status: String,
    pub instance_id: String,
    /// JSON-serialized [`Event`]
    pub data: String,
}

impl EventRecord {
    /// Encode an event.
    pub fn from_event(event: &Event) -> BrokerResult<Self> {
        Ok(Self {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            source: event.source.as_str().to_string(),
            status: event.status.as_str().to_string(),
            instance_id: event.instance_id.clone(),
            data: serde_json::to_string(event)?,
        })
    }

    /// Header/value pairs in write order, body last.
    pub fn fields(&self) -> [(&'static str, &str); 6] {
        [
            (FIELD_ID, self.id.as_str()),
            (FIELD_TYPE, self.event_type.as_str()),
            (FIELD_SOURCE, self.source.as_str()),
            (FIELD_STATUS, self.status.as_str()),
            (FIELD_INSTANCE_ID, self.instance_id.as_str()),
            (FIELD_DATA, self.data.as_str()),
        ]
    }

    /// Decode the body.
    pub fn to_event(&self) -> BrokerResult<Event> {
        decode_event(&self.data)
    }
}

/// Decode a JSON event body.
pub fn decode_event(data: &str) -> BrokerResult<Event> {
    Ok(serde_json::from_str(data)?)
}

/// Latest status of an event, stored beside the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    /// Snapshot the mutable lifecycle fields of an event.
    pub fn from_event(event: &Event) -> Self {
        Self {
            status: event.status,
            error: event.error.clone(),
            processed_at: event.processed_at,
            completed_at: event.completed_at,
            retry_count: event.retry_count,
            updated_at: Utc::now(),
        }
    }

    /// Overwrite the lifecycle fields of an event read from the log.
    pub fn apply_to(&self, event: &mut Event) {
        event.status = self.status;
        event.error = self.error.clone();
        event.processed_at = self.processed_at;
        event.completed_at = self.completed_at;
        event.retry_count = self.retry_count;
    }

    pub fn to_json(&self) -> BrokerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> BrokerResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Apply a status change to an event and return the side record to write.
///
/// Returns `None` when the state machine rejected the transition.
pub fn next_status(
    event: &mut Event,
    status: EventStatus,
    error: Option<&str>,
) -> Option<StatusRecord> {
    if event.transition_to(status, error) {
        Some(StatusRecord::from_event(event))
    } else {
        tracing::debug!(
            event_id = %event.id,
            from = %event.status,
            to = %status,
            "Ignored status transition"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventSource;

    #[test]
    fn test_record_headers() {
        let event = Event::new("public.users.create", EventSource::Websocket, "node-1", b"x".to_vec())
            .with_id("e1");
        let record = EventRecord::from_event(&event).unwrap();

        let fields = record.fields();
        assert_eq!(fields[0], ("id", "e1"));
        assert_eq!(fields[1], ("type", "public.users.create"));
        assert_eq!(fields[2], ("source", "websocket"));
        assert_eq!(fields[3], ("status", "pending"));
        assert_eq!(fields[4], ("instance_id", "node-1"));
        assert_eq!(fields[5].0, "data");

        assert_eq!(record.to_event().unwrap(), event);
    }

    #[test]
    fn test_status_record_layering() {
        let mut logged = Event::new("a.b.c", EventSource::System, "node-1", Vec::new());
        let mut live = logged.clone();

        let record = next_status(&mut live, EventStatus::Processing, None).unwrap();
        let record = StatusRecord::from_json(&record.to_json().unwrap()).unwrap();
        record.apply_to(&mut logged);

        assert_eq!(logged.status, EventStatus::Processing);
        assert!(logged.processed_at.is_some());
    }

    #[test]
    fn test_rejected_transition_yields_no_record() {
        let mut event = Event::new("a.b.c", EventSource::System, "node-1", Vec::new());
        event.mark_completed();
        assert!(next_status(&mut event, EventStatus::Processing, None).is_none());
        assert!(next_status(&mut event, EventStatus::Completed, None).is_some());
    }
}
