//! Event types exchanged through the broker
//!
//! This module defines the [`Event`] envelope, its lifecycle state machine,
//! and the [`EventFilter`] query shape shared by every provider.

use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Where an event originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Database change (CRUD side-effect)
    Database,
    /// WebSocket client
    Websocket,
    /// Browser frontend
    Frontend,
    /// System component
    System,
    /// Internal broker traffic
    Internal,
}

impl EventSource {
    /// Stable string form used in transport headers and SQL columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Database => "database",
            EventSource::Websocket => "websocket",
            EventSource::Frontend => "frontend",
            EventSource::System => "system",
            EventSource::Internal => "internal",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(EventSource::Database),
            "websocket" => Ok(EventSource::Websocket),
            "frontend" => Ok(EventSource::Frontend),
            "system" => Ok(EventSource::System),
            "internal" => Ok(EventSource::Internal),
            other => Err(BrokerError::InvalidEvent(format!(
                "unknown event source: {other}"
            ))),
        }
    }
}

/// Processing status of an event.
///
/// Transitions only move forward: `pending → processing → completed | failed`.
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Stored, not yet dispatched
    #[default]
    Pending,
    /// Handlers are running
    Processing,
    /// All handlers succeeded
    Completed,
    /// At least one handler failed after retries
    Failed,
}

impl EventStatus {
    /// Stable string form used in transport headers and SQL columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(BrokerError::InvalidEvent(format!(
                "unknown event status: {other}"
            ))),
        }
    }
}

/// Event envelope.
///
/// The payload is opaque to the broker; handlers decode it themselves
/// (see [`Event::parse_payload`]). `event_type` is the sole routing key and
/// is conventionally `schema.entity.operation`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event ID, assigned at construction
    pub id: String,

    /// Where the event originated
    pub source: EventSource,

    /// Dot-delimited routing key (e.g. `public.users.create`)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Lifecycle status
    #[serde(default)]
    pub status: EventStatus,

    /// Number of handler retry attempts made
    #[serde(default)]
    pub retry_count: u32,

    /// Last handler error, set only when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Opaque payload bytes
    #[serde(default)]
    pub payload: Vec<u8>,

    /// User who triggered the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Session the event belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Identifier of the producing process
    pub instance_id: String,

    /// Database schema for CRUD events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Entity (table) for CRUD events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,

    /// Operation for CRUD events (e.g. `create`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Construction time
    pub created_at: DateTime<Utc>,

    /// When processing began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    /// When processing reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Additional metadata, not interpreted by the broker
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Create a new pending event.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Dot-delimited routing key
    /// * `source` - Where the event originated
    /// * `instance_id` - Identifier of the producing process
    /// * `payload` - Opaque payload bytes
    pub fn new(
        event_type: impl Into<String>,
        source: EventSource,
        instance_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            source,
            event_type: event_type.into(),
            status: EventStatus::Pending,
            retry_count: 0,
            error: None,
            payload: payload.into(),
            user_id: None,
            session_id: None,
            instance_id: instance_id.into(),
            schema: None,
            entity: None,
            operation: None,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a database change event typed `schema.entity.operation`.
    pub fn database(
        schema: impl Into<String>,
        entity: impl Into<String>,
        operation: impl Into<String>,
        instance_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let schema = schema.into();
        let entity = entity.into();
        let operation = operation.into();
        let event_type = format!("{schema}.{entity}.{operation}");

        let mut event = Self::new(event_type, EventSource::Database, instance_id, payload);
        event.schema = Some(schema);
        event.entity = Some(entity);
        event.operation = Some(operation);
        event
    }

    /// Create an event whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(
        event_type: impl Into<String>,
        source: EventSource,
        instance_id: impl Into<String>,
        value: &T,
    ) -> BrokerResult<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(event_type, source, instance_id, payload))
    }

    /// Override the generated ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set user context.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set session context.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check the fields required before publishing.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.id.trim().is_empty() {
            return Err(BrokerError::InvalidEvent("event id is required".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(BrokerError::InvalidEvent("event type is required".into()));
        }
        if self.instance_id.trim().is_empty() {
            return Err(BrokerError::InvalidEvent("instance id is required".into()));
        }
        Ok(())
    }

    /// Decode the payload as JSON.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Move a pending event to processing.
    ///
    /// Returns `false` when the event has already left `pending`.
    pub fn mark_processing(&mut self) -> bool {
        if self.status != EventStatus::Pending {
            return false;
        }
        self.status = EventStatus::Processing;
        self.processed_at = Some(Utc::now());
        true
    }

    /// Move the event to completed.
    ///
    /// Repeating the call re-stamps `completed_at`. Returns `false` if the
    /// event already failed.
    pub fn mark_completed(&mut self) -> bool {
        if self.status == EventStatus::Failed {
            return false;
        }
        self.finish(EventStatus::Completed);
        self.error = None;
        true
    }

    /// Move the event to failed with the given error message.
    ///
    /// Repeating the call re-stamps `completed_at`. Returns `false` if the
    /// event already completed.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.status == EventStatus::Completed {
            return false;
        }
        self.finish(EventStatus::Failed);
        self.error = Some(error.into());
        true
    }

    /// Count one handler retry attempt.
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Apply a status change through the state machine.
    ///
    /// Returns `true` if the transition was accepted.
    pub fn transition_to(&mut self, status: EventStatus, error: Option<&str>) -> bool {
        match status {
            EventStatus::Pending => self.status == EventStatus::Pending,
            EventStatus::Processing => self.mark_processing(),
            EventStatus::Completed => self.mark_completed(),
            EventStatus::Failed => self.mark_failed(error.unwrap_or("unknown error")),
        }
    }

    fn finish(&mut self, status: EventStatus) {
        let now = Utc::now();
        if self.processed_at.is_none() {
            self.processed_at = Some(now);
        }
        self.status = status;
        self.completed_at = Some(now);
    }
}

/// Query shape for [`Provider::list`](crate::provider::Provider::list).
///
/// Every set field must match; unset fields match anything. Results are
/// ordered by creation time, then paginated by `offset` and `limit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub source: Option<EventSource>,
    pub status: Option<EventStatus>,
    pub user_id: Option<String>,
    pub schema: Option<String>,
    pub entity: Option<String>,
    pub operation: Option<String>,
    pub instance_id: Option<String>,
    /// Inclusive lower bound on `created_at`
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl EventFilter {
    /// Create an empty filter matching every event.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Restrict to events created in `[start, end)`.
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Check whether an event satisfies every set field.
    pub fn matches(&self, event: &Event) -> bool {
        fn eq(want: &Option<String>, have: &Option<String>) -> bool {
            want.as_ref().map_or(true, |w| have.as_deref() == Some(w.as_str()))
        }

        self.source.map_or(true, |s| event.source == s)
            && self.status.map_or(true, |s| event.status == s)
            && eq(&self.user_id, &event.user_id)
            && eq(&self.schema, &event.schema)
            && eq(&self.entity, &event.entity)
            && eq(&self.operation, &event.operation)
            && self
                .instance_id
                .as_ref()
                .map_or(true, |i| &event.instance_id == i)
            && self.start_time.map_or(true, |t| event.created_at >= t)
            && self.end_time.map_or(true, |t| event.created_at < t)
    }

    /// Filter, order by creation time and paginate.
    pub fn apply<I>(&self, events: I) -> Vec<Event>
    where
        I: IntoIterator<Item = Event>,
    {
        let mut matched: Vec<Event> = events.into_iter().filter(|e| self.matches(e)).collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let page = matched.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event() -> Event {
        Event::new("public.users.create", EventSource::Database, "node-1", b"{}".to_vec())
    }

    #[test]
    fn test_event_creation() {
        let event = event().with_user("u1").with_session("s1");

        assert!(!event.id.is_empty());
        assert_eq!(event.event_type, "public.users.create");
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.user_id.as_deref(), Some("u1"));
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert!(event.processed_at.is_none());
    }

    #[test]
    fn test_database_event() {
        let event = Event::database("public", "orders", "update", "node-1", Vec::new());
        assert_eq!(event.event_type, "public.orders.update");
        assert_eq!(event.source, EventSource::Database);
        assert_eq!(event.schema.as_deref(), Some("public"));
        assert_eq!(event.entity.as_deref(), Some("orders"));
        assert_eq!(event.operation.as_deref(), Some("update"));
    }

    #[test]
    fn test_validate() {
        assert!(event().validate().is_ok());
        assert!(matches!(
            event().with_id("").validate(),
            Err(BrokerError::InvalidEvent(_))
        ));

        let mut no_type = event();
        no_type.event_type = String::new();
        assert!(no_type.validate().is_err());

        let mut no_instance = event();
        no_instance.instance_id = "  ".into();
        assert!(no_instance.validate().is_err());
    }

    #[test]
    fn test_status_transitions() {
        let mut event = event();
        assert!(event.mark_processing());
        assert!(event.processed_at.is_some());
        assert!(!event.mark_processing());

        assert!(event.mark_completed());
        let first = event.completed_at.unwrap();
        assert!(event.created_at <= event.processed_at.unwrap());
        assert!(event.processed_at.unwrap() <= first);

        // Idempotent re-stamp
        assert!(event.mark_completed());
        assert_eq!(event.status, EventStatus::Completed);
        assert!(event.completed_at.unwrap() >= first);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut event = event();
        event.mark_processing();
        event.mark_failed("boom");

        assert!(!event.mark_processing());
        assert!(!event.mark_completed());
        assert!(!event.transition_to(EventStatus::Pending, None));
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("boom"));

        assert!(event.mark_failed("again"));
        assert_eq!(event.error.as_deref(), Some("again"));
    }

    #[test]
    fn test_increment_retry_keeps_status() {
        let mut event = event();
        event.mark_processing();
        event.increment_retry();
        event.increment_retry();
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.status, EventStatus::Processing);
    }

    #[test]
    fn test_parse_payload() {
        let event = Event::json(
            "public.users.create",
            EventSource::Frontend,
            "node-1",
            &serde_json::json!({"name": "ada"}),
        )
        .unwrap();

        let value: serde_json::Value = event.parse_payload().unwrap();
        assert_eq!(value["name"], "ada");
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Completed,
            EventStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<EventSource>().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let event = event().with_user("u1");

        assert!(EventFilter::new().matches(&event));
        assert!(EventFilter::new()
            .source(EventSource::Database)
            .user_id("u1")
            .instance_id("node-1")
            .matches(&event));
        assert!(!EventFilter::new().user_id("u2").matches(&event));
        assert!(!EventFilter::new().status(EventStatus::Failed).matches(&event));
        assert!(!EventFilter::new().schema("public").matches(&event));
    }

    #[test]
    fn test_filter_time_range_and_pagination() {
        let now = Utc::now();
        let events: Vec<Event> = (0..5)
            .map(|i| {
                let mut e = event().with_id(format!("e{i}"));
                e.created_at = now + Duration::seconds(i);
                e
            })
            .collect();

        let page = EventFilter::new().offset(1).limit(2).apply(events.clone());
        let ids: Vec<_> = page.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);

        let ranged = EventFilter::new()
            .between(now + Duration::seconds(1), now + Duration::seconds(3))
            .apply(events);
        assert_eq!(ranged.len(), 2);
    }
}
