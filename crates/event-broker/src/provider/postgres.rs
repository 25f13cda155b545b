//! PostgreSQL polling provider.
//!
//! Events are inserted once into an append-only table keyed by a
//! `BIGSERIAL` sequence. Status changes go to a keyed side table and
//! deletions to a tombstone table; both are joined back on read.
//!
//! `stream` polls for rows above a per-subscriber sequence watermark.
//! The watermark starts at the current maximum, so a new stream only sees
//! events stored after it opened. Rows are handed off before the watermark
//! advances past them, so a reader may see an event again after a restart.
//!
//! A sequence value is taken when a row is inserted, not when it commits, so
//! concurrent inserts could become visible out of order and a poller would
//! step over the late one. `store` therefore inserts under a transaction
//! scoped advisory lock on the events table: sequence order equals commit
//! order for every row written through this provider. Rows inserted by other
//! writers bypass the lock and get no such guarantee.
//!
//! Event IDs are unique. Storing a live ID fails with
//! [`BrokerError::DuplicateEvent`]; a tombstoned ID is reclaimed.

use super::{EventStream, Provider, ProviderStats};
use crate::config::PostgresConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::provider::record::{decode_event, next_status, StatusRecord};
use crate::subscription::pattern_matches;
use crate::types::{Event, EventFilter, EventStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Table names for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTables {
    pub events: String,
    pub status: String,
    pub tombstones: String,
}

impl PgTables {
    /// Derive table names, rejecting prefixes that are not plain identifiers.
    pub fn new(prefix: &str) -> BrokerResult<Self> {
        let valid = !prefix.is_empty()
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !prefix.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(BrokerError::ConfigError(format!(
                "invalid table prefix '{prefix}'"
            )));
        }

        Ok(Self {
            events: format!("{prefix}_events"),
            status: format!("{prefix}_event_status"),
            tombstones: format!("{prefix}_event_tombstones"),
        })
    }

    /// DDL statements, one per round trip.
    pub fn migrations(&self) -> Vec<String> {
        let Self {
            events,
            status,
            tombstones,
        } = self;
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {events} (\
                 seq BIGSERIAL PRIMARY KEY, \
                 id TEXT NOT NULL UNIQUE, \
                 event_type TEXT NOT NULL, \
                 source TEXT NOT NULL, \
                 instance_id TEXT NOT NULL, \
                 user_id TEXT, \
                 schema_name TEXT, \
                 entity TEXT, \
                 operation TEXT, \
                 data TEXT NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {events}_created_at_idx ON {events} (created_at)"),
            format!(
                "CREATE TABLE IF NOT EXISTS {status} (\
                 id TEXT PRIMARY KEY, \
                 status TEXT NOT NULL, \
                 error TEXT, \
                 retry_count INTEGER NOT NULL DEFAULT 0, \
                 processed_at TIMESTAMPTZ, \
                 completed_at TIMESTAMPTZ, \
                 updated_at TIMESTAMPTZ NOT NULL)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {tombstones} (\
                 id TEXT PRIMARY KEY, \
                 deleted_at TIMESTAMPTZ NOT NULL)"
            ),
        ]
    }

    /// Drop a tombstoned row (and its side records) so its ID can be stored
    /// again; bind the event ID as `$1`.
    fn reclaim_statements(&self) -> Vec<String> {
        let Self {
            events,
            status,
            tombstones,
        } = self;
        let deleted = format!("EXISTS (SELECT 1 FROM {tombstones} t WHERE t.id = $1)");
        vec![
            format!("DELETE FROM {status} WHERE id = $1 AND {deleted}"),
            format!("DELETE FROM {events} WHERE id = $1 AND {deleted}"),
            format!("DELETE FROM {tombstones} WHERE id = $1"),
        ]
    }

    fn insert_statement(&self) -> String {
        format!(
            "INSERT INTO {} (id, event_type, source, instance_id, user_id, schema_name, \
             entity, operation, data, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            self.events
        )
    }

    /// Live events joined with their status; tombstoned rows excluded.
    fn select(&self) -> String {
        let Self {
            events,
            status,
            tombstones,
        } = self;
        format!(
            "SELECT e.seq, e.event_type, e.data, s.status, s.error, s.retry_count, \
             s.processed_at, s.completed_at \
             FROM {events} e LEFT JOIN {status} s ON s.id = e.id \
             WHERE NOT EXISTS (SELECT 1 FROM {tombstones} t WHERE t.id = e.id)"
        )
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    seq: i64,
    event_type: String,
    data: String,
    status: Option<String>,
    error: Option<String>,
    retry_count: Option<i32>,
    processed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl EventRow {
    fn into_event(self) -> BrokerResult<Event> {
        let mut event = decode_event(&self.data)?;
        if let Some(status) = self.status {
            event.status = status.parse()?;
            event.error = self.error;
            event.retry_count = self.retry_count.unwrap_or(0).max(0) as u32;
            event.processed_at = self.processed_at;
            event.completed_at = self.completed_at;
        }
        Ok(event)
    }
}

/// Serialises inserts until commit; bind the events table name as `$1`.
const INSERT_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

fn storage(e: sqlx::Error) -> BrokerError {
    BrokerError::StorageError(e.to_string())
}

fn publish(e: sqlx::Error) -> BrokerError {
    BrokerError::PublishError(e.to_string())
}

/// SQLSTATE `unique_violation`.
fn is_unique_violation(code: Option<&str>) -> bool {
    code == Some("23505")
}

fn insert_error(id: &str, e: sqlx::Error) -> BrokerError {
    let code = e.as_database_error().and_then(|db| db.code());
    if is_unique_violation(code.as_deref()) {
        BrokerError::DuplicateEvent(id.to_string())
    } else {
        publish(e)
    }
}

/// PostgreSQL provider implementation.
pub struct PostgresProvider {
    pool: PgPool,
    config: PostgresConfig,
    tables: PgTables,
    active_streams: Arc<AtomicUsize>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PostgresProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresProvider")
            .field("tables", &self.tables)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl PostgresProvider {
    /// Connect, migrate when `auto_migrate` is set, and start the
    /// retention task when `cleanup_interval` is non-zero.
    pub async fn connect(config: PostgresConfig) -> BrokerResult<Self> {
        let tables = PgTables::new(&config.table_prefix)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        let provider = Self {
            pool,
            config,
            tables,
            active_streams: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        };

        if provider.config.auto_migrate {
            provider.migrate().await?;
        }
        provider.spawn_cleanup();

        tracing::info!(prefix = %provider.config.table_prefix, "Connected PostgreSQL provider");
        Ok(provider)
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> BrokerResult<()> {
        for statement in self.tables.migrations() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }

    /// Delete terminal events older than `max_age`. Returns the count.
    pub async fn cleanup(&self) -> BrokerResult<u64> {
        cleanup_pass(&self.pool, &self.tables, &self.config).await
    }

    fn spawn_cleanup(&self) {
        let interval = self.config.cleanup_interval;
        if interval.is_zero() {
            return;
        }

        let pool = self.pool.clone();
        let tables = self.tables.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match cleanup_pass(&pool, &tables, &config).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed = removed, "PostgreSQL cleanup removed expired events"),
                        Err(e) => tracing::warn!(error = %e, "PostgreSQL cleanup failed"),
                    },
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

    async fn save_status(&self, id: &str, record: &StatusRecord) -> BrokerResult<()> {
        let query = format!(
            "INSERT INTO {} (id, status, error, retry_count, processed_at, completed_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET \
             status = EXCLUDED.status, error = EXCLUDED.error, \
             retry_count = EXCLUDED.retry_count, processed_at = EXCLUDED.processed_at, \
             completed_at = EXCLUDED.completed_at, updated_at = EXCLUDED.updated_at",
            self.tables.status
        );
        sqlx::query(&query)
            .bind(id)
            .bind(record.status.as_str())
            .bind(&record.error)
            .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
            .bind(record.processed_at)
            .bind(record.completed_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

async fn cleanup_pass(pool: &PgPool, tables: &PgTables, config: &PostgresConfig) -> BrokerResult<u64> {
    let max_age = chrono::Duration::from_std(config.max_age)
        .map_err(|e| BrokerError::ConfigError(e.to_string()))?;
    let cutoff = Utc::now() - max_age;

    let query = format!(
        "DELETE FROM {events} e USING {status} s \
         WHERE s.id = e.id AND s.status IN ('completed', 'failed') \
         AND COALESCE(s.completed_at, e.created_at) < $1",
        events = tables.events,
        status = tables.status,
    );
    let removed = sqlx::query(&query)
        .bind(cutoff)
        .execute(pool)
        .await
        .map_err(storage)?
        .rows_affected();

    // Side records whose event is gone.
    for table in [&tables.status, &tables.tombstones] {
        let query = format!(
            "DELETE FROM {table} x WHERE NOT EXISTS (SELECT 1 FROM {events} e WHERE e.id = x.id)",
            events = tables.events,
        );
        sqlx::query(&query).execute(pool).await.map_err(storage)?;
    }

    Ok(removed)
}

#[async_trait]
impl Provider for PostgresProvider {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn store(&self, event: &Event) -> BrokerResult<()> {
        self.ensure_open()?;

        let data = serde_json::to_string(event)?;
        let mut tx = self.pool.begin().await.map_err(publish)?;

        sqlx::query(INSERT_LOCK)
            .bind(&self.tables.events)
            .execute(&mut *tx)
            .await
            .map_err(publish)?;
        for statement in self.tables.reclaim_statements() {
            sqlx::query(&statement)
                .bind(&event.id)
                .execute(&mut *tx)
                .await
                .map_err(publish)?;
        }

        sqlx::query(&self.tables.insert_statement())
            .bind(&event.id)
            .bind(&event.event_type)
            .bind(event.source.as_str())
            .bind(&event.instance_id)
            .bind(&event.user_id)
            .bind(&event.schema)
            .bind(&event.entity)
            .bind(&event.operation)
            .bind(data)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| insert_error(&event.id, e))?;
        tx.commit().await.map_err(publish)?;

        tracing::debug!(event_id = %event.id, "Inserted event row");
        Ok(())
    }

    async fn get(&self, id: &str) -> BrokerResult<Event> {
        let query = format!("{} AND e.id = $1", self.tables.select());
        let row = sqlx::query_as::<_, EventRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => row.into_event(),
            None => Err(BrokerError::EventNotFound(id.to_string())),
        }
    }

    async fn list(&self, filter: &EventFilter) -> BrokerResult<Vec<Event>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(self.tables.select());

        if let Some(source) = filter.source {
            query.push(" AND e.source = ").push_bind(source.as_str());
        }
        if let Some(status) = filter.status {
            query
                .push(" AND COALESCE(s.status, 'pending') = ")
                .push_bind(status.as_str());
        }
        let columns = [
            ("e.user_id", &filter.user_id),
            ("e.schema_name", &filter.schema),
            ("e.entity", &filter.entity),
            ("e.operation", &filter.operation),
            ("e.instance_id", &filter.instance_id),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                query.push(format!(" AND {column} = ")).push_bind(value.clone());
            }
        }
        if let Some(start) = filter.start_time {
            query.push(" AND e.created_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end_time {
            query.push(" AND e.created_at < ").push_bind(end);
        }

        query.push(" ORDER BY e.created_at, e.seq");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }
        if filter.offset > 0 {
            query.push(" OFFSET ").push_bind(filter.offset as i64);
        }

        let rows = query
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn update_status(
        &self,
        id: &str,
        status: EventStatus,
        error: Option<&str>,
    ) -> BrokerResult<()> {
        let mut event = self.get(id).await?;
        match next_status(&mut event, status, error) {
            Some(record) => self.save_status(id, &record).await,
            None => Ok(()),
        }
    }

    async fn record_retries(&self, id: &str, retry_count: u32) -> BrokerResult<()> {
        let mut event = self.get(id).await?;
        event.retry_count = retry_count;
        self.save_status(id, &StatusRecord::from_event(&event)).await
    }

    async fn delete(&self, id: &str) -> BrokerResult<()> {
        self.get(id).await?;

        let query = format!(
            "INSERT INTO {} (id, deleted_at) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
            self.tables.tombstones
        );
        sqlx::query(&query)
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        tracing::debug!(event_id = %id, "Tombstoned event");
        Ok(())
    }

    async fn stream(&self, pattern: &str, cancel: CancellationToken) -> BrokerResult<EventStream> {
        self.ensure_open()?;

        let query = format!("SELECT COALESCE(MAX(seq), 0) FROM {}", self.tables.events);
        let watermark: i64 = sqlx::query_scalar(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let poller = Poller {
            pool: self.pool.clone(),
            query: format!("{} AND e.seq > $1 ORDER BY e.seq LIMIT $2", self.tables.select()),
            pattern: pattern.to_string(),
            watermark,
            config: self.config.clone(),
            tx,
        };

        let active = self.active_streams.clone();
        let stop = cancel.clone();
        let shutdown = self.shutdown.clone();
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            poller.run(stop, shutdown).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });

        tracing::info!(pattern = %pattern, watermark = watermark, "PostgreSQL poller started");

        let stream = futures::stream::unfold((rx, cancel), |(mut rx, cancel)| async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                event = rx.recv() => event.map(|e| (e, (rx, cancel))),
            }
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, event: &Event) -> BrokerResult<()> {
        // Pollers pick the row up on their next tick.
        self.store(event).await
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
            self.pool.close().await;
            tracing::debug!("PostgreSQL provider closed");
        }
        Ok(())
    }

    async fn stats(&self) -> BrokerResult<ProviderStats> {
        let query = format!(
            "SELECT COALESCE(s.status, 'pending') AS status, COUNT(*) \
             FROM {events} e LEFT JOIN {status} s ON s.id = e.id \
             WHERE NOT EXISTS (SELECT 1 FROM {tombstones} t WHERE t.id = e.id) \
             GROUP BY 1",
            events = self.tables.events,
            status = self.tables.status,
            tombstones = self.tables.tombstones,
        );
        let counts = sqlx::query_as::<_, (String, i64)>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        let query = format!(
            "SELECT MIN(created_at), MAX(created_at) FROM {}",
            self.tables.events
        );
        let (oldest, newest) = sqlx::query_as::<_, (Option<DateTime<Utc>>, Option<DateTime<Utc>>)>(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        let mut stats = ProviderStats::new(self.name());
        for (status, count) in counts {
            let count = count.max(0) as u64;
            stats.total_events += count;
            match status.parse::<EventStatus>()? {
                EventStatus::Pending => stats.pending_events += count,
                EventStatus::Processing => stats.processing_events += count,
                EventStatus::Completed => stats.completed_events += count,
                EventStatus::Failed => stats.failed_events += count,
            }
        }
        stats.active_streams = self.active_streams.load(Ordering::SeqCst);
        stats.oldest_event = oldest;
        stats.newest_event = newest;
        Ok(stats)
    }
}

impl Drop for PostgresProvider {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Background poll loop feeding one [`EventStream`].
struct Poller {
    pool: PgPool,
    query: String,
    pattern: String,
    watermark: i64,
    config: PostgresConfig,
    tx: mpsc::Sender<Event>,
}

impl Poller {
    async fn run(mut self, cancel: CancellationToken, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let rows = match sqlx::query_as::<_, EventRow>(&self.query)
                .bind(self.watermark)
                .bind(self.config.batch_size.max(1))
                .fetch_all(&self.pool)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(pattern = %self.pattern, error = %e, "Poll failed");
                    continue;
                }
            };

            for row in rows {
                let seq = row.seq;
                if pattern_matches(&self.pattern, &row.event_type) {
                    let event = match row.into_event() {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(seq = seq, error = %e, "Skipping undecodable event row");
                            self.watermark = seq;
                            continue;
                        }
                    };
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => false,
                        sent = self.tx.send(event) => sent.is_ok(),
                    };
                    if !sent {
                        tracing::debug!(pattern = %self.pattern, "PostgreSQL poller stopped");
                        return;
                    }
                }
                self.watermark = seq;
            }
        }

        tracing::debug!(pattern = %self.pattern, "PostgreSQL poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventSource;

    #[test]
    fn test_table_names() {
        let tables = PgTables::new("broker").unwrap();
        assert_eq!(tables.events, "broker_events");
        assert_eq!(tables.status, "broker_event_status");
        assert_eq!(tables.tombstones, "broker_event_tombstones");
        assert_eq!(tables.migrations().len(), 4);
    }

    #[test]
    fn test_rejects_unsafe_prefix() {
        for prefix in ["", "1abc", "drop table;", "a-b"] {
            assert!(
                matches!(PgTables::new(prefix), Err(BrokerError::ConfigError(_))),
                "prefix {prefix:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_store_statements() {
        let tables = PgTables::new("broker").unwrap();
        assert!(INSERT_LOCK.contains("pg_advisory_xact_lock"));

        let reclaim = tables.reclaim_statements();
        assert_eq!(reclaim.len(), 3);
        assert!(reclaim[0].starts_with("DELETE FROM broker_event_status"));
        assert!(reclaim[1].starts_with("DELETE FROM broker_events"));
        assert!(reclaim[2].starts_with("DELETE FROM broker_event_tombstones"));
        // Live rows are only removed when tombstoned.
        assert!(reclaim[..2]
            .iter()
            .all(|q| q.contains("EXISTS (SELECT 1 FROM broker_event_tombstones")));

        assert!(tables.insert_statement().starts_with("INSERT INTO broker_events "));
    }

    #[test]
    fn test_unique_violation_maps_to_duplicate() {
        assert!(is_unique_violation(Some("23505")));
        assert!(!is_unique_violation(Some("23503")));
        assert!(!is_unique_violation(None));

        assert!(matches!(
            insert_error("e1", sqlx::Error::PoolClosed),
            BrokerError::PublishError(_)
        ));
    }

    #[test]
    fn test_row_layers_status() {
        let event = Event::new("public.users.create", EventSource::Database, "node-1", Vec::new());
        let now = Utc::now();
        let row = EventRow {
            seq: 7,
            event_type: event.event_type.clone(),
            data: serde_json::to_string(&event).unwrap(),
            status: Some("failed".to_string()),
            error: Some("boom".to_string()),
            retry_count: Some(2),
            processed_at: Some(now),
            completed_at: Some(now),
        };

        let decoded = row.into_event().unwrap();
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.status, EventStatus::Failed);
        assert_eq!(decoded.error.as_deref(), Some("boom"));
        assert_eq!(decoded.retry_count, 2);
    }

    #[test]
    fn test_row_without_status_is_pending() {
        let event = Event::new("a.b.c", EventSource::System, "node-1", Vec::new());
        let row = EventRow {
            seq: 1,
            event_type: event.event_type.clone(),
            data: serde_json::to_string(&event).unwrap(),
            status: None,
            error: None,
            retry_count: None,
            processed_at: None,
            completed_at: None,
        };
        assert_eq!(row.into_event().unwrap(), event);
    }
}
