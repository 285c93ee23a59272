//! Postgres-backed event store implementation.
//!
//! Events live in one append-only `events` table. The unique constraint on
//! `(aggregate_id, sequence_number)` is the final guard against concurrent appends:
//! two writers that both read version N race on inserting N + 1, and the loser
//! gets a unique violation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (check / other) | any other | `InvalidAppend` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Serialization` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, info, instrument};

use atelier_core::{AggregateId, CorrelationId, ExpectedVersion, UserId};
use atelier_events::{StoredEvent, UncommittedEvent};

use super::r#trait::{EventStore, EventStoreError, validate_batch};

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    aggregate_id    UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    event_version   INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    payload         JSONB NOT NULL,
    user_id         UUID NULL,
    correlation_id  UUID NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (aggregate_id, sequence_number)
)
"#;

const CREATE_EVENT_TYPE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS events_aggregate_type_idx ON events (aggregate_id, event_type)";

/// Postgres-backed append-only event store.
///
/// Cloning is cheap (the pool is reference counted).
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool; `acquire_timeout` bounds how long an operation waits for a
    /// connection before failing with `Unavailable`.
    #[instrument(skip(database_url), err)]
    pub async fn connect(
        database_url: &str,
        acquire_timeout: Duration,
    ) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        info!("connected to postgres event store");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `events` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        for statement in [CREATE_EVENTS_TABLE, CREATE_EVENT_TYPE_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, events),
        fields(
            aggregate_id = tracing::field::Empty,
            event_count = events.len(),
            expected_version = ?expected_version,
            committed_events = tracing::field::Empty
        ),
        err
    )]
    async fn append_events(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.as_str();
        let span = Span::current();
        span.record("aggregate_id", tracing::field::display(aggregate_id));

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = check_stream_version(&mut tx, aggregate_id).await?;

        if let Some(existing_type) = existing_type.filter(|t| t != aggregate_type) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
            )));
        }

        if !expected_version.matches(current_version) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current_version}"
            )));
        }

        let mut stored_events = Vec::with_capacity(events.len());
        for (event, sequence) in events.into_iter().zip(current_version + 1..) {
            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    aggregate_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    event_version,
                    occurred_at,
                    payload,
                    user_id,
                    correlation_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event.event_id)
            .bind(event.aggregate_id.as_uuid())
            .bind(event.aggregate_type.as_str())
            .bind(sequence as i64)
            .bind(event.event_type.as_str())
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .bind(event.user_id.map(uuid::Uuid::from))
            .bind(event.correlation_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            stored_events.push(event.into_stored(sequence));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        span.record("committed_events", stored_events.len());
        Ok(stored_events)
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id, event_count = tracing::field::Empty), err)]
    async fn load_events(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload,
                user_id,
                correlation_id
            FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let events = rows
            .iter()
            .map(|row| StoredEventRow::from_row(row).map(StoredEvent::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EventStoreError::Serialization(format!("failed to decode event row: {e}")))?;

        Span::current().record("event_count", events.len());
        Ok(events)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_events(events, expected_version).await
    }

    async fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.load_events(aggregate_id).await
    }
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Serialization(format!("failed to read current_version: {e}")))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::Serialization(format!("failed to read aggregate_type: {e}")))?;

    Ok((current_version.max(0) as u64, aggregate_type))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            EventStoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::Serialization(format!("{operation}: {err}"))
        }
        other => EventStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

struct StoredEventRow {
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    user_id: Option<uuid::Uuid>,
    correlation_id: uuid::Uuid,
}

impl<'r> FromRow<'r, PgRow> for StoredEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            user_id: row.try_get("user_id")?,
            correlation_id: row.try_get("correlation_id")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            event_type: row.event_type,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
            user_id: row.user_id.map(UserId::from_uuid),
            correlation_id: CorrelationId::from_uuid(row.correlation_id),
        }
    }
}
