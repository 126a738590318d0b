/*!
SQLite event store.

Durable [`EventStore`] backend over `sqlx`. Schema is created at connect
time (idempotent `CREATE TABLE IF NOT EXISTS`), mirroring the logical
layout:

- `events(id, correlation_id, sequence, type, payload, idempotency_key,
  created_at)` with unique `(correlation_id, sequence)` and
  `(correlation_id, idempotency_key)`.
- `outbox(cursor, event_id, published_at?, attempts, last_error?)`, cursor
  auto-incrementing in global append order.
- `snapshots(correlation_id, snapshot_id, up_to_sequence, payload,
  created_at)`.
- `dlq(event_id, error, quarantine_until, quarantined_at, manual_retries)`
  plus a counter side table that survives requeue.

`append` runs in a single transaction across the event and outbox tables;
a unique-index violation on `(correlation_id, sequence)` surfaces as
[`StoreError::SequenceConflict`], which is the duplicate-writer signal the
engine reacts to.
*/

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::events::{Event, EventDraft, EventId};
use crate::types::{CorrelationId, EventType};
use crate::utils::ids::IdGenerator;

use super::{
    AppendOutcome, AppendReceipt, DlqEntry, EventStore, OutboxRow, Result, RetentionConfig,
    Snapshot, SnapshotMeta, StoreError,
};

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    correlation_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (correlation_id, sequence),
    UNIQUE (correlation_id, idempotency_key)
);
CREATE INDEX IF NOT EXISTS idx_events_corr ON events (correlation_id, sequence);

CREATE TABLE IF NOT EXISTS outbox (
    cursor INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    published_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS snapshots (
    correlation_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    up_to_sequence INTEGER NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (correlation_id, snapshot_id)
);

CREATE TABLE IF NOT EXISTS dlq (
    event_id TEXT PRIMARY KEY,
    error TEXT NOT NULL,
    quarantine_until TEXT NOT NULL,
    quarantined_at TEXT NOT NULL,
    manual_retries INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dlq_counters (
    event_id TEXT PRIMARY KEY,
    manual_retries INTEGER NOT NULL DEFAULT 0
);
"#;

/// Durable SQLite-backed [`EventStore`].
pub struct SqliteEventStore {
    pool: SqlitePool,
    ids: IdGenerator,
}

impl std::fmt::Debug for SqliteEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEventStore").finish()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: e.to_string(),
    }
}

fn decode_event(row: &SqliteRow) -> Result<Event> {
    let type_str: String = row.get("type");
    let event_type = EventType::parse(&type_str).ok_or_else(|| StoreError::Backend {
        message: format!("unknown event type in store: {type_str}"),
    })?;
    let payload_text: String = row.get("payload");
    let payload =
        serde_json::from_str(&payload_text).map_err(|source| StoreError::Serde { source })?;
    let correlation_id: String = row.get("correlation_id");
    let sequence: i64 = row.get("sequence");
    Ok(Event {
        id: row.get("id"),
        correlation_id: CorrelationId::from(correlation_id),
        sequence: sequence as u64,
        event_type,
        payload,
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
    })
}

impl SqliteEventStore {
    /// Connect (or create) a SQLite database at `database_url` and ensure
    /// the schema. Example URL: `sqlite://gantry.db?mode=rwc`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(backend)?;
        sqlx::raw_sql(DDL).execute(&pool).await.map_err(backend)?;
        Ok(Self {
            pool,
            ids: IdGenerator::new(),
        })
    }

    /// Resolve the database URL from the environment (`GANTRY_SQLITE_URL`,
    /// falling back to `gantry.db` in the working directory) and connect.
    pub async fn connect_from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let url = std::env::var("GANTRY_SQLITE_URL")
            .unwrap_or_else(|_| "sqlite://gantry.db?mode=rwc".to_string());
        Self::connect(&url).await
    }

    /// Delete events and snapshots of terminated runs, and DLQ rows, that
    /// aged past the configured horizons. Returns the number of deleted
    /// event rows. Explicit maintenance; nothing calls this implicitly.
    #[instrument(skip(self, retention))]
    pub async fn sweep_expired(&self, retention: &RetentionConfig) -> Result<u64> {
        let run_horizon = Utc::now()
            - chrono::Duration::from_std(retention.terminated_runs).unwrap_or_default();
        let dlq_horizon =
            Utc::now() - chrono::Duration::from_std(retention.dlq).unwrap_or_default();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let expired = sqlx::query(
            r#"
            SELECT DISTINCT correlation_id FROM events
            WHERE type IN ('workflow.completed', 'workflow.failed')
              AND created_at < ?1
            "#,
        )
        .bind(run_horizon)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend)?;

        let mut deleted = 0u64;
        for row in expired {
            let cid: String = row.get("correlation_id");
            sqlx::query(
                r#"
                DELETE FROM outbox WHERE event_id IN
                    (SELECT id FROM events WHERE correlation_id = ?1)
                "#,
            )
            .bind(&cid)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
            let result = sqlx::query("DELETE FROM events WHERE correlation_id = ?1")
                .bind(&cid)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            deleted += result.rows_affected();
            sqlx::query("DELETE FROM snapshots WHERE correlation_id = ?1")
                .bind(&cid)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        sqlx::query("DELETE FROM dlq WHERE quarantined_at < ?1")
            .bind(dlq_horizon)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(skip(self, drafts), fields(run = %correlation_id), err)]
    async fn append(
        &self,
        correlation_id: &CorrelationId,
        drafts: Vec<EventDraft>,
    ) -> Result<AppendReceipt> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut receipt = AppendReceipt::default();

        let mut terminated: bool = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM events
                WHERE correlation_id = ?1
                  AND type IN ('workflow.completed', 'workflow.failed')
            )
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?
            != 0;

        let mut head: u64 = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE correlation_id = ?1",
        )
        .bind(correlation_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)? as u64;

        for draft in drafts {
            let existing = sqlx::query(
                r#"
                SELECT id, correlation_id, sequence, type, payload, idempotency_key, created_at
                FROM events
                WHERE correlation_id = ?1 AND idempotency_key = ?2
                "#,
            )
            .bind(correlation_id.as_str())
            .bind(&draft.idempotency_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

            if let Some(row) = existing {
                receipt
                    .outcomes
                    .push(AppendOutcome::Deduplicated(decode_event(&row)?));
                continue;
            }
            if terminated {
                return Err(StoreError::RunTerminated {
                    correlation_id: correlation_id.clone(),
                });
            }

            head += 1;
            let event = Event {
                id: self.ids.event_id(),
                correlation_id: correlation_id.clone(),
                sequence: head,
                event_type: draft.event_type,
                payload: draft.payload,
                idempotency_key: draft.idempotency_key,
                created_at: Utc::now(),
            };
            let payload_text = serde_json::to_string(&event.payload)
                .map_err(|source| StoreError::Serde { source })?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO events
                    (id, correlation_id, sequence, type, payload, idempotency_key, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&event.id)
            .bind(correlation_id.as_str())
            .bind(event.sequence as i64)
            .bind(event.event_type.as_str())
            .bind(&payload_text)
            .bind(&event.idempotency_key)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                let unique = e
                    .as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false);
                if unique {
                    return Err(StoreError::SequenceConflict {
                        correlation_id: correlation_id.clone(),
                        sequence: event.sequence,
                    });
                }
                return Err(backend(e));
            }

            sqlx::query("INSERT INTO outbox (event_id) VALUES (?1)")
                .bind(&event.id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

            if event.event_type.is_terminal() {
                terminated = true;
            }
            receipt.outcomes.push(AppendOutcome::Appended(event));
        }

        tx.commit().await.map_err(backend)?;
        Ok(receipt)
    }

    async fn load(&self, correlation_id: &CorrelationId, from_seq: u64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, sequence, type, payload, idempotency_key, created_at
            FROM events
            WHERE correlation_id = ?1 AND sequence > ?2
            ORDER BY sequence
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(decode_event).collect()
    }

    async fn head(&self, correlation_id: &CorrelationId) -> Result<u64> {
        let head: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE correlation_id = ?1",
        )
        .bind(correlation_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(head as u64)
    }

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let payload_text = serde_json::to_string(&snapshot.payload)
            .map_err(|source| StoreError::Serde { source })?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO snapshots
                (correlation_id, snapshot_id, up_to_sequence, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(snapshot.correlation_id.as_str())
        .bind(&snapshot.snapshot_id)
        .bind(snapshot.up_to_sequence as i64)
        .bind(&payload_text)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn read_snapshot(&self, correlation_id: &CorrelationId) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, snapshot_id, up_to_sequence, payload, created_at
            FROM snapshots
            WHERE correlation_id = ?1
            ORDER BY up_to_sequence DESC
            LIMIT 1
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| decode_snapshot(&r)).transpose()
    }

    async fn read_snapshot_by_id(
        &self,
        correlation_id: &CorrelationId,
        snapshot_id: &str,
    ) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, snapshot_id, up_to_sequence, payload, created_at
            FROM snapshots
            WHERE correlation_id = ?1 AND snapshot_id = ?2
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| decode_snapshot(&r)).transpose()
    }

    async fn list_snapshots(&self, correlation_id: &CorrelationId) -> Result<Vec<SnapshotMeta>> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot_id, up_to_sequence, created_at
            FROM snapshots
            WHERE correlation_id = ?1
            ORDER BY up_to_sequence
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|r| {
                let seq: i64 = r.get("up_to_sequence");
                SnapshotMeta {
                    snapshot_id: r.get("snapshot_id"),
                    up_to_sequence: seq as u64,
                    created_at: r.get("created_at"),
                }
            })
            .collect())
    }

    async fn scan_outbox(&self, limit: usize, after: u64) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(
            r#"
            SELECT cursor, event_id, attempts, last_error
            FROM outbox
            WHERE published_at IS NULL AND cursor > ?1
            ORDER BY cursor
            LIMIT ?2
            "#,
        )
        .bind(after as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|r| {
                let cursor: i64 = r.get("cursor");
                let attempts: i64 = r.get("attempts");
                OutboxRow {
                    cursor: cursor as u64,
                    event_id: r.get("event_id"),
                    attempts: attempts as u32,
                    last_error: r.get("last_error"),
                }
            })
            .collect())
    }

    async fn fetch_event(&self, event_id: &EventId) -> Result<Option<Event>> {
        let row = sqlx::query(
            r#"
            SELECT id, correlation_id, sequence, type, payload, idempotency_key, created_at
            FROM events
            WHERE id = ?1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|r| decode_event(&r)).transpose()
    }

    async fn mark_published(&self, event_ids: &[EventId]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for id in event_ids {
            let result = sqlx::query("UPDATE outbox SET published_at = ?1 WHERE event_id = ?2")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            if result.rows_affected() == 0 {
                return Err(StoreError::UnknownEvent {
                    event_id: id.clone(),
                });
            }
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn record_publish_failure(&self, event_id: &EventId, error: &str) -> Result<u32> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE outbox SET attempts = attempts + 1, last_error = ?1
            WHERE event_id = ?2
            RETURNING attempts
            "#,
        )
        .bind(error)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        attempts
            .map(|a| a as u32)
            .ok_or_else(|| StoreError::UnknownEvent {
                event_id: event_id.clone(),
            })
    }

    async fn quarantine(
        &self,
        event_id: &EventId,
        error: &str,
        quarantine_until: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let result = sqlx::query(
            "UPDATE outbox SET published_at = ?1, last_error = ?2 WHERE event_id = ?3",
        )
        .bind(now)
        .bind(format!("error: {error}"))
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownEvent {
                event_id: event_id.clone(),
            });
        }
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dlq
                (event_id, error, quarantine_until, quarantined_at, manual_retries)
            VALUES (
                ?1, ?2, ?3, ?4,
                COALESCE((SELECT manual_retries FROM dlq_counters WHERE event_id = ?1), 0)
            )
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(quarantine_until)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn dlq_list(&self, ready_only: bool) -> Result<Vec<DlqEntry>> {
        let rows = if ready_only {
            sqlx::query(
                r#"
                SELECT event_id, error, quarantine_until, quarantined_at, manual_retries
                FROM dlq WHERE quarantine_until <= ?1 ORDER BY quarantined_at
                "#,
            )
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                SELECT event_id, error, quarantine_until, quarantined_at, manual_retries
                FROM dlq ORDER BY quarantined_at
                "#,
            )
            .fetch_all(&self.pool)
            .await
        }
        .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|r| {
                let retries: i64 = r.get("manual_retries");
                DlqEntry {
                    event_id: r.get("event_id"),
                    error: r.get("error"),
                    quarantine_until: r.get("quarantine_until"),
                    quarantined_at: r.get("quarantined_at"),
                    manual_retries: retries as u32,
                }
            })
            .collect())
    }

    async fn dlq_requeue(&self, event_id: &EventId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let result = sqlx::query("DELETE FROM dlq WHERE event_id = ?1")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotQuarantined {
                event_id: event_id.clone(),
            });
        }
        sqlx::query(
            r#"
            UPDATE outbox SET published_at = NULL, attempts = 0, last_error = NULL
            WHERE event_id = ?1
            "#,
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        sqlx::query(
            r#"
            INSERT INTO dlq_counters (event_id, manual_retries) VALUES (?1, 1)
            ON CONFLICT (event_id) DO UPDATE SET manual_retries = manual_retries + 1
            "#,
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn dlq_purge(&self, event_id: &EventId) -> Result<()> {
        let result = sqlx::query("DELETE FROM dlq WHERE event_id = ?1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotQuarantined {
                event_id: event_id.clone(),
            });
        }
        Ok(())
    }
}

fn decode_snapshot(row: &SqliteRow) -> Result<Snapshot> {
    let payload_text: String = row.get("payload");
    let payload =
        serde_json::from_str(&payload_text).map_err(|source| StoreError::Serde { source })?;
    let correlation_id: String = row.get("correlation_id");
    let seq: i64 = row.get("up_to_sequence");
    Ok(Snapshot {
        correlation_id: CorrelationId::from(correlation_id),
        snapshot_id: row.get("snapshot_id"),
        up_to_sequence: seq as u64,
        payload,
        created_at: row.get("created_at"),
    })
}
