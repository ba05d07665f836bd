use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ets_common::OutboxEntry;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;

use crate::repository::{OutboxRepository, RelayOutcome};
use crate::EventBus;

pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ets_outbox (
                seq BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                topic TEXT NOT NULL,
                message_group TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ets_outbox_group ON ets_outbox(message_group, seq)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Stage an entry on the caller's connection, typically inside the
/// transaction that carries the state change the entry describes.
pub async fn stage(conn: &mut PgConnection, entry: &OutboxEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO ets_outbox (id, topic, message_group, payload, created_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&entry.id)
    .bind(&entry.topic)
    .bind(&entry.message_group)
    .bind(serde_json::to_string(&entry.payload)?)
    .bind(entry.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn insert(&self, entry: &OutboxEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        stage(&mut conn, entry).await
    }

    async fn backlog(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ets_outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn relay_oldest(&self, bus: &dyn EventBus) -> Result<RelayOutcome> {
        let mut tx = self.pool.begin().await?;

        // Only the head of each message group is eligible, and rows locked by
        // another drainer are skipped. A locked head still exists until its
        // drainer commits, so later rows of that group stay ineligible and
        // per-group order holds across processes.
        let row = sqlx::query(
            r#"
            DELETE FROM ets_outbox
            WHERE seq = (
                SELECT o.seq FROM ets_outbox o
                WHERE NOT EXISTS (
                    SELECT 1 FROM ets_outbox p
                    WHERE p.message_group = o.message_group AND p.seq < o.seq
                )
                ORDER BY o.seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, topic, message_group, payload, created_at
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(RelayOutcome::Empty);
        };

        let payload: String = row.get("payload");
        let created_at: DateTime<Utc> = row.get("created_at");
        let entry = OutboxEntry {
            id: row.get("id"),
            topic: row.get("topic"),
            message_group: row.get("message_group"),
            payload: serde_json::from_str(&payload)?,
            created_at,
        };

        if let Err(e) = bus.publish(&entry).await {
            tx.rollback().await?;
            return Err(e);
        }

        tx.commit().await?;
        debug!(entry_id = %entry.id, topic = %entry.topic, "Outbox entry relayed (PostgreSQL)");
        Ok(RelayOutcome::Relayed(entry.id))
    }
}
