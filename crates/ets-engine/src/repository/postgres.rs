//! PostgreSQL store
//!
//! Subscriptions keep their type-specific configuration as JSON text; the
//! subscription type is stored alongside it for the per-type queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;

use super::{Change, CommitOutcome, InvocationRepository, SubscriptionRepository, UnitOfWork};
use crate::domain::{Invocation, Subscription, SubscriptionType};
use crate::error::{EtsError, Result};

pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: String,
    tenant_id: String,
    trigger_id: String,
    name: String,
    description: Option<String>,
    config: String,
    filter: Option<String>,
    script_source: Option<String>,
    response_deadline_minutes: Option<i32>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = EtsError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            trigger_id: row.trigger_id,
            name: row.name,
            description: row.description,
            config: serde_json::from_str(&row.config)?,
            filter: row.filter,
            script_source: row.script_source,
            response_deadline_minutes: row
                .response_deadline_minutes
                .and_then(|m| u32::try_from(m).ok()),
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct InvocationRow {
    id: String,
    tenant_id: String,
    trigger_id: String,
    subscription_id: String,
    secret_hash: String,
    created_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl From<InvocationRow> for Invocation {
    fn from(row: InvocationRow) -> Self {
        Invocation {
            id: row.id,
            tenant_id: row.tenant_id,
            trigger_id: row.trigger_id,
            subscription_id: row.subscription_id,
            secret_hash: row.secret_hash,
            created: row.created_at,
            deadline: Some(row.deadline),
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, trigger_id, name, description, config, filter, \
     script_source, response_deadline_minutes, enabled, created_at, updated_at";

fn from_rows(rows: Vec<SubscriptionRow>) -> Result<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ets_subscriptions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                trigger_id TEXT NOT NULL,
                subscription_type TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                config TEXT NOT NULL,
                filter TEXT,
                script_source TEXT,
                response_deadline_minutes INTEGER,
                enabled BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ets_subscriptions_trigger \
             ON ets_subscriptions(tenant_id, trigger_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ets_subscriptions_type \
             ON ets_subscriptions(tenant_id, subscription_type)",
        )
        .execute(&self.pool)
        .await?;

        // Only request/response invocations are stored, so the deadline is required
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ets_invocations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                trigger_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                deadline TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ets_invocations_deadline ON ets_invocations(deadline)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for PgStore {
    async fn insert(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ets_subscriptions (id, tenant_id, trigger_id, subscription_type, name,
                description, config, filter, script_source, response_deadline_minutes, enabled,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&subscription.id)
        .bind(&subscription.tenant_id)
        .bind(&subscription.trigger_id)
        .bind(subscription.subscription_type().as_str())
        .bind(&subscription.name)
        .bind(&subscription.description)
        .bind(serde_json::to_string(&subscription.config)?)
        .bind(&subscription.filter)
        .bind(&subscription.script_source)
        .bind(subscription.response_deadline_minutes.map(|m| m as i32))
        .bind(subscription.enabled)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, subscription: &Subscription) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ets_subscriptions
            SET subscription_type = $2, name = $3, description = $4, config = $5, filter = $6,
                script_source = $7, response_deadline_minutes = $8, enabled = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(&subscription.id)
        .bind(subscription.subscription_type().as_str())
        .bind(&subscription.name)
        .bind(&subscription.description)
        .bind(serde_json::to_string(&subscription.config)?)
        .bind(&subscription.filter)
        .bind(&subscription.script_source)
        .bind(subscription.response_deadline_minutes.map(|m| m as i32))
        .bind(subscription.enabled)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EtsError::not_found("Subscription", &subscription.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ets_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ets_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_all_by_tenant_and_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ets_subscriptions WHERE tenant_id = $1 AND trigger_id = $2 \
             ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(trigger_id)
        .fetch_all(&self.pool)
        .await?;
        from_rows(rows)
    }

    async fn find_all_by_tenant_and_type(
        &self,
        tenant_id: &str,
        subscription_type: SubscriptionType,
    ) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ets_subscriptions WHERE tenant_id = $1 AND subscription_type = $2 \
             ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subscription_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        from_rows(rows)
    }
}

#[async_trait]
impl InvocationRepository for PgStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Invocation>> {
        let row: Option<InvocationRow> = sqlx::query_as(
            "SELECT id, tenant_id, trigger_id, subscription_id, secret_hash, created_at, deadline \
             FROM ets_invocations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Invocation::from))
    }

    async fn find_by_deadline_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invocation>> {
        let rows: Vec<InvocationRow> = sqlx::query_as(
            "SELECT id, tenant_id, trigger_id, subscription_id, secret_hash, created_at, deadline \
             FROM ets_invocations WHERE deadline < $1 ORDER BY deadline ASC LIMIT $2",
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Invocation::from).collect())
    }
}

#[async_trait]
impl UnitOfWork for PgStore {
    async fn commit(&self, changes: Vec<Change>) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        for change in &changes {
            match change {
                Change::SaveInvocation(invocation) => {
                    let Some(deadline) = invocation.deadline else {
                        return Err(EtsError::validation(
                            "deadline",
                            "only request/response invocations are persisted",
                        ));
                    };
                    sqlx::query(
                        r#"
                        INSERT INTO ets_invocations (id, tenant_id, trigger_id, subscription_id,
                            secret_hash, created_at, deadline)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(&invocation.id)
                    .bind(&invocation.tenant_id)
                    .bind(&invocation.trigger_id)
                    .bind(&invocation.subscription_id)
                    .bind(&invocation.secret_hash)
                    .bind(invocation.created)
                    .bind(deadline)
                    .execute(&mut *tx)
                    .await?;
                }
                Change::DeleteInvocation(id) => {
                    let result = sqlx::query("DELETE FROM ets_invocations WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        tx.rollback().await?;
                        debug!(invocation_id = %id, "Invocation already gone, unit rolled back");
                        return Ok(CommitOutcome::AlreadyGone);
                    }
                }
                Change::Stage(entry) => {
                    ets_outbox::postgres::stage(&mut *tx, entry)
                        .await
                        .map_err(EtsError::storage)?;
                }
            }
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }
}
