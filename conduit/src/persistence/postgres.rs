use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::{BreakerState, BreakerStore, CircuitBreakerState};
use crate::config::PersistenceConfig;
use crate::correlation::CorrelationId;
use crate::error::EngineError;
use crate::item::{ItemId, ItemStatus, NewQueueItem, QueueItem};
use crate::lease::{
    ClaimRequest, ExpiredLeaseOutcome, ItemLease, LeaseId, LeaseRenewal, LEASE_EXPIRED_ERROR,
};
use crate::queue::{
    LeaseExpiryScanner, QueueStats, QueueStore, RequeueFilter, Settlement, STATS_DURATION_WINDOW,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const ITEM_COLUMNS: &str = "id, sequence, correlation_id, queue_name, dependency, priority, \
     status, payload, attempt_count, max_attempts, scheduled_at, created_at, claimed_at, \
     completed_at, lease_id, lease_owner, lease_expires_at, last_error";

/// Open a connection pool sized by `config`.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(StdDuration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

/// Create the queue and breaker tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    debug!("conduit schema ensured");
    Ok(())
}

fn column_u32(column: &'static str, value: i32) -> Result<u32, EngineError> {
    u32::try_from(value).map_err(|_| EngineError::InvalidColumn {
        column,
        value: value.to_string(),
    })
}

fn item_from_row(row: &PgRow) -> anyhow::Result<QueueItem> {
    let status: String = row.try_get("status")?;
    let correlation_id: String = row.try_get("correlation_id")?;

    Ok(QueueItem {
        id: ItemId(row.try_get("id")?),
        sequence: row.try_get("sequence")?,
        correlation_id: CorrelationId::parse(correlation_id)?,
        queue_name: row.try_get("queue_name")?,
        dependency: row.try_get("dependency")?,
        priority: row.try_get("priority")?,
        status: status.parse()?,
        payload: row.try_get("payload")?,
        attempt_count: column_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: column_u32("max_attempts", row.try_get("max_attempts")?)?,
        scheduled_at: row.try_get("scheduled_at")?,
        created_at: row.try_get("created_at")?,
        claimed_at: row.try_get("claimed_at")?,
        completed_at: row.try_get("completed_at")?,
        lease_id: row.try_get::<Option<Uuid>, _>("lease_id")?.map(LeaseId),
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_error: row.try_get("last_error")?,
    })
}

/// PostgreSQL-backed job record store.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers in any number
/// of processes each get a distinct row; every lease-holder update is
/// conditional on the stored `lease_id`.
#[derive(Clone, Debug)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn insert(&self, items: Vec<NewQueueItem>) -> anyhow::Result<Vec<QueueItem>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(items.len());

        for item in items {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO conduit_queue_items (
                    id, correlation_id, queue_name, dependency, priority, status, payload,
                    attempt_count, max_attempts, scheduled_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, 'pending', $6, 0, $7, $8, $9, $9)
                RETURNING {ITEM_COLUMNS}
                "#
            ))
            .bind(item.id.0)
            .bind(item.correlation_id.as_str())
            .bind(&item.queue_name)
            .bind(&item.dependency)
            .bind(item.priority)
            .bind(&item.payload)
            .bind(item.max_attempts as i32)
            .bind(item.scheduled_at)
            .bind(item.created_at)
            .fetch_one(&mut *tx)
            .await;

            match row {
                Ok(row) => out.push(item_from_row(&row)?),
                Err(e) => {
                    drop(tx.rollback().await);
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn claimable_dependencies(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT dependency
            FROM conduit_queue_items
            WHERE queue_name = $1
              AND status = 'pending'
              AND scheduled_at <= $2
            ORDER BY dependency
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("dependency")?))
            .collect()
    }

    async fn claim_next(&self, request: ClaimRequest) -> anyhow::Result<Option<ItemLease>> {
        if request.dependencies.is_empty() {
            return Ok(None);
        }

        let lease_id = LeaseId::new();
        let expires_at = request.now + request.lease_ttl;

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM conduit_queue_items
                WHERE queue_name = $1
                  AND status = 'pending'
                  AND scheduled_at <= $2
                  AND dependency = ANY($3)
                ORDER BY priority ASC, scheduled_at ASC, sequence ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE conduit_queue_items q
            SET status = 'claimed',
                claimed_at = $2,
                lease_id = $4,
                lease_owner = $5,
                lease_expires_at = $6,
                updated_at = $2
            FROM next
            WHERE q.id = next.id
            RETURNING q.*
            "#,
        )
        .bind(&request.queue_name)
        .bind(request.now)
        .bind(&request.dependencies)
        .bind(lease_id.0)
        .bind(&request.worker_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ItemLease {
            lease_id,
            worker_id: request.worker_id,
            expires_at,
            item: item_from_row(&row)?,
            trial: false,
        }))
    }

    async fn mark_running(
        &self,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE conduit_queue_items
            SET status = 'running',
                attempt_count = attempt_count + 1,
                updated_at = $2
            WHERE lease_id = $1
              AND status = 'claimed'
              AND lease_expires_at >= $2
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(lease_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn renew(&self, renewal: LeaseRenewal) -> anyhow::Result<Option<DateTime<Utc>>> {
        let expires_at = renewal.now + renewal.extend_by;
        let row = sqlx::query(
            r#"
            UPDATE conduit_queue_items
            SET lease_expires_at = $3,
                updated_at = $4
            WHERE lease_id = $1
              AND lease_owner = $2
              AND status IN ('claimed', 'running')
              AND lease_expires_at >= $4
            RETURNING lease_expires_at
            "#,
        )
        .bind(renewal.lease_id.0)
        .bind(&renewal.worker_id)
        .bind(expires_at)
        .bind(renewal.now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("lease_expires_at")?)),
            None => Ok(None),
        }
    }

    async fn settle(
        &self,
        lease_id: LeaseId,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let scheduled_at = match &settlement {
            Settlement::Retry { scheduled_at, .. } => Some(*scheduled_at),
            _ => None,
        };
        let completed_at = match settlement.status() {
            ItemStatus::Pending => None,
            _ => Some(now),
        };
        let allowed: Vec<&str> = if settlement.requires_running() {
            vec![ItemStatus::Running.as_str()]
        } else {
            vec![ItemStatus::Claimed.as_str(), ItemStatus::Running.as_str()]
        };

        let res = sqlx::query(
            r#"
            UPDATE conduit_queue_items
            SET status = $2,
                scheduled_at = COALESCE($3, scheduled_at),
                claimed_at = CASE WHEN $2 = 'pending' THEN NULL ELSE claimed_at END,
                completed_at = $4,
                last_error = COALESCE($5, last_error),
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $6
            WHERE lease_id = $1
              AND status = ANY($7)
            "#,
        )
        .bind(lease_id.0)
        .bind(settlement.status().as_str())
        .bind(scheduled_at)
        .bind(completed_at)
        .bind(settlement.error())
        .bind(now)
        .bind(&allowed)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            warn!(
                lease_id = %lease_id,
                outcome = settlement.label(),
                "settle matched no row (lease lost)"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn get(&self, id: ItemId) -> anyhow::Result<Option<QueueItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM conduit_queue_items WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn items_for_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM conduit_queue_items
            WHERE correlation_id = $1
            ORDER BY sequence ASC
            "#
        ))
        .bind(correlation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn stats(&self, queue_name: &str) -> anyhow::Result<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*)::bigint AS count
            FROM conduit_queue_items
            WHERE queue_name = $1
            GROUP BY status
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.push((status.parse::<ItemStatus>()?, count.max(0) as u64));
        }

        let durations = sqlx::query(
            r#"
            SELECT (EXTRACT(EPOCH FROM (completed_at - created_at)) * 1000)::bigint AS duration_ms
            FROM conduit_queue_items
            WHERE queue_name = $1
              AND status = 'completed'
              AND completed_at IS NOT NULL
            ORDER BY completed_at DESC
            LIMIT $2
            "#,
        )
        .bind(queue_name)
        .bind(STATS_DURATION_WINDOW as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("duration_ms"))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(QueueStats::from_counts(queue_name, counts, &durations))
    }

    async fn queue_names(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT queue_name FROM conduit_queue_items ORDER BY queue_name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("queue_name")?))
            .collect()
    }

    async fn requeue(&self, filter: RequeueFilter, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE conduit_queue_items
            SET status = 'pending',
                scheduled_at = $1,
                claimed_at = NULL,
                completed_at = NULL,
                attempt_count = CASE WHEN $2 THEN 0 ELSE attempt_count END,
                updated_at = $1
            WHERE status IN ('failed', 'dead')
              AND completed_at <= $3
              AND ($4::text IS NULL OR queue_name = $4)
              AND ($5::uuid IS NULL OR id = $5)
              AND ($2 OR attempt_count < max_attempts)
            "#,
        )
        .bind(now)
        .bind(filter.reset_attempts)
        .bind(filter.completed_before)
        .bind(filter.queue_name.as_deref())
        .bind(filter.item_id.map(|id| id.0))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn cleanup(&self, queue_name: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM conduit_queue_items
            WHERE queue_name = $1
              AND status IN ('completed', 'dead')
              AND completed_at < $2
            "#,
        )
        .bind(queue_name)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresQueueStore {
    async fn expired_leases(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM conduit_queue_items
            WHERE status IN ('claimed', 'running')
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < $1
            ORDER BY lease_expires_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn reclaim(
        &self,
        item_id: ItemId,
        lease_id: LeaseId,
        outcome: ExpiredLeaseOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let (status, scheduled_at, completed_at) = match &outcome {
            ExpiredLeaseOutcome::Resurrected { scheduled_at, .. } => {
                (ItemStatus::Pending, Some(*scheduled_at), None)
            }
            ExpiredLeaseOutcome::DeadLettered { .. } => (ItemStatus::Dead, None, Some(now)),
        };

        let res = sqlx::query(
            r#"
            UPDATE conduit_queue_items
            SET status = $3,
                attempt_count = $4,
                scheduled_at = COALESCE($5, scheduled_at),
                claimed_at = NULL,
                completed_at = $6,
                last_error = $7,
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $8
            WHERE id = $1
              AND lease_id = $2
              AND status IN ('claimed', 'running')
            "#,
        )
        .bind(item_id.0)
        .bind(lease_id.0)
        .bind(status.as_str())
        .bind(outcome.attempt_count() as i32)
        .bind(scheduled_at)
        .bind(completed_at)
        .bind(LEASE_EXPIRED_ERROR)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }
}

fn breaker_from_row(row: &PgRow) -> anyhow::Result<CircuitBreakerState> {
    let state: String = row.try_get("state")?;
    let version: i64 = row.try_get("version")?;

    Ok(CircuitBreakerState {
        dependency: row.try_get("dependency")?,
        state: state.parse::<BreakerState>()?,
        failure_count: column_u32("failure_count", row.try_get("failure_count")?)?,
        last_failure_at: row.try_get("last_failure_at")?,
        last_success_at: row.try_get("last_success_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        trial_expires_at: row.try_get("trial_expires_at")?,
        version: u64::try_from(version).map_err(|_| EngineError::InvalidColumn {
            column: "version",
            value: version.to_string(),
        })?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// PostgreSQL-backed breaker rows with version-checked writes.
#[derive(Clone, Debug)]
pub struct PostgresBreakerStore {
    pool: PgPool,
}

impl PostgresBreakerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BreakerStore for PostgresBreakerStore {
    async fn load(&self, dependency: &str) -> anyhow::Result<Option<CircuitBreakerState>> {
        let row = sqlx::query("SELECT * FROM conduit_circuit_breakers WHERE dependency = $1")
            .bind(dependency)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(breaker_from_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: &CircuitBreakerState,
    ) -> anyhow::Result<bool> {
        let res = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO conduit_circuit_breakers (
                        dependency, state, failure_count, last_failure_at, last_success_at,
                        next_attempt_at, trial_expires_at, version, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (dependency) DO NOTHING
                    "#,
                )
                .bind(&next.dependency)
                .bind(next.state.as_str())
                .bind(next.failure_count as i32)
                .bind(next.last_failure_at)
                .bind(next.last_success_at)
                .bind(next.next_attempt_at)
                .bind(next.trial_expires_at)
                .bind(next.version as i64)
                .bind(next.updated_at)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE conduit_circuit_breakers
                    SET state = $2,
                        failure_count = $3,
                        last_failure_at = $4,
                        last_success_at = $5,
                        next_attempt_at = $6,
                        trial_expires_at = $7,
                        version = $8,
                        updated_at = $9
                    WHERE dependency = $1
                      AND version = $10
                    "#,
                )
                .bind(&next.dependency)
                .bind(next.state.as_str())
                .bind(next.failure_count as i32)
                .bind(next.last_failure_at)
                .bind(next.last_success_at)
                .bind(next.next_attempt_at)
                .bind(next.trial_expires_at)
                .bind(next.version as i64)
                .bind(next.updated_at)
                .bind(expected as i64)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(res.rows_affected() == 1)
    }

    async fn list(&self) -> anyhow::Result<Vec<CircuitBreakerState>> {
        let rows = sqlx::query("SELECT * FROM conduit_circuit_breakers ORDER BY dependency")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(breaker_from_row).collect()
    }
}
