//! PostgreSQL `HoursStore` for hours-service.

use crate::models::{HoursTransaction, ListTransactionsFilter, Subscription};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{Committed, FactsMutation, HoursStore, ProjectSnapshot, StoreError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, tenant_id, project_id, plan_name, status, \
     enforcement, monthly_included_hours, monthly_used_hours, is_unlimited, \
     change_requests_allowed, change_requests_used, current_period_start, current_period_end, \
     created_utc, updated_utc, cancelled_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, sequence, tenant_id, project_id, \
     subscription_id, kind, monthly_used_delta, rollover_delta, pack_delta, \
     change_requests_delta, idempotency_key, description, created_utc";

/// Map a driver error, recognising the constraints the schema enforces.
fn store_error(context: &str, e: sqlx::Error) -> StoreError {
    if let Some(db_err) = e.as_database_error() {
        match (db_err.code().as_deref(), db_err.constraint()) {
            (Some("23505"), Some("idx_maintenance_subscriptions_one_active")) => {
                return StoreError::Conflict(
                    "project already has an active subscription".to_string(),
                );
            }
            (Some("23505"), Some("idx_hours_transactions_idempotency")) => {
                return StoreError::Conflict("idempotency key already used".to_string());
            }
            (Some("22003"), _) => {
                return StoreError::Constraint(format!(
                    "{} exceeds the stored hours range",
                    context
                ));
            }
            (Some("23514"), constraint) => {
                return StoreError::Constraint(format!(
                    "{} violates {}",
                    context,
                    constraint.unwrap_or("a check constraint")
                ));
            }
            _ => {}
        }
    }
    StoreError::Database(anyhow::anyhow!("Failed to {}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "hours-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl HoursStore for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, project_id = %project_id))]
    async fn load_project(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<ProjectSnapshot, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_project"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("begin snapshot", e))?;

        // Bank and subscription must come from the same snapshot as the version
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("set snapshot isolation", e))?;

        let bank: Option<(Decimal, Decimal, i64)> = sqlx::query_as(
            r#"
            SELECT rollover_hours, pack_hours, version
            FROM hour_banks
            WHERE tenant_id = $1 AND project_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(project_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("load hour bank", e))?;

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {}
            FROM maintenance_subscriptions
            WHERE tenant_id = $1 AND project_id = $2
            ORDER BY (status = 'active') DESC, created_utc DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(project_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("load subscription", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("end snapshot", e))?;
        timer.observe_duration();

        let mut snapshot = ProjectSnapshot::empty(tenant_id, project_id);
        if let Some((rollover_hours, pack_hours, version)) = bank {
            snapshot.rollover_hours = rollover_hours;
            snapshot.pack_hours = pack_hours;
            snapshot.version = version;
        }
        snapshot.subscription = subscription;

        Ok(snapshot)
    }

    #[instrument(
        skip(self, mutation),
        fields(tenant_id = %tenant_id, project_id = %project_id, kind = mutation.journal.kind.as_str())
    )]
    async fn commit(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        expected_version: i64,
        mutation: FactsMutation,
    ) -> Result<Committed, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("begin commit", e))?;

        if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO hour_banks (tenant_id, project_id)
                VALUES ($1, $2)
                ON CONFLICT (tenant_id, project_id) DO NOTHING
                "#,
            )
            .bind(tenant_id)
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("create hour bank", e))?;
        }

        // Compare-and-swap on the version token. A concurrent writer holding
        // the row lock makes this re-check against its committed version.
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE hour_banks
            SET rollover_hours = rollover_hours + $3,
                pack_hours = pack_hours + $4,
                version = version + 1,
                updated_utc = NOW()
            WHERE tenant_id = $1 AND project_id = $2 AND version = $5
            RETURNING version
            "#,
        )
        .bind(tenant_id)
        .bind(project_id)
        .bind(mutation.rollover_delta)
        .bind(mutation.pack_delta)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_error("update hour bank", e))?;

        let Some(version) = version else {
            tx.rollback()
                .await
                .map_err(|e| store_error("roll back stale commit", e))?;
            warn!(expected_version = expected_version, "Stale write rejected");
            return Err(StoreError::StaleWrite {
                project_id,
                expected_version,
            });
        };

        if let Some(sub) = &mutation.new_subscription {
            sqlx::query(
                r#"
                INSERT INTO maintenance_subscriptions (subscription_id, tenant_id, project_id, plan_name, status, enforcement, monthly_included_hours, monthly_used_hours, is_unlimited, change_requests_allowed, change_requests_used, current_period_start, current_period_end, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(sub.subscription_id)
            .bind(tenant_id)
            .bind(project_id)
            .bind(&sub.plan_name)
            .bind(sub.status.as_str())
            .bind(sub.enforcement.as_str())
            .bind(sub.monthly_included_hours)
            .bind(sub.monthly_used_hours)
            .bind(sub.is_unlimited)
            .bind(sub.change_requests_allowed)
            .bind(sub.change_requests_used)
            .bind(sub.current_period_start)
            .bind(sub.current_period_end)
            .bind(sub.created_utc)
            .bind(sub.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("insert subscription", e))?;
        }

        if let Some(delta) = &mutation.subscription {
            let (period_start, period_end) = delta.new_period.unzip();
            let result = sqlx::query(
                r#"
                UPDATE maintenance_subscriptions
                SET monthly_used_hours = monthly_used_hours + $4,
                    change_requests_used = change_requests_used + $5,
                    current_period_start = COALESCE($6, current_period_start),
                    current_period_end = COALESCE($7, current_period_end),
                    status = COALESCE($8::VARCHAR, status),
                    cancelled_utc = CASE WHEN $8::VARCHAR = 'cancelled' THEN NOW() ELSE cancelled_utc END,
                    updated_utc = NOW()
                WHERE tenant_id = $1 AND project_id = $2 AND subscription_id = $3
                "#,
            )
            .bind(tenant_id)
            .bind(project_id)
            .bind(delta.subscription_id)
            .bind(delta.monthly_used_delta)
            .bind(delta.change_requests_delta)
            .bind(period_start)
            .bind(period_end)
            .bind(delta.new_status.map(|s| s.as_str()))
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("update subscription", e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!(
                    "subscription {} not found",
                    delta.subscription_id
                )));
            }
        }

        let transaction = sqlx::query_as::<_, HoursTransaction>(&format!(
            r#"
            INSERT INTO hours_transactions (transaction_id, tenant_id, project_id, subscription_id, kind, monthly_used_delta, rollover_delta, pack_delta, change_requests_delta, idempotency_key, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(project_id)
        .bind(mutation.subscription_id())
        .bind(mutation.journal.kind.as_str())
        .bind(mutation.monthly_used_delta())
        .bind(mutation.rollover_delta)
        .bind(mutation.pack_delta)
        .bind(mutation.change_requests_delta())
        .bind(&mutation.journal.idempotency_key)
        .bind(&mutation.journal.description)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_error("record hours transaction", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("commit", e))?;
        timer.observe_duration();

        info!(
            version = version,
            transaction_id = %transaction.transaction_id,
            "Hours facts committed"
        );

        Ok(Committed {
            version,
            transaction,
        })
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {}
            FROM maintenance_subscriptions
            WHERE tenant_id = $1 AND subscription_id = $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("get subscription", e))?;

        timer.observe_duration();

        Ok(subscription)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, project_id = %project_id))]
    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<HoursTransaction>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, HoursTransaction>(&format!(
            r#"
            SELECT {}
            FROM hours_transactions
            WHERE tenant_id = $1 AND project_id = $2 AND idempotency_key = $3
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(project_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("find hours transaction", e))?;

        timer.observe_duration();

        Ok(transaction)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %filter.tenant_id, project_id = %filter.project_id))]
    async fn list_transactions(
        &self,
        filter: ListTransactionsFilter,
    ) -> Result<Vec<HoursTransaction>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, HoursTransaction>(&format!(
            r#"
            SELECT {}
            FROM hours_transactions
            WHERE tenant_id = $1 AND project_id = $2
              AND ($3::BIGINT IS NULL OR sequence < $3)
            ORDER BY sequence DESC
            LIMIT $4
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(filter.tenant_id)
        .bind(filter.project_id)
        .bind(filter.before_sequence)
        .bind(i64::from(filter.page_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("list hours transactions", e))?;

        timer.observe_duration();

        Ok(transactions)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("run health check", e))?;

        timer.observe_duration();
        Ok(())
    }
}
