//! In-memory `HoursStore`.
//!
//! Same conditional-write contract as the PostgreSQL store; a single mutex
//! makes each commit a compare-and-swap. Used by tests and local runs.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{Committed, FactsMutation, HoursStore, ProjectSnapshot, StoreError};
use crate::ledger::HOURS_LIMIT;
use crate::models::{HoursTransaction, ListTransactionsFilter, Subscription, SubscriptionStatus};

#[derive(Debug, Clone, Copy, Default)]
struct Bank {
    rollover_hours: Decimal,
    pack_hours: Decimal,
    version: i64,
}

#[derive(Debug, Default)]
struct Inner {
    banks: HashMap<(Uuid, Uuid), Bank>,
    subscriptions: HashMap<Uuid, Subscription>,
    transactions: Vec<HoursTransaction>,
    next_sequence: i64,
}

impl Inner {
    fn current_subscription(&self, tenant_id: Uuid, project_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.project_id == project_id)
            .max_by_key(|s| (s.is_active(), s.created_utc))
    }

    fn other_active(&self, tenant_id: Uuid, project_id: Uuid, except: Uuid) -> bool {
        self.subscriptions.values().any(|s| {
            s.tenant_id == tenant_id
                && s.project_id == project_id
                && s.subscription_id != except
                && s.is_active()
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryHoursStore {
    inner: Mutex<Inner>,
}

impl InMemoryHoursStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `current + delta`, held to the same range as the PostgreSQL columns.
fn apply_delta(current: Decimal, delta: Decimal, what: &str) -> Result<Decimal, StoreError> {
    let value = current
        .checked_add(delta)
        .filter(|v| *v < HOURS_LIMIT)
        .ok_or_else(|| StoreError::Constraint(format!("{} exceeds the stored hours range", what)))?;
    if value < Decimal::ZERO {
        return Err(StoreError::Constraint(format!(
            "{} would become negative ({})",
            what, value
        )));
    }
    Ok(value)
}

#[async_trait]
impl HoursStore for InMemoryHoursStore {
    async fn load_project(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<ProjectSnapshot, StoreError> {
        let inner = self.inner.lock().await;
        let bank = inner
            .banks
            .get(&(tenant_id, project_id))
            .copied()
            .unwrap_or_default();

        Ok(ProjectSnapshot {
            tenant_id,
            project_id,
            version: bank.version,
            rollover_hours: bank.rollover_hours,
            pack_hours: bank.pack_hours,
            subscription: inner.current_subscription(tenant_id, project_id).cloned(),
        })
    }

    async fn commit(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        expected_version: i64,
        mutation: FactsMutation,
    ) -> Result<Committed, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (tenant_id, project_id);
        let bank = inner.banks.get(&key).copied().unwrap_or_default();

        if bank.version != expected_version {
            return Err(StoreError::StaleWrite {
                project_id,
                expected_version,
            });
        }

        // Validate everything before touching state
        let rollover_hours =
            apply_delta(bank.rollover_hours, mutation.rollover_delta, "rollover hours")?;
        let pack_hours = apply_delta(bank.pack_hours, mutation.pack_delta, "pack hours")?;

        if let Some(idempotency_key) = mutation.journal.idempotency_key.as_deref() {
            let duplicate = inner.transactions.iter().any(|t| {
                t.tenant_id == tenant_id
                    && t.project_id == project_id
                    && t.idempotency_key.as_deref() == Some(idempotency_key)
            });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "idempotency key {} already used",
                    idempotency_key
                )));
            }
        }

        if let Some(new_sub) = &mutation.new_subscription {
            if new_sub.tenant_id != tenant_id || new_sub.project_id != project_id {
                return Err(StoreError::Constraint(
                    "subscription belongs to another project".to_string(),
                ));
            }
            if new_sub.is_active()
                && inner.other_active(tenant_id, project_id, new_sub.subscription_id)
            {
                return Err(StoreError::Conflict(
                    "project already has an active subscription".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let updated_subscription = match &mutation.subscription {
            Some(delta) => {
                let mut sub = inner
                    .subscriptions
                    .get(&delta.subscription_id)
                    .filter(|s| s.tenant_id == tenant_id && s.project_id == project_id)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "subscription {} not found",
                            delta.subscription_id
                        ))
                    })?;

                sub.monthly_used_hours = apply_delta(
                    sub.monthly_used_hours,
                    delta.monthly_used_delta,
                    "monthly used hours",
                )?;
                sub.change_requests_used += delta.change_requests_delta;
                if sub.change_requests_used < 0 {
                    return Err(StoreError::Constraint(
                        "change requests used would become negative".to_string(),
                    ));
                }
                if let Some((start, end)) = delta.new_period {
                    sub.current_period_start = start;
                    sub.current_period_end = end;
                }
                if let Some(status) = delta.new_status {
                    if status == SubscriptionStatus::Active
                        && inner.other_active(tenant_id, project_id, sub.subscription_id)
                    {
                        return Err(StoreError::Conflict(
                            "project already has an active subscription".to_string(),
                        ));
                    }
                    if status == SubscriptionStatus::Cancelled {
                        sub.cancelled_utc = Some(now);
                    }
                    sub.status = status;
                }
                sub.updated_utc = now;
                Some(sub)
            }
            None => None,
        };

        inner.next_sequence += 1;
        let transaction = HoursTransaction {
            transaction_id: Uuid::new_v4(),
            sequence: inner.next_sequence,
            tenant_id,
            project_id,
            subscription_id: mutation.subscription_id(),
            kind: mutation.journal.kind,
            monthly_used_delta: mutation.monthly_used_delta(),
            rollover_delta: mutation.rollover_delta,
            pack_delta: mutation.pack_delta,
            change_requests_delta: mutation.change_requests_delta(),
            idempotency_key: mutation.journal.idempotency_key.clone(),
            description: mutation.journal.description.clone(),
            created_utc: now,
        };

        let version = bank.version + 1;
        inner.banks.insert(
            key,
            Bank {
                rollover_hours,
                pack_hours,
                version,
            },
        );
        if let Some(new_sub) = mutation.new_subscription {
            inner.subscriptions.insert(new_sub.subscription_id, new_sub);
        }
        if let Some(sub) = updated_subscription {
            inner.subscriptions.insert(sub.subscription_id, sub);
        }
        inner.transactions.push(transaction.clone());

        Ok(Committed {
            version,
            transaction,
        })
    }

    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .get(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<HoursTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .find(|t| {
                t.tenant_id == tenant_id
                    && t.project_id == project_id
                    && t.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn list_transactions(
        &self,
        filter: ListTransactionsFilter,
    ) -> Result<Vec<HoursTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        let limit = usize::try_from(filter.page_size).unwrap_or(0);

        Ok(inner
            .transactions
            .iter()
            .rev()
            .filter(|t| t.tenant_id == filter.tenant_id && t.project_id == filter.project_id)
            .filter(|t| filter.before_sequence.is_none_or(|before| t.sequence < before))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
