//! Persistence contract for a project's hours facts.
//!
//! Every write goes through [`HoursStore::commit`], a conditional write
//! guarded by the project's version token. There is no raw
//! read-modify-write path.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::HoursFacts;
use crate::models::{
    HoursTransaction, ListTransactionsFilter, NewTransaction, Subscription, SubscriptionStatus,
};

/// Consistent read of everything the ledger and gate need for one project.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSnapshot {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    /// Version token to pass back to `commit`. 0 when nothing was ever written.
    pub version: i64,
    pub rollover_hours: Decimal,
    pub pack_hours: Decimal,
    /// The active subscription, or the most recent one when none is active.
    pub subscription: Option<Subscription>,
}

impl ProjectSnapshot {
    pub fn empty(tenant_id: Uuid, project_id: Uuid) -> Self {
        Self {
            tenant_id,
            project_id,
            version: 0,
            rollover_hours: Decimal::ZERO,
            pack_hours: Decimal::ZERO,
            subscription: None,
        }
    }

    pub fn active_subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref().filter(|s| s.is_active())
    }

    /// Ledger input. Only an active plan contributes an allotment.
    pub fn facts(&self) -> HoursFacts {
        let (monthly_included, monthly_used, is_unlimited) = match self.active_subscription() {
            Some(sub) => (sub.monthly_included_hours, sub.monthly_used_hours, sub.is_unlimited),
            None => (Decimal::ZERO, Decimal::ZERO, false),
        };

        HoursFacts {
            monthly_included,
            monthly_used,
            rollover_total: self.rollover_hours,
            pack_hours_total: self.pack_hours,
            is_unlimited,
        }
    }
}

/// Change to one existing subscription.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionDelta {
    pub subscription_id: Uuid,
    pub monthly_used_delta: Decimal,
    pub change_requests_delta: i32,
    /// Replace the billing period (start, end).
    pub new_period: Option<(NaiveDate, NaiveDate)>,
    pub new_status: Option<SubscriptionStatus>,
}

/// One atomic change to a project's facts plus its journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FactsMutation {
    pub rollover_delta: Decimal,
    pub pack_delta: Decimal,
    pub subscription: Option<SubscriptionDelta>,
    pub new_subscription: Option<Subscription>,
    pub journal: NewTransaction,
}

impl FactsMutation {
    pub fn new(journal: NewTransaction) -> Self {
        Self {
            rollover_delta: Decimal::ZERO,
            pack_delta: Decimal::ZERO,
            subscription: None,
            new_subscription: None,
            journal,
        }
    }

    pub fn subscription_id(&self) -> Option<Uuid> {
        self.subscription
            .as_ref()
            .map(|d| d.subscription_id)
            .or_else(|| self.new_subscription.as_ref().map(|s| s.subscription_id))
    }

    pub fn monthly_used_delta(&self) -> Decimal {
        self.subscription
            .as_ref()
            .map(|d| d.monthly_used_delta)
            .unwrap_or_default()
    }

    pub fn change_requests_delta(&self) -> i32 {
        self.subscription
            .as_ref()
            .map(|d| d.change_requests_delta)
            .unwrap_or_default()
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub version: i64,
    pub transaction: HoursTransaction,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The project changed since it was read.
    #[error("stale write for project {project_id}: expected version {expected_version}")]
    StaleWrite {
        project_id: Uuid,
        expected_version: i64,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The mutation would break a stored invariant (e.g. negative hours).
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StaleWrite { .. } => {
                AppError::Aborted(anyhow::anyhow!("{}, please retry", err))
            }
            StoreError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            StoreError::Constraint(msg) => AppError::FailedPrecondition(anyhow::anyhow!(msg)),
            StoreError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

#[async_trait]
pub trait HoursStore: Send + Sync {
    /// Read the project's facts and version in one consistent snapshot.
    async fn load_project(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<ProjectSnapshot, StoreError>;

    /// Apply `mutation` iff the project is still at `expected_version`.
    async fn commit(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        expected_version: i64,
        mutation: FactsMutation,
    ) -> Result<Committed, StoreError>;

    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Journal entry previously recorded under `idempotency_key`.
    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<HoursTransaction>, StoreError>;

    /// Journal entries, newest first.
    async fn list_transactions(
        &self,
        filter: ListTransactionsFilter,
    ) -> Result<Vec<HoursTransaction>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
