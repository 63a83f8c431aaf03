//! Staff commands: plan assignment and lifecycle, hour grants and
//! revocations, period advance, journal listing.
//!
//! Every write goes through the same conditional commit as change-request
//! consumption.

use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::HoursPolicyConfig;
use crate::ledger::{check_storable, compute_balance, HoursBalance, HOURS_LIMIT};
use crate::models::{
    next_period_end, AssignSubscription, HoursTransaction, ListTransactionsFilter,
    NewTransaction, Subscription, SubscriptionStatus, TransactionKind,
};
use crate::services::change_requests::{
    stale_write_exhausted, stored_balance, MAX_COMMIT_ATTEMPTS,
};
use crate::services::metrics::{record_admin_operation, record_stale_write};
use crate::services::store::{
    Committed, FactsMutation, HoursStore, ProjectSnapshot, StoreError, SubscriptionDelta,
};

pub const DEFAULT_PAGE_SIZE: i32 = 50;
pub const MAX_PAGE_SIZE: i32 = 100;

/// Bucket a staff adjustment applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoursBucket {
    Rollover,
    Pack,
}

impl HoursBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoursBucket::Rollover => "rollover",
            HoursBucket::Pack => "pack",
        }
    }

    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(HoursBucket::Rollover),
            2 => Some(HoursBucket::Pack),
            _ => None,
        }
    }

    fn transaction_kind(&self) -> TransactionKind {
        match self {
            HoursBucket::Rollover => TransactionKind::RolloverAdjustment,
            HoursBucket::Pack => TransactionKind::PackAdjustment,
        }
    }
}

/// Grant (positive) or revoke (negative) hours in one bucket.
#[derive(Debug, Clone)]
pub struct AdjustHours {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub bucket: HoursBucket,
    pub delta: Decimal,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeriodAdvance {
    pub subscription: Subscription,
    pub balance: HoursBalance,
    pub transaction: HoursTransaction,
}

#[derive(Clone)]
pub struct AdminService {
    store: Arc<dyn HoursStore>,
    policy: HoursPolicyConfig,
}

impl AdminService {
    pub fn new(store: Arc<dyn HoursStore>, policy: HoursPolicyConfig) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &HoursPolicyConfig {
        &self.policy
    }

    /// Load fresh facts (and optionally one subscription), build a mutation,
    /// commit it. One retry on a stale write.
    async fn commit_with_retry<F>(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        subscription_id: Option<Uuid>,
        operation: &'static str,
        mut build: F,
    ) -> Result<(ProjectSnapshot, Committed), AppError>
    where
        F: FnMut(&ProjectSnapshot, Option<&Subscription>) -> Result<FactsMutation, AppError>
            + Send,
    {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            // Version first: anything read after it is either in the snapshot
            // or bumps the version and fails the commit.
            let snapshot = self.store.load_project(tenant_id, project_id).await?;
            let subscription = match subscription_id {
                Some(id) => Some(self.get_subscription(tenant_id, id).await?),
                None => None,
            };

            let mutation = build(&snapshot, subscription.as_ref())?;

            match self
                .store
                .commit(tenant_id, project_id, snapshot.version, mutation)
                .await
            {
                Ok(committed) => {
                    record_admin_operation(&tenant_id.to_string(), operation);
                    return Ok((snapshot, committed));
                }
                Err(StoreError::StaleWrite { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(operation = operation, "Stale write, retrying");
                    record_stale_write(operation, "retried");
                }
                Err(StoreError::StaleWrite { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }

        Err(stale_write_exhausted(operation))
    }

    pub async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Subscription, AppError> {
        self.store
            .get_subscription(tenant_id, subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))
    }

    /// Assign a plan to a project, optionally active right away.
    #[instrument(
        skip(self, input),
        fields(tenant_id = %input.tenant_id, project_id = %input.project_id)
    )]
    pub async fn assign(&self, input: AssignSubscription) -> Result<Subscription, AppError> {
        input.validate()?;
        if input.monthly_included_hours < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "monthly_included_hours must not be negative"
            )));
        }
        check_storable("monthly_included_hours", input.monthly_included_hours)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

        let (_, committed) = self
            .commit_with_retry(
                input.tenant_id,
                input.project_id,
                None,
                "assign_subscription",
                |snapshot, _| {
                    if input.activate && snapshot.active_subscription().is_some() {
                        return Err(AppError::Conflict(anyhow::anyhow!(
                            "Project already has an active subscription"
                        )));
                    }
                    let subscription = input.clone().into_subscription(Utc::now());
                    Ok(FactsMutation {
                        new_subscription: Some(subscription),
                        ..FactsMutation::new(
                            NewTransaction::new(TransactionKind::StatusChange)
                                .with_description(Some(format!("Assigned plan {}", input.plan_name))),
                        )
                    })
                },
            )
            .await?;

        let subscription_id = committed.transaction.subscription_id.ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Assignment journal has no subscription"))
        })?;
        let subscription = self
            .get_subscription(input.tenant_id, subscription_id)
            .await?;

        info!(
            subscription_id = %subscription.subscription_id,
            status = subscription.status.as_str(),
            "Subscription assigned"
        );
        Ok(subscription)
    }

    /// `inactive → active`. Activating an active subscription is a renewal no-op.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn activate(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Subscription, AppError> {
        self.change_status(
            tenant_id,
            subscription_id,
            SubscriptionStatus::Active,
            None,
            "activate_subscription",
        )
        .await
    }

    /// `inactive | active → cancelled`. Terminal.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        reason: Option<String>,
    ) -> Result<Subscription, AppError> {
        self.change_status(
            tenant_id,
            subscription_id,
            SubscriptionStatus::Cancelled,
            reason,
            "cancel_subscription",
        )
        .await
    }

    async fn change_status(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        target: SubscriptionStatus,
        reason: Option<String>,
        operation: &'static str,
    ) -> Result<Subscription, AppError> {
        let current = self.get_subscription(tenant_id, subscription_id).await?;
        if current.status == target && target == SubscriptionStatus::Active {
            return Ok(current);
        }

        self.commit_with_retry(
            tenant_id,
            current.project_id,
            Some(subscription_id),
            operation,
            |snapshot, subscription| {
                let subscription = subscription.unwrap_or(&current);
                let next = subscription
                    .status
                    .transition_to(target)
                    .map_err(|e| AppError::FailedPrecondition(anyhow::anyhow!(e)))?;

                if next == SubscriptionStatus::Active
                    && snapshot
                        .active_subscription()
                        .is_some_and(|s| s.subscription_id != subscription_id)
                {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Project already has an active subscription"
                    )));
                }

                let description = reason
                    .clone()
                    .unwrap_or_else(|| format!("Subscription {}", next.as_str()));
                Ok(FactsMutation {
                    subscription: Some(SubscriptionDelta {
                        subscription_id,
                        new_status: Some(next),
                        ..SubscriptionDelta::default()
                    }),
                    ..FactsMutation::new(
                        NewTransaction::new(TransactionKind::StatusChange)
                            .with_description(Some(description)),
                    )
                })
            },
        )
        .await?;

        let subscription = self.get_subscription(tenant_id, subscription_id).await?;
        info!(status = subscription.status.as_str(), "Subscription status changed");
        Ok(subscription)
    }

    /// Grant or revoke rollover/pack hours.
    #[instrument(
        skip(self, input),
        fields(tenant_id = %input.tenant_id, project_id = %input.project_id, bucket = input.bucket.as_str())
    )]
    pub async fn adjust_hours(
        &self,
        input: AdjustHours,
    ) -> Result<(HoursBalance, HoursTransaction), AppError> {
        check_storable("delta", input.delta)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;
        if input.delta.is_zero() {
            return Err(AppError::BadRequest(anyhow::anyhow!("delta must not be zero")));
        }

        if let Some(replay) = self.replay_adjustment(&input).await? {
            return Ok(replay);
        }

        let outcome = self
            .commit_with_retry(
                input.tenant_id,
                input.project_id,
                None,
                "adjust_hours",
                |snapshot, _| {
                    let current = match input.bucket {
                        HoursBucket::Rollover => snapshot.rollover_hours,
                        HoursBucket::Pack => snapshot.pack_hours,
                    };
                    let after = bucket_after(current, input.delta, input.bucket)?;
                    if after < Decimal::ZERO {
                        return Err(AppError::FailedPrecondition(anyhow::anyhow!(
                            "Cannot remove {} {} hours, only {} available",
                            -input.delta,
                            input.bucket.as_str(),
                            current
                        )));
                    }

                    let journal = NewTransaction::new(input.bucket.transaction_kind())
                        .with_idempotency_key(input.idempotency_key.clone())
                        .with_description(input.reason.clone());
                    let mut mutation = FactsMutation::new(journal);
                    match input.bucket {
                        HoursBucket::Rollover => mutation.rollover_delta = input.delta,
                        HoursBucket::Pack => mutation.pack_delta = input.delta,
                    }
                    Ok(mutation)
                },
            )
            .await;

        let (snapshot, committed) = match outcome {
            Ok(done) => done,
            // Lost an idempotency race: the winner's entry is now visible
            Err(AppError::Conflict(e)) if input.idempotency_key.is_some() => {
                return match self.replay_adjustment(&input).await? {
                    Some(replay) => Ok(replay),
                    None => Err(AppError::Conflict(e)),
                };
            }
            Err(e) => return Err(e),
        };

        let mut facts = snapshot.facts();
        facts.rollover_total = bucket_after(
            facts.rollover_total,
            committed.transaction.rollover_delta,
            HoursBucket::Rollover,
        )?;
        facts.pack_hours_total = bucket_after(
            facts.pack_hours_total,
            committed.transaction.pack_delta,
            HoursBucket::Pack,
        )?;
        let balance =
            compute_balance(&facts).map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

        info!(delta = %input.delta, "Hours adjusted");
        Ok((balance, committed.transaction))
    }

    /// The earlier adjustment for a repeated idempotency key.
    async fn replay_adjustment(
        &self,
        input: &AdjustHours,
    ) -> Result<Option<(HoursBalance, HoursTransaction)>, AppError> {
        let Some(key) = input.idempotency_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let Some(existing) = self
            .store
            .find_transaction(input.tenant_id, input.project_id, key)
            .await?
        else {
            return Ok(None);
        };

        if existing.kind != input.bucket.transaction_kind() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Idempotency key {} was used for a {} entry",
                key,
                existing.kind.as_str()
            )));
        }

        let snapshot = self
            .store
            .load_project(input.tenant_id, input.project_id)
            .await?;
        info!(transaction_id = %existing.transaction_id, "Replaying hours adjustment");
        Ok(Some((stored_balance(&snapshot)?, existing)))
    }

    /// Close the current period and open the next one.
    ///
    /// Unused monthly hours roll over, bounded by the configured cap on total
    /// rollover (unlimited plans roll nothing). Monthly usage and the
    /// change-request counter reset.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn advance_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<PeriodAdvance, AppError> {
        let current = self.get_subscription(tenant_id, subscription_id).await?;
        let cap = self.policy.rollover_cap_hours;

        let (snapshot, committed) = self
            .commit_with_retry(
                tenant_id,
                current.project_id,
                Some(subscription_id),
                "advance_period",
                |snapshot, subscription| {
                    let subscription = subscription.unwrap_or(&current);
                    if !subscription.is_active() {
                        return Err(AppError::FailedPrecondition(anyhow::anyhow!(
                            "Only an active subscription can advance its period"
                        )));
                    }

                    let rollover_delta =
                        rollover_gain(subscription, snapshot.rollover_hours, cap);
                    bucket_after(snapshot.rollover_hours, rollover_delta, HoursBucket::Rollover)
                        .map_err(|e| AppError::FailedPrecondition(anyhow::anyhow!(e)))?;
                    let start = subscription.current_period_end;
                    let end = next_period_end(start);

                    Ok(FactsMutation {
                        rollover_delta,
                        subscription: Some(SubscriptionDelta {
                            subscription_id,
                            monthly_used_delta: -subscription.monthly_used_hours,
                            change_requests_delta: -subscription.change_requests_used,
                            new_period: Some((start, end)),
                            new_status: None,
                        }),
                        ..FactsMutation::new(
                            NewTransaction::new(TransactionKind::PeriodAdvance).with_description(
                                Some(format!(
                                    "Closed period {} to {}",
                                    subscription.current_period_start,
                                    subscription.current_period_end
                                )),
                            ),
                        )
                    })
                },
            )
            .await?;

        let subscription = self.get_subscription(tenant_id, subscription_id).await?;
        let mut facts = snapshot.facts();
        facts.monthly_used = subscription.monthly_used_hours;
        facts.rollover_total = bucket_after(
            facts.rollover_total,
            committed.transaction.rollover_delta,
            HoursBucket::Rollover,
        )?;
        let balance =
            compute_balance(&facts).map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

        info!(
            rolled_over = %committed.transaction.rollover_delta,
            period_end = %subscription.current_period_end,
            "Billing period advanced"
        );

        Ok(PeriodAdvance {
            subscription,
            balance,
            transaction: committed.transaction,
        })
    }

    /// Journal page, newest first. The token is the last sequence returned.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, project_id = %project_id))]
    pub async fn list_transactions(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        page_size: i32,
        page_token: Option<&str>,
    ) -> Result<(Vec<HoursTransaction>, Option<String>), AppError> {
        let page_size = if page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.min(MAX_PAGE_SIZE)
        };

        let before_sequence = match page_token.filter(|t| !t.is_empty()) {
            Some(token) => Some(token.parse::<i64>().map_err(|_| {
                AppError::BadRequest(anyhow::anyhow!("Invalid page_token: {}", token))
            })?),
            None => None,
        };

        // One extra row tells us whether another page exists
        let mut transactions = self
            .store
            .list_transactions(ListTransactionsFilter {
                tenant_id,
                project_id,
                before_sequence,
                page_size: page_size + 1,
            })
            .await?;

        let next_page_token = if transactions.len() > page_size as usize {
            transactions.truncate(page_size as usize);
            transactions.last().map(|t| t.sequence.to_string())
        } else {
            None
        };

        Ok((transactions, next_page_token))
    }
}

/// `current + delta` for one bucket, refusing totals the store cannot hold.
fn bucket_after(current: Decimal, delta: Decimal, bucket: HoursBucket) -> Result<Decimal, AppError> {
    current
        .checked_add(delta)
        .filter(|v| *v < HOURS_LIMIT)
        .ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!(
                "{} hours would exceed {}",
                bucket.as_str(),
                HOURS_LIMIT
            ))
        })
}

/// Hours carried into rollover when a period closes.
fn rollover_gain(subscription: &Subscription, rollover_now: Decimal, cap: Option<Decimal>) -> Decimal {
    if subscription.is_unlimited {
        return Decimal::ZERO;
    }
    let unused = (subscription.monthly_included_hours - subscription.monthly_used_hours)
        .max(Decimal::ZERO);
    match cap {
        Some(cap) => unused.min((cap - rollover_now).max(Decimal::ZERO)),
        None => unused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::tests::subscription;
    use crate::ledger::Availability;
    use crate::models::Enforcement;
    use crate::services::memory::InMemoryHoursStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn admin(policy: HoursPolicyConfig) -> (AdminService, Arc<InMemoryHoursStore>) {
        let store = Arc::new(InMemoryHoursStore::new());
        (AdminService::new(store.clone(), policy), store)
    }

    fn plan(tenant: Uuid, project: Uuid, included: &str, activate: bool) -> AssignSubscription {
        AssignSubscription {
            tenant_id: tenant,
            project_id: project,
            plan_name: "Care".to_string(),
            enforcement: Enforcement::QuotaAndHours,
            monthly_included_hours: dec(included),
            is_unlimited: false,
            change_requests_allowed: 4,
            period_start: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            activate,
        }
    }

    fn grant(tenant: Uuid, project: Uuid, delta: Decimal) -> AdjustHours {
        AdjustHours {
            tenant_id: tenant,
            project_id: project,
            bucket: HoursBucket::Pack,
            delta,
            reason: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn rollover_gain_respects_cap() {
        let mut sub = subscription(SubscriptionStatus::Active, Enforcement::Hours, 0, 0);
        sub.monthly_included_hours = dec("10");
        sub.monthly_used_hours = dec("4");

        assert_eq!(rollover_gain(&sub, dec("0"), None), dec("6"));
        assert_eq!(rollover_gain(&sub, dec("3"), Some(dec("5"))), dec("2"));
        assert_eq!(rollover_gain(&sub, dec("9"), Some(dec("5"))), Decimal::ZERO);

        sub.monthly_used_hours = dec("12");
        assert_eq!(rollover_gain(&sub, dec("0"), None), Decimal::ZERO);

        sub.is_unlimited = true;
        sub.monthly_used_hours = Decimal::ZERO;
        assert_eq!(rollover_gain(&sub, dec("0"), None), Decimal::ZERO);
    }

    #[tokio::test]
    async fn assign_then_cancel_then_reactivate_fails() {
        let (admin, _) = admin(HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());

        let sub = admin.assign(plan(tenant, project, "10", true)).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);

        let cancelled = admin
            .cancel(tenant, sub.subscription_id, Some("Client left".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

        let err = admin.activate(tenant, sub.subscription_id).await.unwrap_err();
        assert!(matches!(err, AppError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn second_active_assignment_conflicts() {
        let (admin, _) = admin(HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());

        admin.assign(plan(tenant, project, "10", true)).await.unwrap();
        let err = admin
            .assign(plan(tenant, project, "20", true))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // An inactive one can wait alongside it
        let pending = admin.assign(plan(tenant, project, "20", false)).await.unwrap();
        let err = admin
            .activate(tenant, pending.subscription_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn activating_active_subscription_is_a_no_op() {
        let (admin, store) = admin(HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());
        let sub = admin.assign(plan(tenant, project, "10", true)).await.unwrap();

        let again = admin.activate(tenant, sub.subscription_id).await.unwrap();
        assert_eq!(again.status, SubscriptionStatus::Active);
        assert_eq!(store.load_project(tenant, project).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn revoking_more_than_available_fails() {
        let (admin, _) = admin(HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());

        let grant = AdjustHours {
            tenant_id: tenant,
            project_id: project,
            bucket: HoursBucket::Pack,
            delta: dec("3"),
            reason: Some("Bonus".to_string()),
            idempotency_key: None,
        };
        let (balance, _) = admin.adjust_hours(grant.clone()).await.unwrap();
        assert_eq!(balance.total_available, Availability::Hours(dec("3")));

        let revoke = AdjustHours {
            delta: dec("-5"),
            ..grant
        };
        let err = admin.adjust_hours(revoke).await.unwrap_err();
        assert!(matches!(err, AppError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn unstorable_hours_are_bad_requests() {
        let (admin, store) = admin(HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());

        let err = admin
            .assign(plan(tenant, project, "10.00001", true))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        for delta in ["0.00001", "100000000"] {
            let err = admin
                .adjust_hours(grant(tenant, project, dec(delta)))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)), "{}", delta);
        }

        // Each grant fits, their sum does not
        admin
            .adjust_hours(grant(tenant, project, dec("60000000")))
            .await
            .unwrap();
        let err = admin
            .adjust_hours(grant(tenant, project, dec("60000000")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = admin
            .adjust_hours(grant(tenant, project, Decimal::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let snapshot = store.load_project(tenant, project).await.unwrap();
        assert_eq!(snapshot.pack_hours, dec("60000000"));
    }

    /// Hides journal entries from the first idempotency lookup, so the
    /// commit is the first to see the duplicate key.
    struct LateReplayStore {
        inner: InMemoryHoursStore,
        hidden_lookups: AtomicUsize,
    }

    #[async_trait]
    impl HoursStore for LateReplayStore {
        async fn load_project(&self, t: Uuid, p: Uuid) -> Result<ProjectSnapshot, StoreError> {
            self.inner.load_project(t, p).await
        }

        async fn commit(
            &self,
            t: Uuid,
            p: Uuid,
            expected_version: i64,
            mutation: FactsMutation,
        ) -> Result<Committed, StoreError> {
            self.inner.commit(t, p, expected_version, mutation).await
        }

        async fn get_subscription(
            &self,
            t: Uuid,
            id: Uuid,
        ) -> Result<Option<Subscription>, StoreError> {
            self.inner.get_subscription(t, id).await
        }

        async fn find_transaction(
            &self,
            t: Uuid,
            p: Uuid,
            key: &str,
        ) -> Result<Option<HoursTransaction>, StoreError> {
            if self.hidden_lookups.load(Ordering::SeqCst) > 0 {
                self.hidden_lookups.fetch_sub(1, Ordering::SeqCst);
                return Ok(None);
            }
            self.inner.find_transaction(t, p, key).await
        }

        async fn list_transactions(
            &self,
            filter: ListTransactionsFilter,
        ) -> Result<Vec<HoursTransaction>, StoreError> {
            self.inner.list_transactions(filter).await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn losing_an_idempotency_race_replays_the_winner() {
        let store = Arc::new(LateReplayStore {
            inner: InMemoryHoursStore::new(),
            hidden_lookups: AtomicUsize::new(0),
        });
        let admin = AdminService::new(store.clone(), HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());

        let mut input = grant(tenant, project, dec("3"));
        input.idempotency_key = Some("grant-7".to_string());
        let (_, winner) = admin.adjust_hours(input.clone()).await.unwrap();

        store.hidden_lookups.store(1, Ordering::SeqCst);
        let (balance, replayed) = admin.adjust_hours(input).await.unwrap();

        assert_eq!(replayed.transaction_id, winner.transaction_id);
        assert_eq!(balance.total_available, Availability::Hours(dec("3")));
        let snapshot = store.load_project(tenant, project).await.unwrap();
        assert_eq!(snapshot.pack_hours, dec("3"));
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn advance_rolls_unused_hours_and_resets_counters() {
        let (admin, store) = admin(HoursPolicyConfig {
            rollover_cap_hours: Some(dec("4")),
            default_change_requests: 5,
        });
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());
        let sub = admin.assign(plan(tenant, project, "10", true)).await.unwrap();

        let advanced = admin
            .advance_period(tenant, sub.subscription_id)
            .await
            .unwrap();

        assert_eq!(advanced.transaction.rollover_delta, dec("4"));
        assert_eq!(
            advanced.subscription.current_period_start,
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
        );
        assert_eq!(
            advanced.subscription.current_period_end,
            NaiveDate::from_ymd_opt(2026, 3, 28).unwrap()
        );
        assert_eq!(advanced.balance.rollover_total, dec("4"));
        assert_eq!(advanced.balance.total_available, Availability::Hours(dec("14")));

        let snapshot = store.load_project(tenant, project).await.unwrap();
        assert_eq!(snapshot.rollover_hours, dec("4"));
    }

    #[tokio::test]
    async fn inactive_subscription_cannot_advance() {
        let (admin, _) = admin(HoursPolicyConfig::default());
        let (tenant, project) = (Uuid::new_v4(), Uuid::new_v4());
        let sub = admin.assign(plan(tenant, project, "10", false)).await.unwrap();

        let err = admin
            .advance_period(tenant, sub.subscription_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn malformed_page_token_is_rejected() {
        let (admin, _) = admin(HoursPolicyConfig::default());
        let err = admin
            .list_transactions(Uuid::new_v4(), Uuid::new_v4(), 10, Some("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
