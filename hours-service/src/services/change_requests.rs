//! Change-request admission workflow.
//!
//! Read facts, compute the balance, ask the gate, commit the consumption as
//! one conditional write. A stale write is retried once against fresh facts,
//! then surfaced as "please retry".

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::gate::{can_accept_change_request, Decision};
use crate::ledger::{
    check_storable, compute_balance, plan_drawdown, Drawdown, FactProblem, HoursBalance,
    HoursFacts, InvalidFactError,
};
use crate::models::{HoursTransaction, NewTransaction, Subscription, TransactionKind};
use crate::services::metrics::{record_decision, record_hours_consumed, record_stale_write};
use crate::services::store::{
    FactsMutation, HoursStore, ProjectSnapshot, StoreError, SubscriptionDelta,
};

/// Attempts at a conditional write before giving up.
pub(crate) const MAX_COMMIT_ATTEMPTS: usize = 2;

/// Balance computed from stored facts. Bad stored facts are our bug, not the caller's.
pub(crate) fn stored_balance(snapshot: &ProjectSnapshot) -> Result<HoursBalance, AppError> {
    compute_balance(&snapshot.facts()).map_err(|e| {
        error!(
            project_id = %snapshot.project_id,
            error = %e,
            "Stored hours facts are invalid"
        );
        AppError::InternalError(anyhow::anyhow!(e))
    })
}

pub(crate) fn stale_write_exhausted(operation: &str) -> AppError {
    record_stale_write(operation, "aborted");
    AppError::Aborted(anyhow::anyhow!(
        "Project hours changed concurrently, please retry"
    ))
}

/// Result of a dry-run admission check.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: Decision,
    pub balance: HoursBalance,
    pub subscription: Option<Subscription>,
}

/// A change request to admit and consume.
#[derive(Debug, Clone)]
pub struct SubmitChangeRequest {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub estimated_hours: Decimal,
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub decision: Decision,
    pub balance: HoursBalance,
    /// Journal entry of the consumption; set only when accepted.
    pub transaction: Option<HoursTransaction>,
    /// An earlier submission with the same idempotency key was returned.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct ChangeRequestService {
    store: Arc<dyn HoursStore>,
}

impl ChangeRequestService {
    pub fn new(store: Arc<dyn HoursStore>) -> Self {
        Self { store }
    }

    /// Current balance and subscription for a project.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, project_id = %project_id))]
    pub async fn balance(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
    ) -> Result<(HoursBalance, Option<Subscription>), AppError> {
        let snapshot = self.store.load_project(tenant_id, project_id).await?;
        let balance = stored_balance(&snapshot)?;
        Ok((balance, snapshot.subscription))
    }

    /// Decide without consuming anything.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, project_id = %project_id))]
    pub async fn evaluate(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        estimated_hours: Decimal,
    ) -> Result<Evaluation, AppError> {
        validate_cost(estimated_hours)?;

        let snapshot = self.store.load_project(tenant_id, project_id).await?;
        let balance = stored_balance(&snapshot)?;
        let decision =
            can_accept_change_request(snapshot.subscription.as_ref(), &balance, estimated_hours);

        Ok(Evaluation {
            decision,
            balance,
            subscription: snapshot.subscription,
        })
    }

    /// Admit a change request and consume quota and/or hours.
    #[instrument(
        skip(self, input),
        fields(tenant_id = %input.tenant_id, project_id = %input.project_id)
    )]
    pub async fn submit(&self, input: SubmitChangeRequest) -> Result<Submission, AppError> {
        validate_cost(input.estimated_hours)?;
        let tenant_label = input.tenant_id.to_string();

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            if let Some(replay) = self.replay(&input).await? {
                return Ok(replay);
            }

            let snapshot = self
                .store
                .load_project(input.tenant_id, input.project_id)
                .await?;
            let balance = stored_balance(&snapshot)?;
            let subscription = snapshot.subscription.as_ref();
            let decision =
                can_accept_change_request(subscription, &balance, input.estimated_hours);

            let subscription = match (decision, subscription) {
                (Decision::Accepted, Some(subscription)) => subscription,
                _ => {
                    // Business outcome, not a failure
                    info!(decision = %decision, "Change request not accepted");
                    record_decision(&tenant_label, decision.as_str());
                    return Ok(Submission {
                        decision,
                        balance,
                        transaction: None,
                        replayed: false,
                    });
                }
            };

            let drawdown = if subscription.enforcement.enforces_hours() {
                plan_drawdown(&balance, input.estimated_hours)
            } else {
                Drawdown::default()
            };
            let mutation = consumption(&input, subscription, &drawdown);

            match self
                .store
                .commit(input.tenant_id, input.project_id, snapshot.version, mutation)
                .await
            {
                Ok(committed) => {
                    record_decision(&tenant_label, decision.as_str());
                    record_drawdown(&tenant_label, &drawdown);
                    info!(
                        decision = %decision,
                        transaction_id = %committed.transaction.transaction_id,
                        "Change request accepted"
                    );
                    return Ok(Submission {
                        decision,
                        balance: balance_after(&snapshot.facts(), &drawdown)?,
                        transaction: Some(committed.transaction),
                        replayed: false,
                    });
                }
                Err(StoreError::StaleWrite { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(attempt = attempt, "Stale write on change request, retrying");
                    record_stale_write("submit_change_request", "retried");
                }
                Err(StoreError::StaleWrite { .. }) => break,
                // Lost an idempotency race: the winner's entry is now visible
                Err(StoreError::Conflict(_)) if input.idempotency_key.is_some() => {
                    if let Some(replay) = self.replay(&input).await? {
                        return Ok(replay);
                    }
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Idempotency key already used"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(stale_write_exhausted("submit_change_request"))
    }

    /// The earlier outcome for a repeated idempotency key.
    async fn replay(&self, input: &SubmitChangeRequest) -> Result<Option<Submission>, AppError> {
        let Some(key) = input.idempotency_key.as_deref() else {
            return Ok(None);
        };

        let Some(existing) = self
            .store
            .find_transaction(input.tenant_id, input.project_id, key)
            .await?
        else {
            return Ok(None);
        };

        if existing.kind != TransactionKind::ChangeRequest {
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
        info!(transaction_id = %existing.transaction_id, "Replaying change request");

        Ok(Some(Submission {
            decision: Decision::Accepted,
            balance: stored_balance(&snapshot)?,
            transaction: Some(existing),
            replayed: true,
        }))
    }
}

fn validate_cost(estimated_hours: Decimal) -> Result<(), AppError> {
    if estimated_hours < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "estimated_hours must not be negative"
        )));
    }
    check_storable("estimated_hours", estimated_hours)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))
}

/// Quota counter +1 (capped at the allowance) when quota is enforced, plus
/// the hours draw-down.
fn consumption(
    input: &SubmitChangeRequest,
    subscription: &Subscription,
    drawdown: &Drawdown,
) -> FactsMutation {
    let change_requests_delta = if subscription.enforcement.enforces_quota()
        && subscription.change_requests_used < subscription.change_requests_allowed
    {
        1
    } else {
        0
    };

    FactsMutation {
        rollover_delta: -drawdown.rollover,
        pack_delta: -drawdown.pack,
        subscription: Some(SubscriptionDelta {
            subscription_id: subscription.subscription_id,
            monthly_used_delta: drawdown.monthly,
            change_requests_delta,
            ..SubscriptionDelta::default()
        }),
        new_subscription: None,
        journal: NewTransaction::new(TransactionKind::ChangeRequest)
            .with_idempotency_key(input.idempotency_key.clone())
            .with_description(input.description.clone()),
    }
}

fn balance_after(facts: &HoursFacts, drawdown: &Drawdown) -> Result<HoursBalance, AppError> {
    let overflow = |field| {
        AppError::InternalError(anyhow::anyhow!(InvalidFactError {
            field,
            problem: FactProblem::OutOfRange,
        }))
    };
    let after = HoursFacts {
        monthly_used: facts
            .monthly_used
            .checked_add(drawdown.monthly)
            .ok_or_else(|| overflow("monthly_used"))?,
        rollover_total: facts
            .rollover_total
            .checked_sub(drawdown.rollover)
            .ok_or_else(|| overflow("rollover_total"))?,
        pack_hours_total: facts
            .pack_hours_total
            .checked_sub(drawdown.pack)
            .ok_or_else(|| overflow("pack_hours_total"))?,
        ..*facts
    };
    compute_balance(&after).map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))
}

fn record_drawdown(tenant_id: &str, drawdown: &Drawdown) {
    for (bucket, hours) in [
        ("monthly", drawdown.monthly),
        ("rollover", drawdown.rollover),
        ("pack", drawdown.pack),
    ] {
        record_hours_consumed(tenant_id, bucket, hours.to_f64().unwrap_or_default());
    }
}
