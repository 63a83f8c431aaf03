//! Subscription gate: dashboard access and change-request admission.
//!
//! Pure decisions. Committing the consumption is the caller's job.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::ledger::HoursBalance;
use crate::models::Subscription;

/// Outcome of a change-request admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    RejectedInsufficientHours,
    RejectedQuotaExceeded,
    RejectedNoActiveSubscription,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::RejectedInsufficientHours => "rejected_insufficient_hours",
            Decision::RejectedQuotaExceeded => "rejected_quota_exceeded",
            Decision::RejectedNoActiveSubscription => "rejected_no_active_subscription",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted)
    }

    /// Client-facing explanation.
    pub fn user_message(&self) -> &'static str {
        match self {
            Decision::Accepted => "Change request accepted",
            Decision::RejectedInsufficientHours => "Out of included hours for this period",
            Decision::RejectedQuotaExceeded => "Maximum change requests this period reached",
            Decision::RejectedNoActiveSubscription => {
                "This project has no active maintenance plan"
            }
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            Decision::Accepted => 1,
            Decision::RejectedInsufficientHours => 2,
            Decision::RejectedQuotaExceeded => 3,
            Decision::RejectedNoActiveSubscription => 4,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True iff the project has a subscription and it is active.
pub fn can_access_dashboard(subscription: Option<&Subscription>) -> bool {
    subscription.is_some_and(Subscription::is_active)
}

/// Decide whether a change request costing `request_cost` hours may be accepted.
pub fn can_accept_change_request(
    subscription: Option<&Subscription>,
    balance: &HoursBalance,
    request_cost: Decimal,
) -> Decision {
    let subscription = match subscription {
        Some(subscription) if subscription.is_active() => subscription,
        _ => return Decision::RejectedNoActiveSubscription,
    };

    if subscription.enforcement.enforces_quota() && subscription.quota_exhausted() {
        return Decision::RejectedQuotaExceeded;
    }

    if subscription.enforcement.enforces_hours() && !balance.total_available.covers(request_cost)
    {
        return Decision::RejectedInsufficientHours;
    }

    Decision::Accepted
}
