//! Maintenance subscription model.

use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

/// Subscription status.
///
/// `inactive → active`, `active → active` (renewal), `inactive | active → cancelled`.
/// `cancelled` is terminal; re-subscribing creates a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            SubscriptionStatus::Inactive => 1,
            SubscriptionStatus::Active => 2,
            SubscriptionStatus::Cancelled => 3,
        }
    }

    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Inactive, Active) | (Active, Active) | (Inactive, Cancelled) | (Active, Cancelled)
        )
    }

    /// Check a transition, returning the target status when legal.
    pub fn transition_to(
        &self,
        next: SubscriptionStatus,
    ) -> Result<SubscriptionStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: *self,
                to: next,
            })
        }
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            _ => Err(UnknownVariant {
                kind: "subscription status",
                value,
            }),
        }
    }
}

/// Illegal status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscription cannot move from {} to {}", from.as_str(), to.as_str())]
pub struct TransitionError {
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
}

/// A stored string that does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Which gates a plan enforces on change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Count of change requests per period.
    Quota,
    /// Hours balance.
    Hours,
    QuotaAndHours,
}

impl Enforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Enforcement::Quota => "quota",
            Enforcement::Hours => "hours",
            Enforcement::QuotaAndHours => "quota_and_hours",
        }
    }

    pub fn enforces_quota(&self) -> bool {
        matches!(self, Enforcement::Quota | Enforcement::QuotaAndHours)
    }

    pub fn enforces_hours(&self) -> bool {
        matches!(self, Enforcement::Hours | Enforcement::QuotaAndHours)
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            Enforcement::Quota => 1,
            Enforcement::Hours => 2,
            Enforcement::QuotaAndHours => 3,
        }
    }

    /// `None` for unspecified or unknown values.
    pub fn from_proto(value: i32) -> Option<Self> {
        match value {
            1 => Some(Enforcement::Quota),
            2 => Some(Enforcement::Hours),
            3 => Some(Enforcement::QuotaAndHours),
            _ => None,
        }
    }
}

impl TryFrom<String> for Enforcement {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "quota" => Ok(Enforcement::Quota),
            "hours" => Ok(Enforcement::Hours),
            "quota_and_hours" => Ok(Enforcement::QuotaAndHours),
            _ => Err(UnknownVariant {
                kind: "enforcement",
                value,
            }),
        }
    }
}

/// A project's maintenance-plan enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub plan_name: String,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    #[sqlx(try_from = "String")]
    pub enforcement: Enforcement,
    pub monthly_included_hours: Decimal,
    pub monthly_used_hours: Decimal,
    pub is_unlimited: bool,
    pub change_requests_allowed: i32,
    pub change_requests_used: i32,
    pub current_period_start: NaiveDate,
    pub current_period_end: NaiveDate,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub cancelled_utc: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    pub fn quota_exhausted(&self) -> bool {
        self.change_requests_used >= self.change_requests_allowed
    }
}

/// One monthly period after `start`. Month-end dates clamp (Jan 31 → Feb 28).
pub fn next_period_end(start: NaiveDate) -> NaiveDate {
    start
        .checked_add_months(Months::new(1))
        .unwrap_or(NaiveDate::MAX)
}

/// Input for assigning a plan to a project.
#[derive(Debug, Clone, Validate)]
pub struct AssignSubscription {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    #[validate(length(min = 1, max = 120, message = "plan name must be 1-120 characters"))]
    pub plan_name: String,
    pub enforcement: Enforcement,
    pub monthly_included_hours: Decimal,
    pub is_unlimited: bool,
    #[validate(range(min = 0, max = 10000))]
    pub change_requests_allowed: i32,
    pub period_start: NaiveDate,
    pub activate: bool,
}

impl AssignSubscription {
    /// Build the record this assignment creates.
    pub fn into_subscription(self, now: DateTime<Utc>) -> Subscription {
        Subscription {
            subscription_id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            project_id: self.project_id,
            plan_name: self.plan_name,
            status: if self.activate {
                SubscriptionStatus::Active
            } else {
                SubscriptionStatus::Inactive
            },
            enforcement: self.enforcement,
            monthly_included_hours: self.monthly_included_hours,
            monthly_used_hours: Decimal::ZERO,
            is_unlimited: self.is_unlimited,
            change_requests_allowed: self.change_requests_allowed,
            change_requests_used: 0,
            current_period_start: self.period_start,
            current_period_end: next_period_end(self.period_start),
            created_utc: now,
            updated_utc: now,
            cancelled_utc: None,
        }
    }
}
