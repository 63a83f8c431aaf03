//! Hours journal model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::subscription::UnknownVariant;

/// What produced a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    ChangeRequest,
    RolloverAdjustment,
    PackAdjustment,
    PeriodAdvance,
    StatusChange,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::ChangeRequest => "change_request",
            TransactionKind::RolloverAdjustment => "rollover_adjustment",
            TransactionKind::PackAdjustment => "pack_adjustment",
            TransactionKind::PeriodAdvance => "period_advance",
            TransactionKind::StatusChange => "status_change",
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            TransactionKind::ChangeRequest => 1,
            TransactionKind::RolloverAdjustment => 2,
            TransactionKind::PackAdjustment => 3,
            TransactionKind::PeriodAdvance => 4,
            TransactionKind::StatusChange => 5,
        }
    }
}

impl TryFrom<String> for TransactionKind {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "change_request" => Ok(TransactionKind::ChangeRequest),
            "rollover_adjustment" => Ok(TransactionKind::RolloverAdjustment),
            "pack_adjustment" => Ok(TransactionKind::PackAdjustment),
            "period_advance" => Ok(TransactionKind::PeriodAdvance),
            "status_change" => Ok(TransactionKind::StatusChange),
            _ => Err(UnknownVariant {
                kind: "transaction kind",
                value,
            }),
        }
    }
}

/// A committed mutation of a project's hours facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HoursTransaction {
    pub transaction_id: Uuid,
    /// Monotonic insertion order, used as the page cursor.
    pub sequence: i64,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub subscription_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub kind: TransactionKind,
    pub monthly_used_delta: Decimal,
    pub rollover_delta: Decimal,
    pub pack_delta: Decimal,
    pub change_requests_delta: i32,
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Journal entry written alongside a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub idempotency_key: Option<String>,
    pub description: Option<String>,
}

impl NewTransaction {
    pub fn new(kind: TransactionKind) -> Self {
        Self {
            kind,
            idempotency_key: None,
            description: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description.filter(|d| !d.is_empty());
        self
    }
}

/// Filter parameters for listing journal entries, newest first.
#[derive(Debug, Clone)]
pub struct ListTransactionsFilter {
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    /// Only entries with a sequence strictly below this.
    pub before_sequence: Option<i64>,
    pub page_size: i32,
}
