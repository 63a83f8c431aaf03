//! Domain models for hours-service.

mod subscription;
mod transaction;

pub use subscription::{
    next_period_end, AssignSubscription, Enforcement, Subscription, SubscriptionStatus,
    TransitionError, UnknownVariant,
};
pub use transaction::{HoursTransaction, ListTransactionsFilter, NewTransaction, TransactionKind};
