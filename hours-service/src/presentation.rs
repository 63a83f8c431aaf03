//! Display helpers for dashboard cards and gauges.
//!
//! Read-only over ledger output; no arithmetic beyond rounding for display.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::ledger::{Availability, HoursBalance};

pub const UNLIMITED_SYMBOL: &str = "∞";

/// Render hours as `"2h 30m"`, rounded to the nearest minute.
pub fn format_hours(hours: Decimal) -> String {
    let minutes = (hours.abs() * Decimal::from(60))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64();

    let Some(minutes) = minutes else {
        return format!("{}h", hours.normalize());
    };

    let sign = if hours.is_sign_negative() && minutes > 0 {
        "-"
    } else {
        ""
    };
    let (h, m) = (minutes / 60, minutes % 60);

    match (h, m) {
        (0, 0) => "0h".to_string(),
        (h, 0) => format!("{}{}h", sign, h),
        (0, m) => format!("{}{}m", sign, m),
        (h, m) => format!("{}{}h {}m", sign, h, m),
    }
}

pub fn format_availability(availability: &Availability) -> String {
    match availability {
        Availability::Hours(hours) => format_hours(*hours),
        Availability::Unlimited => UNLIMITED_SYMBOL.to_string(),
    }
}

/// Pre-rendered balance for a dashboard card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    pub monthly_remaining: String,
    pub monthly_used: String,
    pub monthly_included: String,
    pub rollover_total: String,
    pub pack_hours_total: String,
    pub total_available: String,
    pub is_unlimited: bool,
}

impl From<&HoursBalance> for BalanceView {
    fn from(balance: &HoursBalance) -> Self {
        Self {
            monthly_remaining: format_hours(balance.monthly_remaining),
            monthly_used: format_hours(balance.monthly_used),
            monthly_included: format_hours(balance.monthly_included),
            rollover_total: format_hours(balance.rollover_total),
            pack_hours_total: format_hours(balance.pack_hours_total),
            total_available: format_availability(&balance.total_available),
            is_unlimited: balance.is_unlimited(),
        }
    }
}
