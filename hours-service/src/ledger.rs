//! Hours ledger.
//!
//! Turns the raw facts persisted for a project (monthly allotment, usage this
//! period, rollover, purchased packs) into the authoritative available-hours
//! figure and its breakdown. Pure computation: no I/O, no rounding.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// Fractional digits an hour figure may carry once stored.
pub const HOURS_SCALE: u32 = 4;

/// Exclusive upper bound on the magnitude of any stored hour figure.
pub const HOURS_LIMIT: Decimal = Decimal::from_parts(100_000_000, 0, 0, false, 0);

/// Reject hour figures the store cannot hold exactly.
pub fn check_storable(field: &'static str, value: Decimal) -> Result<(), InvalidFactError> {
    if value.normalize().scale() > HOURS_SCALE {
        return Err(InvalidFactError {
            field,
            problem: FactProblem::TooPrecise,
        });
    }
    if value.abs() >= HOURS_LIMIT {
        return Err(InvalidFactError {
            field,
            problem: FactProblem::OutOfRange,
        });
    }
    Ok(())
}

/// Inputs to the ledger, gathered per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoursFacts {
    /// Hours granted per billing period by the active plan (0 without a plan).
    pub monthly_included: Decimal,
    /// Hours consumed against this period's allotment. May exceed `monthly_included`.
    pub monthly_used: Decimal,
    /// Hours carried over from prior periods, already capped.
    pub rollover_total: Decimal,
    /// Purchased pack hours, not tied to any period.
    pub pack_hours_total: Decimal,
    pub is_unlimited: bool,
}

impl HoursFacts {
    /// Build facts from floating-point figures, rejecting non-finite values.
    pub fn from_f64(
        monthly_included: f64,
        monthly_used: f64,
        rollover_total: f64,
        pack_hours_total: f64,
        is_unlimited: bool,
    ) -> Result<Self, InvalidFactError> {
        Ok(Self {
            monthly_included: checked_decimal("monthly_included", monthly_included)?,
            monthly_used: checked_decimal("monthly_used", monthly_used)?,
            rollover_total: checked_decimal("rollover_total", rollover_total)?,
            pack_hours_total: checked_decimal("pack_hours_total", pack_hours_total)?,
            is_unlimited,
        })
    }

    fn validate(&self) -> Result<(), InvalidFactError> {
        for (field, value) in [
            ("monthly_included", self.monthly_included),
            ("monthly_used", self.monthly_used),
            ("rollover_total", self.rollover_total),
            ("pack_hours_total", self.pack_hours_total),
        ] {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(InvalidFactError {
                    field,
                    problem: FactProblem::Negative(value),
                });
            }
        }
        Ok(())
    }
}

fn checked_decimal(field: &'static str, value: f64) -> Result<Decimal, InvalidFactError> {
    if !value.is_finite() {
        return Err(InvalidFactError {
            field,
            problem: FactProblem::NonFinite,
        });
    }
    let decimal = Decimal::from_f64(value).ok_or(InvalidFactError {
        field,
        problem: FactProblem::OutOfRange,
    })?;
    if decimal.is_sign_negative() && !decimal.is_zero() {
        return Err(InvalidFactError {
            field,
            problem: FactProblem::Negative(decimal),
        });
    }
    Ok(decimal)
}

/// What is wrong with a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactProblem {
    Negative(Decimal),
    NonFinite,
    OutOfRange,
    TooPrecise,
}

impl std::fmt::Display for FactProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactProblem::Negative(value) => write!(f, "must not be negative, got {}", value),
            FactProblem::NonFinite => write!(f, "must be a finite number"),
            FactProblem::OutOfRange => write!(f, "is out of range"),
            FactProblem::TooPrecise => {
                write!(f, "must have at most {} decimal places", HOURS_SCALE)
            }
        }
    }
}

/// Malformed input to the ledger. Always a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid hours fact `{field}`: {problem}")]
pub struct InvalidFactError {
    pub field: &'static str,
    pub problem: FactProblem,
}

/// Available hours: a finite quantity or the explicit unlimited marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Hours(Decimal),
    Unlimited,
}

impl Availability {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Availability::Unlimited)
    }

    /// Whether `cost` hours fit in what is available.
    pub fn covers(&self, cost: Decimal) -> bool {
        match self {
            Availability::Hours(available) => cost <= *available,
            Availability::Unlimited => true,
        }
    }

    pub fn hours(&self) -> Option<Decimal> {
        match self {
            Availability::Hours(hours) => Some(*hours),
            Availability::Unlimited => None,
        }
    }
}

/// Derived balance for a project. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoursBalance {
    pub monthly_included: Decimal,
    pub monthly_used: Decimal,
    pub monthly_remaining: Decimal,
    pub rollover_total: Decimal,
    pub pack_hours_total: Decimal,
    pub total_available: Availability,
}

impl HoursBalance {
    pub fn is_unlimited(&self) -> bool {
        self.total_available.is_unlimited()
    }
}

/// Compute the balance for a project from its facts.
pub fn compute_balance(facts: &HoursFacts) -> Result<HoursBalance, InvalidFactError> {
    facts.validate()?;

    // Both sides are non-negative, so the difference cannot overflow
    let monthly_remaining = (facts.monthly_included - facts.monthly_used).max(Decimal::ZERO);

    let total_available = if facts.is_unlimited {
        Availability::Unlimited
    } else {
        let total = monthly_remaining
            .checked_add(facts.rollover_total)
            .ok_or(out_of_range("rollover_total"))?
            .checked_add(facts.pack_hours_total)
            .ok_or(out_of_range("pack_hours_total"))?;
        Availability::Hours(total)
    };

    Ok(HoursBalance {
        monthly_included: facts.monthly_included,
        monthly_used: facts.monthly_used,
        monthly_remaining,
        rollover_total: facts.rollover_total,
        pack_hours_total: facts.pack_hours_total,
        total_available,
    })
}

fn out_of_range(field: &'static str) -> InvalidFactError {
    InvalidFactError {
        field,
        problem: FactProblem::OutOfRange,
    }
}

/// How an accepted cost splits across the hour buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Drawdown {
    /// Added to `monthly_used`.
    pub monthly: Decimal,
    /// Removed from rollover.
    pub rollover: Decimal,
    /// Removed from pack hours.
    pub pack: Decimal,
}

impl Drawdown {
    pub fn total(&self) -> Decimal {
        self.monthly + self.rollover + self.pack
    }

    pub fn is_zero(&self) -> bool {
        self.total().is_zero()
    }
}

/// Split `cost` across buckets: monthly remaining, then rollover, then packs.
///
/// Unlimited balances draw nothing. Callers only plan a draw-down for costs
/// the balance covers; any excess beyond the three buckets is not drawn.
pub fn plan_drawdown(balance: &HoursBalance, cost: Decimal) -> Drawdown {
    if balance.is_unlimited() || cost <= Decimal::ZERO {
        return Drawdown::default();
    }

    let monthly = cost.min(balance.monthly_remaining);
    let left = cost - monthly;
    let rollover = left.min(balance.rollover_total);
    let left = left - rollover;
    let pack = left.min(balance.pack_hours_total);

    Drawdown {
        monthly,
        rollover,
        pack,
    }
}
