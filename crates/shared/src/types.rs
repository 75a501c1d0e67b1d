//! Core billing domain types
//!
//! Status enums are stored as TEXT in Postgres; `Display`/`FromStr` define the
//! canonical wire strings. State-machine legality lives here so every writer
//! (synchronous path, webhook path, worker sweep) shares one set of rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Date, Duration, OffsetDateTime};

use crate::error::ForgeError;

/// Lifecycle of a money-movement attempt.
///
/// PROCESSING is the only non-terminal state. A transaction transitions to
/// exactly one terminal state, exactly once; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Processing,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Processing)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (
                TransactionStatus::Processing,
                TransactionStatus::Success | TransactionStatus::Failed
            )
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "SUCCESS" => Ok(TransactionStatus::Success),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(ForgeError::Validation(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }
}

/// What a transaction pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    SubscriptionPayment,
    WalletTopup,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::SubscriptionPayment => "SUBSCRIPTION_PAYMENT",
            TransactionType::WalletTopup => "WALLET_TOPUP",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBSCRIPTION_PAYMENT" => Ok(TransactionType::SubscriptionPayment),
            "WALLET_TOPUP" => Ok(TransactionType::WalletTopup),
            other => Err(ForgeError::Validation(format!(
                "unknown transaction type: {other}"
            ))),
        }
    }
}

/// Subscription lifecycle.
///
/// CREATED rows exist between plan selection and the first successful payment.
/// CANCELED is terminal for the record; re-subscription creates a new row.
/// TRIAL appears only on the user projection (`users.subscription_status`),
/// never on a subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trial,
    Created,
    Active,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "TRIAL",
            SubscriptionStatus::Created => "CREATED",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRIAL" => Ok(SubscriptionStatus::Trial),
            "CREATED" => Ok(SubscriptionStatus::Created),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "CANCELED" => Ok(SubscriptionStatus::Canceled),
            other => Err(ForgeError::Validation(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }
}

/// Why a billing-history row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    SubscriptionPayment,
    SubscriptionRenewal,
}

impl BillingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingReason::SubscriptionPayment => "subscription_payment",
            BillingReason::SubscriptionRenewal => "subscription_renewal",
        }
    }
}

impl fmt::Display for BillingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment instrument categories the gateway distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethodKind {
    Upi,
    Card,
    Netbanking,
    Wallet,
}

impl PaymentMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodKind::Upi => "UPI",
            PaymentMethodKind::Card => "CARD",
            PaymentMethodKind::Netbanking => "NETBANKING",
            PaymentMethodKind::Wallet => "WALLET",
        }
    }
}

impl fmt::Display for PaymentMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethodKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPI" => Ok(PaymentMethodKind::Upi),
            "CARD" => Ok(PaymentMethodKind::Card),
            "NETBANKING" => Ok(PaymentMethodKind::Netbanking),
            "WALLET" => Ok(PaymentMethodKind::Wallet),
            other => Err(ForgeError::Validation(format!(
                "unknown payment method kind: {other}"
            ))),
        }
    }
}

/// Billing cycle granularity of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanInterval {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl PlanInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanInterval::Daily => "DAILY",
            PlanInterval::Weekly => "WEEKLY",
            PlanInterval::Monthly => "MONTHLY",
            PlanInterval::Yearly => "YEARLY",
        }
    }

    /// Advance `start` by `count` intervals, calendar-aware.
    ///
    /// Month and year steps clamp to the last day of the target month
    /// (Jan 31 + 1 month = Feb 28/29), so a period started at month-end stays
    /// at month-end instead of drifting into the next month.
    pub fn advance(&self, start: OffsetDateTime, count: u32) -> OffsetDateTime {
        match self {
            PlanInterval::Daily => start + Duration::days(i64::from(count)),
            PlanInterval::Weekly => start + Duration::weeks(i64::from(count)),
            PlanInterval::Monthly => add_months(start, count),
            PlanInterval::Yearly => add_months(start, count * 12),
        }
    }
}

impl fmt::Display for PlanInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PlanInterval {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(PlanInterval::Daily),
            "WEEKLY" => Ok(PlanInterval::Weekly),
            "MONTHLY" => Ok(PlanInterval::Monthly),
            "YEARLY" => Ok(PlanInterval::Yearly),
            other => Err(ForgeError::Validation(format!(
                "unknown plan interval: {other}"
            ))),
        }
    }
}

fn add_months(dt: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = dt.date();
    let total = date.month() as u32 - 1 + months;
    let year = date.year() + (total / 12) as i32;
    let month = date.month().nth_next((months % 12) as u8);
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(d) => dt.replace_date(d),
        // Unreachable with a clamped day; keep the input rather than panic
        Err(_) => dt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_transaction_status_terminality() {
        assert!(!TransactionStatus::Processing.is_terminal());
        assert!(TransactionStatus::Success.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_transaction_status_transitions() {
        use TransactionStatus::*;
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(Failed));
        // Terminal states never move, in either direction
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Success.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TransactionStatus::Processing,
            TransactionStatus::Success,
            TransactionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        for status in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Created,
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(
                status.as_str().parse::<SubscriptionStatus>().unwrap(),
                status
            );
        }
        assert!("SETTLED".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_billing_reason_strings() {
        assert_eq!(
            BillingReason::SubscriptionPayment.to_string(),
            "subscription_payment"
        );
        assert_eq!(
            BillingReason::SubscriptionRenewal.to_string(),
            "subscription_renewal"
        );
    }

    #[test]
    fn test_monthly_advance() {
        let start = datetime!(2026-01-15 10:30 UTC);
        let end = PlanInterval::Monthly.advance(start, 1);
        assert_eq!(end, datetime!(2026-02-15 10:30 UTC));
    }

    #[test]
    fn test_monthly_advance_clamps_month_end() {
        let start = datetime!(2026-01-31 00:00 UTC);
        assert_eq!(
            PlanInterval::Monthly.advance(start, 1),
            datetime!(2026-02-28 00:00 UTC)
        );
        // Leap year
        let start = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(
            PlanInterval::Monthly.advance(start, 1),
            datetime!(2024-02-29 00:00 UTC)
        );
    }

    #[test]
    fn test_monthly_advance_crosses_year() {
        let start = datetime!(2026-11-10 00:00 UTC);
        assert_eq!(
            PlanInterval::Monthly.advance(start, 3),
            datetime!(2027-02-10 00:00 UTC)
        );
    }

    #[test]
    fn test_yearly_and_interval_count() {
        let start = datetime!(2026-03-01 00:00 UTC);
        assert_eq!(
            PlanInterval::Yearly.advance(start, 2),
            datetime!(2028-03-01 00:00 UTC)
        );
        // currentPeriodEnd - currentPeriodStart == interval * intervalCount
        let weekly = PlanInterval::Weekly.advance(start, 4);
        assert_eq!(weekly - start, Duration::weeks(4));
        let daily = PlanInterval::Daily.advance(start, 30);
        assert_eq!(daily - start, Duration::days(30));
    }
}
