use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> plan tiers,subscription rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> PlanTier {
        match raw {
            "premium" => PlanTier::Premium,
            _ => PlanTier::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Expired,
    Trialing,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Trialing => "trialing",
        }
    }
}

/// Statuses whose row is authoritative for the user's plan and limit.
pub const GOVERNING_STATUSES: [&str; 3] = ["active", "trialing", "past_due"];

/// key: billing-subscription-model -> one governing row per user
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: i32,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub plan: String,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn tier(&self) -> PlanTier {
        PlanTier::parse(&self.plan)
    }

    pub fn is_governing(&self) -> bool {
        GOVERNING_STATUSES.contains(&self.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plan_defaults_to_free() {
        assert_eq!(PlanTier::parse("premium"), PlanTier::Premium);
        assert_eq!(PlanTier::parse("enterprise"), PlanTier::Free);
        assert_eq!(PlanTier::parse(""), PlanTier::Free);
    }

    #[test]
    fn governing_statuses_cover_past_due() {
        assert!(GOVERNING_STATUSES.contains(&"past_due"));
        assert!(!GOVERNING_STATUSES.contains(&"cancelled"));
        assert!(!GOVERNING_STATUSES.contains(&"expired"));
    }
}
