use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{PlanTier, Subscription, SubscriptionStatus};

/// Typed view of the subscription object carried by provider events.
/// Timestamps arrive as unix seconds and are normalized here.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub status: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

/// key: billing-service -> subscription lifecycle
#[derive(Clone)]
pub struct BillingService {
    pool: PgPool,
}

impl BillingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The single row whose status currently governs the user's plan/limit.
    pub async fn governing_subscription(&self, user_id: i32) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing', 'past_due')
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE billing_subscription_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Record the provider customer id on the user's governing row so later
    /// webhook deliveries can be matched back.
    pub async fn attach_billing_customer(&self, user_id: i32, customer_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET billing_customer_id = $2, updated_at = NOW()
            WHERE user_id = $1 AND status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Promote a user to the given tier from a `subscription.created` or
    /// `checkout.completed` event. Upserts on the natural key first (the
    /// external subscription id), then falls back to updating the user's
    /// governing row in place, and only inserts when neither exists. This is
    /// what keeps re-delivered events idempotent and preserves the
    /// one-governing-row invariant.
    pub async fn promote_from_event(
        &self,
        user_id: i32,
        tier: PlanTier,
        patch: &SubscriptionPatch,
    ) -> Result<Subscription> {
        if let Some(external_id) = patch.billing_subscription_id.as_deref() {
            if let Some(existing) = self.find_by_external_id(external_id).await? {
                return self.apply_patch(existing.id, Some(tier), patch).await;
            }
        }

        if let Some(existing) = self.governing_subscription(user_id).await? {
            return self.apply_patch(existing.id, Some(tier), patch).await;
        }

        let row = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                id, user_id, billing_customer_id, billing_subscription_id,
                plan, status, current_period_start, current_period_end,
                cancel_at_period_end, trial_ends_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&patch.billing_customer_id)
        .bind(&patch.billing_subscription_id)
        .bind(tier.as_str())
        .bind(patch.status.as_deref().unwrap_or("active"))
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end.unwrap_or(false))
        .bind(patch.trial_ends_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Apply a `subscription.updated` event. The external subscription id is
    /// matched first; a stale local row for a user who re-subscribed under a
    /// new provider id is only reached through the user-id fallback.
    pub async fn update_from_event(
        &self,
        fallback_user_id: Option<i32>,
        patch: &SubscriptionPatch,
    ) -> Result<Option<Subscription>> {
        let target = match patch.billing_subscription_id.as_deref() {
            Some(external_id) => self.find_by_external_id(external_id).await?,
            None => None,
        };
        let target = match target {
            Some(row) => Some(row),
            None => match fallback_user_id {
                Some(user_id) => self.governing_subscription(user_id).await?,
                None => None,
            },
        };

        match target {
            Some(row) => Ok(Some(self.apply_patch(row.id, None, patch).await?)),
            None => Ok(None),
        }
    }

    /// Set a terminal or recovery status on the row matched by external id,
    /// falling back to the user's governing row.
    pub async fn transition_status(
        &self,
        external_id: Option<&str>,
        fallback_user_id: Option<i32>,
        status: SubscriptionStatus,
    ) -> Result<Option<Subscription>> {
        let patch = SubscriptionPatch {
            billing_subscription_id: external_id.map(str::to_string),
            status: Some(status.as_str().to_string()),
            ..Default::default()
        };
        self.update_from_event(fallback_user_id, &patch).await
    }

    /// Mirror the provider-side cancel-at-period-end flag after a synchronous
    /// cancellation request. The eventual `subscription.deleted` webhook is
    /// what actually ends the subscription.
    pub async fn mark_cancel_requested(&self, subscription_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        tier: Option<PlanTier>,
        patch: &SubscriptionPatch,
    ) -> Result<Subscription> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions SET
                plan = COALESCE($2, plan),
                status = COALESCE($3, status),
                billing_customer_id = COALESCE($4, billing_customer_id),
                billing_subscription_id = COALESCE($5, billing_subscription_id),
                current_period_start = COALESCE($6, current_period_start),
                current_period_end = COALESCE($7, current_period_end),
                cancel_at_period_end = COALESCE($8, cancel_at_period_end),
                trial_ends_at = COALESCE($9, trial_ends_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tier.map(|t| t.as_str()))
        .bind(&patch.status)
        .bind(&patch.billing_customer_id)
        .bind(&patch.billing_subscription_id)
        .bind(patch.current_period_start)
        .bind(patch.current_period_end)
        .bind(patch.cancel_at_period_end)
        .bind(patch.trial_ends_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}
