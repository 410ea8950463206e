use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Customer object as held by the billing provider. The `metadata` map is
/// where the local user id is attached at customer creation time.
#[derive(Debug, Clone)]
pub struct ProviderCustomer {
    pub id: String,
    pub metadata: Value,
}

impl ProviderCustomer {
    /// Local user id bound to this customer, if any was recorded.
    pub fn user_id(&self) -> Option<i32> {
        self.metadata
            .get("user_id")
            .and_then(|value| match value {
                Value::String(raw) => raw.parse::<i32>().ok(),
                Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
                _ => None,
            })
    }
}

#[derive(Debug, Clone)]
pub struct CancellationOutcome {
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<DateTime<Utc>>,
}

/// key: billing-adapter -> provider integration
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Authoritative fetch of the customer object. Webhook payload metadata is
    /// never trusted on its own; this call is the owner-resolution source.
    async fn fetch_customer(&self, customer_id: &str) -> Result<ProviderCustomer>;

    async fn create_customer(&self, user_id: i32, email: &str) -> Result<String>;

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        user_id: i32,
        price: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String>;

    async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<CancellationOutcome>;
}

/// HTTP adapter against a Stripe-style REST API. All requests inherit the
/// bounded timeout configured on the shared client.
pub struct HttpBillingProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpBillingProvider {
    pub fn new(client: reqwest::Client, api_base: &str, api_key: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn parse_ok(response: reqwest::Response, what: &str) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("billing provider {what} failed: {status} {body}"));
        }
        response
            .json::<Value>()
            .await
            .with_context(|| format!("billing provider {what} returned malformed body"))
    }
}

#[async_trait]
impl BillingProvider for HttpBillingProvider {
    async fn fetch_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
        let response = self
            .client
            .get(format!("{}/v1/customers/{customer_id}", self.api_base))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("billing provider unreachable")?;
        let body = Self::parse_ok(response, "customer fetch").await?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("customer object missing id"))?
            .to_string();
        let metadata = body.get("metadata").cloned().unwrap_or(Value::Null);
        Ok(ProviderCustomer { id, metadata })
    }

    async fn create_customer(&self, user_id: i32, email: &str) -> Result<String> {
        let user_ref = user_id.to_string();
        let response = self
            .client
            .post(format!("{}/v1/customers", self.api_base))
            .bearer_auth(&self.api_key)
            .form(&[("email", email), ("metadata[user_id]", user_ref.as_str())])
            .send()
            .await
            .context("billing provider unreachable")?;
        let body = Self::parse_ok(response, "customer creation").await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("created customer missing id"))
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        user_id: i32,
        price: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String> {
        let user_ref = user_id.to_string();
        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.api_key)
            .form(&[
                ("customer", customer_id),
                ("mode", "subscription"),
                ("line_items[0][price]", price),
                ("line_items[0][quantity]", "1"),
                ("success_url", success_url),
                ("cancel_url", cancel_url),
                ("metadata[user_id]", user_ref.as_str()),
            ])
            .send()
            .await
            .context("billing provider unreachable")?;
        let body = Self::parse_ok(response, "checkout session").await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("checkout session missing id"))
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<CancellationOutcome> {
        let response = self
            .client
            .post(format!(
                "{}/v1/subscriptions/{subscription_id}",
                self.api_base
            ))
            .bearer_auth(&self.api_key)
            .form(&[("cancel_at_period_end", "true")])
            .send()
            .await
            .context("billing provider unreachable")?;
        let body = Self::parse_ok(response, "cancellation").await?;
        let cancel_at = body
            .get("cancel_at")
            .and_then(Value::as_i64)
            .or_else(|| body.get("current_period_end").and_then(Value::as_i64))
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        Ok(CancellationOutcome {
            cancel_at_period_end: body
                .get("cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            cancel_at,
        })
    }
}
