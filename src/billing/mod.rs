pub mod api;
pub mod models;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod webhook;

pub use api::{
    cancel_subscription, create_checkout_session, subscription_status, CancelResponse,
    CheckoutSessionResponse,
};
pub use models::{PlanTier, Subscription, SubscriptionStatus, GOVERNING_STATUSES};
pub use provider::{BillingProvider, CancellationOutcome, HttpBillingProvider, ProviderCustomer};
pub use scheduler::spawn as spawn_usage_scheduler;
pub use service::{BillingService, SubscriptionPatch};
pub use webhook::{billing_webhook, signature_header, verify_signature, BillingEvent};
