//! The provider abstraction: one trait every payment network adapter
//! satisfies, plus the registry the call sites dispatch through.

mod click;
mod payme;
mod stripe;

pub use click::ClickProvider;
pub use payme::PaymeProvider;
pub use stripe::StripeProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{PaymentMethodKind, ProviderName, SubscriptionStatus, TransactionStatus, User};

/// Everything an adapter needs to open a subscription with its network.
/// The orchestration layer resolves users and pricing before dispatch so
/// adapters never touch the store on the outbound path.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub user: User,
    pub plan_id: String,
    pub plan_name: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    /// Card-network price item (price_xxx), when the plan has one
    pub stripe_price_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub trial_days: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSubscriptionRequest {
    /// Swap the subscription onto a different price item
    pub stripe_price_id: Option<String>,
    /// Proration behavior for price swaps (card network vocabulary)
    pub proration_behavior: Option<String>,
    /// Change the default payment method
    pub payment_method_id: Option<String>,
}

/// Authoritative remote state of a subscription after an outbound call.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionOutcome {
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    /// Redirect for networks that collect payment on their own page
    pub checkout_url: Option<String>,
    /// Remote customer id for the caller to cache on the user row
    pub customer_id: Option<String>,
    /// Minor currency units, when the network reports one
    pub amount: Option<i64>,
    /// Raw provider payload, stored opaque in subscription metadata
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ProcessPaymentRequest {
    pub user_id: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub payment_method_id: Option<String>,
    pub customer_id: Option<String>,
    pub phone: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub provider_transaction_id: String,
    pub status: TransactionStatus,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePaymentMethodRequest {
    pub user_id: String,
    /// Card networks: tokenized card or raw PAN + expiry
    pub token: Option<String>,
    pub card_number: Option<String>,
    /// YYMM
    pub expire: Option<String>,
    pub customer_id: Option<String>,
    /// Phone-based networks
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePaymentMethodRequest {
    pub billing_name: Option<String>,
    pub billing_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodOutcome {
    pub payment_method_id: String,
    pub kind: PaymentMethodKind,
    /// Masked display representation
    pub display: String,
}

/// Response body for a webhook delivery.
///
/// Each network defines its own error vocabulary and expects it in the
/// body of an HTTP 200 - the reply body IS the adapter's contract with
/// the network, so it is carried opaquely here and serialized as-is.
#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub body: serde_json::Value,
}

impl WebhookReply {
    pub fn json<T: Serialize>(body: T) -> Self {
        Self {
            body: serde_json::to_value(body).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Contract every payment network adapter implements.
///
/// Outbound operations are single synchronous attempts with a bounded
/// timeout - retry policy belongs to the caller. Adapters never leak raw
/// transport errors: failures come back as `AppError::Upstream` (network,
/// timeout) or structured declines.
///
/// `verify_webhook_signature` MUST be checked before `handle_webhook` is
/// allowed to mutate anything.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    async fn create_subscription(
        &self,
        req: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        req: &UpdateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome>;

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool>;

    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionOutcome>;

    async fn process_payment(&self, req: &ProcessPaymentRequest) -> Result<PaymentOutcome>;

    async fn create_payment_method(
        &self,
        req: &CreatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome>;

    async fn update_payment_method(
        &self,
        payment_method_id: &str,
        req: &UpdatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome>;

    async fn delete_payment_method(&self, payment_method_id: &str) -> Result<bool>;

    /// Constant-time verification of the delivery's signature material.
    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> bool;

    /// Process a verified webhook delivery against the ledger and return
    /// the network's reply body. Synchronous by design: the handler either
    /// completes and replies, or the network redelivers later and the
    /// ledger's idempotency absorbs the replay.
    fn handle_webhook(&self, conn: &mut Connection, body: &[u8]) -> WebhookReply;
}

/// Map a reqwest failure to an upstream error, keeping timeouts
/// distinguishable from other transport failures.
pub(crate) fn net_error(provider: ProviderName, op: &str, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Upstream(format!("{} {} timed out", provider, op))
    } else {
        AppError::Upstream(format!("{} {} failed: {}", provider, op, err))
    }
}

/// Build the shared outbound HTTP client with the mandatory bounded timeout.
pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// All three adapters, constructed once from config. Dispatch at call
/// sites is a lookup keyed by provider name.
pub struct ProviderRegistry {
    stripe: Arc<StripeProvider>,
    payme: Arc<PaymeProvider>,
    click: Arc<ClickProvider>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.provider_timeout_secs;
        Self {
            stripe: Arc::new(StripeProvider::new(&config.stripe, timeout)),
            payme: Arc::new(PaymeProvider::new(&config.payme, timeout)),
            click: Arc::new(ClickProvider::new(&config.click, timeout)),
        }
    }

    pub fn get(&self, name: ProviderName) -> Arc<dyn PaymentProvider> {
        match name {
            ProviderName::Stripe => self.stripe.clone(),
            ProviderName::Payme => self.payme.clone(),
            ProviderName::Click => self.click.clone(),
        }
    }

    /// Networks available for a given country. The mobile-money networks
    /// only operate in Uzbekistan; the card network is global.
    pub fn available_for_country(country_code: &str) -> Vec<ProviderName> {
        if country_code.eq_ignore_ascii_case("UZ") {
            vec![ProviderName::Payme, ProviderName::Click, ProviderName::Stripe]
        } else {
            vec![ProviderName::Stripe]
        }
    }
}
