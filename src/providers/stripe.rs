//! Card network adapter (Stripe).
//!
//! Outbound calls go straight to the HTTP API with form encoding - no SDK
//! crate. Webhook events are named lifecycle notifications signed with a
//! shared secret (`t=<ts>,v1=<hmac>` header) verified with replay
//! tolerance before anything touches the ledger.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::StripeConfig;
use crate::db::queries;
use crate::error::{AppError, Result};
use crate::ledger;
use crate::models::{
    NewTransaction, PaymentMethodKind, ProviderName, SubscriptionStatus, TransactionKind,
    TransactionStatus,
};

use super::{
    net_error, CreatePaymentMethodRequest, CreateSubscriptionRequest, PaymentMethodOutcome,
    PaymentOutcome, PaymentProvider, ProcessPaymentRequest, SubscriptionOutcome,
    UpdatePaymentMethodRequest, UpdateSubscriptionRequest, WebhookReply,
};

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.stripe.com/v1";

#[derive(Debug, Clone)]
pub struct StripeProvider {
    client: Client,
    secret_key: String,
    webhook_secret: String,
}

// ============ API response types ============

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    customer: Option<String>,
    items: Option<StripeItemList>,
}

#[derive(Debug, Deserialize)]
struct StripeItemList {
    data: Vec<StripeItem>,
}

#[derive(Debug, Deserialize)]
struct StripeItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    id: String,
    card: Option<StripeCard>,
}

#[derive(Debug, Deserialize)]
struct StripeCard {
    brand: Option<String>,
    last4: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

// ============ Webhook event types ============

/// Generic webhook event - object is parsed based on event_type
#[derive(Debug, Deserialize)]
pub struct StripeWebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    subscription: Option<String>,
    amount_paid: Option<i64>,
    amount_due: Option<i64>,
    currency: Option<String>,
    period_end: Option<i64>,
}

/// Webhook acknowledgment body. Stripe only inspects the HTTP status, but
/// the body documents the decision (and echoes the event object) for
/// delivery logs.
#[derive(Debug, Serialize)]
struct StripeAck {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StripeAck {
    fn ok(action: &str, data: Option<&serde_json::Value>) -> WebhookReply {
        WebhookReply::json(StripeAck {
            success: true,
            action: Some(action.to_string()),
            data: data.cloned(),
            error: None,
        })
    }

    fn err(message: &str) -> WebhookReply {
        WebhookReply::json(StripeAck {
            success: false,
            action: None,
            data: None,
            error: Some(message.to_string()),
        })
    }
}

fn map_subscription_status(status: &str) -> SubscriptionStatus {
    match status {
        "active" | "trialing" => SubscriptionStatus::Active,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Pending,
    }
}

impl StripeProvider {
    pub fn new(config: &StripeConfig, timeout_secs: u64) -> Self {
        Self {
            client: super::http_client(timeout_secs),
            secret_key: config.secret_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }

    /// POST a form to the API and parse the response, turning declines
    /// (HTTP 402) into bad requests and everything else non-2xx into
    /// upstream errors.
    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{}", API_BASE, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(form)
            .send()
            .await
            .map_err(|e| net_error(ProviderName::Stripe, path, e))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| net_error(ProviderName::Stripe, path, e))?;

        if !status.is_success() {
            let message = serde_json::from_value::<StripeErrorBody>(body.clone())
                .ok()
                .and_then(|b| b.error.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            if status.as_u16() == 402 {
                return Err(AppError::BadRequest(format!("card declined: {}", message)));
            }
            return Err(AppError::Upstream(format!("stripe {}: {}", path, message)));
        }

        Ok(body)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}{}", API_BASE, path))
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| net_error(ProviderName::Stripe, path, e))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| net_error(ProviderName::Stripe, path, e))?;

        if status.as_u16() == 404 {
            return Err(AppError::NotFound(format!("stripe resource {}", path)));
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!("stripe {}: HTTP {}", path, status)));
        }
        Ok(body)
    }

    /// Use the cached remote customer if the user has one, otherwise
    /// create it. The caller persists the returned id on the user row.
    async fn get_or_create_customer(&self, req: &CreateSubscriptionRequest) -> Result<String> {
        if let Some(ref customer_id) = req.user.stripe_customer_id {
            return Ok(customer_id.clone());
        }

        let body = self
            .post_form(
                "/customers",
                &[
                    ("email", req.user.email.clone()),
                    ("name", req.user.name.clone()),
                    ("metadata[user_id]", req.user.id.clone()),
                ],
            )
            .await?;
        let customer: StripeCustomer = serde_json::from_value(body)?;
        Ok(customer.id)
    }

    fn subscription_outcome(
        raw: serde_json::Value,
        customer_id: Option<String>,
    ) -> Result<SubscriptionOutcome> {
        let subscription: StripeSubscription = serde_json::from_value(raw.clone())?;
        Ok(SubscriptionOutcome {
            provider_subscription_id: subscription.id,
            status: map_subscription_status(&subscription.status),
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            checkout_url: None,
            customer_id: customer_id.or(subscription.customer),
            amount: None,
            raw,
        })
    }

    // ============ Webhook event handlers ============

    /// Sync a remote subscription lifecycle notification onto the local
    /// subscription row, if we have one.
    fn sync_subscription(&self, conn: &Connection, object: &serde_json::Value) -> WebhookReply {
        let remote: SubscriptionObject = match serde_json::from_value(object.clone()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("stripe webhook: invalid subscription object: {}", e);
                return StripeAck::err("Invalid subscription object");
            }
        };

        match queries::get_subscription_by_provider_id(conn, ProviderName::Stripe, &remote.id) {
            Ok(Some(local)) => {
                let status = map_subscription_status(&remote.status);
                if let Err(e) = queries::set_subscription_status(conn, &local.id, status) {
                    tracing::error!("stripe webhook: failed to sync subscription: {}", e);
                    return StripeAck::err("Internal error");
                }
                if let (Some(start), Some(end)) =
                    (remote.current_period_start, remote.current_period_end)
                {
                    if status == SubscriptionStatus::Active {
                        if let Err(e) =
                            queries::extend_subscription_period(conn, &local.id, start, end, None)
                        {
                            tracing::error!("stripe webhook: failed to sync period: {}", e);
                            return StripeAck::err("Internal error");
                        }
                    }
                }
                StripeAck::ok("subscription_synced", Some(object))
            }
            Ok(None) => {
                // Not ours (or not yet recorded) - acknowledged as-is.
                tracing::warn!("stripe webhook: unknown subscription {}", remote.id);
                StripeAck::ok("subscription_unknown", None)
            }
            Err(e) => {
                tracing::error!("stripe webhook: db error: {}", e);
                StripeAck::err("Internal error")
            }
        }
    }

    fn subscription_deleted(&self, conn: &Connection, object: &serde_json::Value) -> WebhookReply {
        let remote: SubscriptionObject = match serde_json::from_value(object.clone()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("stripe webhook: invalid subscription object: {}", e);
                return StripeAck::err("Invalid subscription object");
            }
        };

        match queries::get_subscription_by_provider_id(conn, ProviderName::Stripe, &remote.id) {
            Ok(Some(local)) => match queries::cancel_subscription(conn, &local.id) {
                Ok(()) => {
                    tracing::info!(
                        subscription_id = %local.id,
                        "stripe webhook: subscription canceled"
                    );
                    StripeAck::ok("subscription_canceled", Some(object))
                }
                Err(e) => {
                    tracing::error!("stripe webhook: failed to cancel subscription: {}", e);
                    StripeAck::err("Internal error")
                }
            },
            Ok(None) => StripeAck::ok("subscription_unknown", None),
            Err(e) => {
                tracing::error!("stripe webhook: db error: {}", e);
                StripeAck::err("Internal error")
            }
        }
    }

    /// Invoice settlement drives the ledger: record a transaction keyed by
    /// the invoice id, move it to its terminal state, and on success let
    /// the activator extend the subscription period.
    fn invoice_event(
        &self,
        conn: &mut Connection,
        object: &serde_json::Value,
        paid: bool,
    ) -> WebhookReply {
        let invoice: InvoiceObject = match serde_json::from_value(object.clone()) {
            Ok(i) => i,
            Err(e) => {
                tracing::error!("stripe webhook: invalid invoice object: {}", e);
                return StripeAck::err("Invalid invoice object");
            }
        };

        let subscription_id = match invoice.subscription {
            Some(ref id) => id.clone(),
            None => return StripeAck::err("Invoice has no subscription"),
        };

        let local = match queries::get_subscription_by_provider_id(
            conn,
            ProviderName::Stripe,
            &subscription_id,
        ) {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::warn!(
                    "stripe webhook: no local subscription for invoice {} ({})",
                    invoice.id,
                    subscription_id
                );
                return StripeAck::err("No subscription for invoice");
            }
            Err(e) => {
                tracing::error!("stripe webhook: db error: {}", e);
                return StripeAck::err("Internal error");
            }
        };

        let amount = invoice.amount_paid.or(invoice.amount_due).unwrap_or(0);
        let input = NewTransaction {
            user_id: local.user_id.clone(),
            provider: ProviderName::Stripe,
            provider_transaction_id: invoice.id.clone(),
            kind: TransactionKind::Subscription,
            amount,
            currency: invoice.currency.clone().unwrap_or_else(|| "usd".to_string()),
            provider_data: Some(object.clone()),
        };

        if let Err(e) = ledger::record(conn, &input) {
            tracing::error!("stripe webhook: failed to record invoice {}: {}", invoice.id, e);
            return StripeAck::err("Internal error");
        }

        let target = if paid {
            TransactionStatus::Succeeded
        } else {
            TransactionStatus::Failed
        };
        let reason = (!paid).then(|| "invoice payment failed");

        let txn = match ledger::transition(
            conn,
            ProviderName::Stripe,
            &invoice.id,
            target,
            reason,
            Some(object),
        ) {
            Ok(ledger::TransitionOutcome::Applied(t)) => t,
            Ok(ledger::TransitionOutcome::AlreadyProcessed(_)) => {
                return StripeAck::ok("already_processed", None);
            }
            Ok(ledger::TransitionOutcome::NotFound) => {
                // Recorded above; can only happen if the row vanished.
                tracing::error!("stripe webhook: invoice row {} disappeared", invoice.id);
                return StripeAck::err("Internal error");
            }
            Err(AppError::Conflict(msg)) => {
                tracing::warn!("stripe webhook: {}", msg);
                return StripeAck::err("Transaction already finalized");
            }
            Err(e) => {
                tracing::error!("stripe webhook: transition failed: {}", e);
                return StripeAck::err("Internal error");
            }
        };

        if paid {
            match ledger::activate_for(
                conn,
                &txn,
                &local.user_id,
                &local.plan_id,
                &subscription_id,
                invoice.period_end,
            ) {
                Ok(_) => StripeAck::ok("invoice_payment_succeeded", Some(object)),
                Err(e) => {
                    tracing::error!("stripe webhook: activation failed: {}", e);
                    StripeAck::err("Internal error")
                }
            }
        } else {
            if let Err(e) =
                queries::set_subscription_status(conn, &local.id, SubscriptionStatus::PastDue)
            {
                tracing::error!("stripe webhook: failed to mark past_due: {}", e);
                return StripeAck::err("Internal error");
            }
            StripeAck::ok("invoice_payment_failed", Some(object))
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Stripe
    }

    async fn create_subscription(
        &self,
        req: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome> {
        let price_id = req.stripe_price_id.clone().ok_or_else(|| {
            AppError::BadRequest("plan has no card-network price configured".into())
        })?;

        let customer_id = self.get_or_create_customer(req).await.map_err(|e| {
            tracing::error!(user_id = %req.user.id, "stripe customer creation failed: {}", e);
            e
        })?;

        let mut form = vec![
            ("customer", customer_id.clone()),
            ("items[0][price]", price_id),
            ("metadata[user_id]", req.user.id.clone()),
            ("metadata[plan_id]", req.plan_id.clone()),
        ];
        if let Some(ref pm) = req.payment_method_id {
            form.push(("default_payment_method", pm.clone()));
        }
        if let Some(days) = req.trial_days {
            form.push(("trial_period_days", days.to_string()));
        }

        let body = self.post_form("/subscriptions", &form).await.map_err(|e| {
            tracing::error!(
                user_id = %req.user.id,
                plan_id = %req.plan_id,
                "stripe subscription creation failed: {}",
                e
            );
            e
        })?;

        Self::subscription_outcome(body, Some(customer_id))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        req: &UpdateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome> {
        if let Some(ref price_id) = req.stripe_price_id {
            // Price swaps replace the single subscription item in place.
            let current = self
                .get_json(&format!("/subscriptions/{}", subscription_id))
                .await?;
            let current: StripeSubscription = serde_json::from_value(current)?;
            let item_id = current
                .items
                .and_then(|items| items.data.into_iter().next())
                .map(|item| item.id)
                .ok_or_else(|| {
                    AppError::Upstream(format!("subscription {} has no items", subscription_id))
                })?;

            let proration = req
                .proration_behavior
                .clone()
                .unwrap_or_else(|| "create_prorations".to_string());

            self.post_form(
                &format!("/subscriptions/{}", subscription_id),
                &[
                    ("items[0][id]", item_id),
                    ("items[0][price]", price_id.clone()),
                    ("proration_behavior", proration),
                ],
            )
            .await?;
        }

        if let Some(ref pm) = req.payment_method_id {
            self.post_form(
                &format!("/subscriptions/{}", subscription_id),
                &[("default_payment_method", pm.clone())],
            )
            .await?;
        }

        // Re-read for the authoritative post-update state.
        let body = self
            .get_json(&format!("/subscriptions/{}", subscription_id))
            .await?;
        Self::subscription_outcome(body, None)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool> {
        // Cancel at period end - the user keeps what they paid for.
        match self
            .post_form(
                &format!("/subscriptions/{}", subscription_id),
                &[("cancel_at_period_end", "true".to_string())],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    "stripe subscription cancellation failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionOutcome> {
        let body = self
            .get_json(&format!("/subscriptions/{}", subscription_id))
            .await?;
        Self::subscription_outcome(body, None)
    }

    async fn process_payment(&self, req: &ProcessPaymentRequest) -> Result<PaymentOutcome> {
        let mut form = vec![
            ("amount", req.amount.to_string()),
            ("currency", req.currency.to_lowercase()),
            ("confirm", "true".to_string()),
            ("metadata[user_id]", req.user_id.clone()),
        ];
        if let Some(ref customer) = req.customer_id {
            form.push(("customer", customer.clone()));
        }
        if let Some(ref pm) = req.payment_method_id {
            form.push(("payment_method", pm.clone()));
        }
        if let Some(ref description) = req.description {
            form.push(("description", description.clone()));
        }

        let body = self.post_form("/payment_intents", &form).await.map_err(|e| {
            tracing::error!(
                user_id = %req.user_id,
                amount = req.amount,
                "stripe payment failed: {}",
                e
            );
            e
        })?;
        let intent: StripePaymentIntent = serde_json::from_value(body)?;

        let status = match intent.status.as_str() {
            "succeeded" => TransactionStatus::Succeeded,
            "canceled" => TransactionStatus::Failed,
            _ => TransactionStatus::Pending,
        };

        Ok(PaymentOutcome {
            provider_transaction_id: intent.id,
            status,
            amount: intent.amount,
            currency: intent.currency,
            checkout_url: None,
        })
    }

    async fn create_payment_method(
        &self,
        req: &CreatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome> {
        let token = req
            .token
            .clone()
            .ok_or_else(|| AppError::BadRequest("card token is required".into()))?;

        let body = self
            .post_form(
                "/payment_methods",
                &[("type", "card".to_string()), ("card[token]", token)],
            )
            .await?;
        let method: StripePaymentMethod = serde_json::from_value(body)?;

        if let Some(ref customer) = req.customer_id {
            self.post_form(
                &format!("/payment_methods/{}/attach", method.id),
                &[("customer", customer.clone())],
            )
            .await?;
        }

        let display = match method.card {
            Some(card) => format!(
                "{} ****{}",
                card.brand.unwrap_or_else(|| "Card".to_string()),
                card.last4.unwrap_or_default()
            ),
            None => "Card".to_string(),
        };

        Ok(PaymentMethodOutcome {
            payment_method_id: method.id,
            kind: PaymentMethodKind::Card,
            display,
        })
    }

    async fn update_payment_method(
        &self,
        payment_method_id: &str,
        req: &UpdatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome> {
        let mut form = Vec::new();
        if let Some(ref name) = req.billing_name {
            form.push(("billing_details[name]", name.clone()));
        }
        if let Some(ref email) = req.billing_email {
            form.push(("billing_details[email]", email.clone()));
        }
        if form.is_empty() {
            return Err(AppError::BadRequest("no billing details to update".into()));
        }

        let body = self
            .post_form(&format!("/payment_methods/{}", payment_method_id), &form)
            .await?;
        let method: StripePaymentMethod = serde_json::from_value(body)?;

        let display = match method.card {
            Some(card) => format!(
                "{} ****{}",
                card.brand.unwrap_or_else(|| "Card".to_string()),
                card.last4.unwrap_or_default()
            ),
            None => "Card".to_string(),
        };

        Ok(PaymentMethodOutcome {
            payment_method_id: method.id,
            kind: PaymentMethodKind::Card,
            display,
        })
    }

    async fn delete_payment_method(&self, payment_method_id: &str) -> Result<bool> {
        match self
            .post_form(&format!("/payment_methods/{}/detach", payment_method_id), &[])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::error!(
                    payment_method_id = %payment_method_id,
                    "stripe payment method detach failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Maximum age of a webhook timestamp before it's rejected (seconds).
    /// Stripe recommends 300 seconds (5 minutes).
    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> bool {
        const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

        // Signature format: t=timestamp,v1=signature
        let mut timestamp = None;
        let mut sig_v1 = None;
        for part in signature.split(',') {
            if let Some(t) = part.strip_prefix("t=") {
                timestamp = Some(t);
            } else if let Some(s) = part.strip_prefix("v1=") {
                sig_v1 = Some(s);
            }
        }

        let (timestamp_str, sig_v1) = match (timestamp, sig_v1) {
            (Some(t), Some(s)) => (t, s),
            _ => {
                tracing::debug!("stripe webhook: malformed signature header");
                return false;
            }
        };

        // Reject replays: webhooks outside the tolerance window fail even
        // with a valid digest.
        let timestamp: i64 = match timestamp_str.parse() {
            Ok(t) => t,
            Err(_) => return false,
        };
        let age = chrono::Utc::now().timestamp() - timestamp;
        if age > TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                "stripe webhook rejected: timestamp too old (age={}s, max={}s)",
                age,
                TIMESTAMP_TOLERANCE_SECS
            );
            return false;
        }
        // Also reject timestamps from the future (clock skew tolerance: 60s)
        if age < -60 {
            tracing::warn!("stripe webhook rejected: timestamp in the future (age={}s)", age);
            return false;
        }

        let signed_payload = format!("{}.{}", timestamp_str, String::from_utf8_lossy(body));
        let mut mac = match HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(signed_payload.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        // Constant-time comparison. The length check is not constant-time,
        // but signature length is not secret (always 64 hex chars).
        let expected = expected.as_bytes();
        let provided = sig_v1.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        expected.ct_eq(provided).into()
    }

    fn handle_webhook(&self, conn: &mut Connection, body: &[u8]) -> WebhookReply {
        let event: StripeWebhookEvent = match serde_json::from_slice(body) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!("stripe webhook: invalid JSON: {}", e);
                return StripeAck::err("Invalid JSON");
            }
        };

        match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.sync_subscription(conn, &event.data.object)
            }
            "customer.subscription.deleted" => self.subscription_deleted(conn, &event.data.object),
            "invoice.payment_succeeded" => self.invoice_event(conn, &event.data.object, true),
            "invoice.payment_failed" => self.invoice_event(conn, &event.data.object, false),
            other => {
                tracing::debug!("stripe webhook: unhandled event type {}", other);
                StripeAck::err("Unhandled event type")
            }
        }
    }
}
