//! Mobile-money adapter B (Click).
//!
//! The webhook is a two-phase flow: prepare (action 0) asks whether we can
//! accept the payment and creates the pending ledger row; complete
//! (action 1) settles it. Replies carry Click's own numeric error
//! vocabulary in the body - the HTTP status is 200 either way. The
//! signature is an MD5 digest over a fixed concatenation of payload
//! fields plus the shared secret.

use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::Client;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::ClickConfig;
use crate::db::queries;
use crate::error::{AppError, Result};
use crate::ledger;
use crate::models::{
    NewTransaction, PaymentMethodKind, ProviderName, SubscriptionStatus, TransactionKind,
    TransactionStatus,
};
use crate::util::mask_phone;

use super::{
    net_error, CreatePaymentMethodRequest, CreateSubscriptionRequest, PaymentMethodOutcome,
    PaymentOutcome, PaymentProvider, ProcessPaymentRequest, SubscriptionOutcome,
    UpdatePaymentMethodRequest, UpdateSubscriptionRequest, WebhookReply,
};

// Click reply codes
const OK: i64 = 0;
const ERR_AMOUNT: i64 = -2;
const ERR_ALREADY: i64 = -4;
const ERR_USER: i64 = -5;
const ERR_TXN_NOT_FOUND: i64 = -6;
const ERR_UPDATE: i64 = -7;
const ERR_REQUEST: i64 = -8;
const ERR_CANCELED: i64 = -9;

const ACTION_PREPARE: i64 = 0;
const ACTION_COMPLETE: i64 = 1;

#[derive(Debug, Clone)]
pub struct ClickProvider {
    client: Client,
    merchant_id: String,
    service_id: String,
    secret_key: String,
    base_url: String,
}

// ============ Webhook types ============

#[derive(Debug, Deserialize)]
struct ClickRequest {
    action: i64,
    click_trans_id: String,
    service_id: String,
    click_paydoc_id: String,
    /// Minor currency units
    amount: i64,
    #[serde(default)]
    error: i64,
    #[serde(default)]
    error_note: Option<String>,
    merchant_trans_id: String,
    sign_time: String,
    #[serde(default)]
    #[allow(dead_code)]
    sign_string: Option<String>,
}

/// Reply body in Click's vocabulary. Success replies echo the transaction
/// ids; rejections carry only the code and note.
#[derive(Debug, Serialize)]
struct ClickReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    click_trans_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merchant_trans_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merchant_prepare_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merchant_confirm_id: Option<String>,
    error: i64,
    error_note: String,
}

impl ClickReply {
    fn reject(error: i64, note: &str) -> WebhookReply {
        WebhookReply::json(ClickReply {
            click_trans_id: None,
            merchant_trans_id: None,
            merchant_prepare_id: None,
            merchant_confirm_id: None,
            error,
            error_note: note.to_string(),
        })
    }

    fn prepared(req: &ClickRequest, prepare_id: &str) -> WebhookReply {
        WebhookReply::json(ClickReply {
            click_trans_id: Some(req.click_trans_id.clone()),
            merchant_trans_id: Some(req.merchant_trans_id.clone()),
            merchant_prepare_id: Some(prepare_id.to_string()),
            merchant_confirm_id: None,
            error: OK,
            error_note: "Success".to_string(),
        })
    }

    fn completed(req: &ClickRequest, confirm_id: Option<&str>, error: i64, note: &str) -> WebhookReply {
        WebhookReply::json(ClickReply {
            click_trans_id: Some(req.click_trans_id.clone()),
            merchant_trans_id: Some(req.merchant_trans_id.clone()),
            merchant_prepare_id: None,
            merchant_confirm_id: confirm_id.map(|s| s.to_string()),
            error,
            error_note: note.to_string(),
        })
    }
}

/// Parse a structured merchant transaction id of the form
/// `sub_{userId}_{planId}_{epochSeconds}`.
///
/// The format is positional and schema-fragile, so it is validated
/// strictly: exactly four parts, literal `sub`, non-empty ids, numeric
/// epoch. Anything else is rejected before touching the ledger.
fn parse_merchant_trans_id(s: &str) -> Option<(String, String, i64)> {
    let parts: Vec<&str> = s.split('_').collect();
    if parts.len() != 4 || parts[0] != "sub" {
        return None;
    }
    let (user_id, plan_id) = (parts[1], parts[2]);
    if user_id.is_empty() || plan_id.is_empty() {
        return None;
    }
    let timestamp: i64 = parts[3].parse().ok()?;
    Some((user_id.to_string(), plan_id.to_string(), timestamp))
}

// ============ Invoice API types ============

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    invoice_id: Option<serde_json::Value>,
    payment_url: Option<String>,
    error_note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceStatusResponse {
    status: Option<String>,
    amount: Option<i64>,
}

fn id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn map_invoice_status(status: Option<&str>) -> SubscriptionStatus {
    match status {
        Some("paid") => SubscriptionStatus::Active,
        Some("canceled") | Some("rejected") => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Pending,
    }
}

impl ClickProvider {
    pub fn new(config: &ClickConfig, timeout_secs: u64) -> Self {
        Self {
            client: super::http_client(timeout_secs),
            merchant_id: config.merchant_id.clone(),
            service_id: config.service_id.clone(),
            secret_key: config.secret_key.clone(),
            base_url: config.base_url.clone(),
        }
    }

    /// SHA-256 request signature for the merchant API: the concatenated
    /// field values plus the secret.
    fn request_signature(&self, values: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for value in values {
            hasher.update(value.as_bytes());
        }
        hasher.update(self.secret_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn create_invoice(
        &self,
        amount: i64,
        phone: &str,
        merchant_trans_id: &str,
        merchant_user_id: &str,
    ) -> Result<InvoiceResponse> {
        let amount_str = amount.to_string();
        let signature = self.request_signature(&[
            &self.service_id,
            &amount_str,
            phone,
            merchant_trans_id,
            merchant_user_id,
        ]);

        let response = self
            .client
            .post(format!("{}/merchant/invoice/create", self.base_url))
            .header("Auth", format!("{}:{}", self.merchant_id, signature))
            .json(&json!({
                "service_id": self.service_id,
                "amount": amount,
                "phone_number": phone,
                "merchant_trans_id": merchant_trans_id,
                "merchant_user_id": merchant_user_id,
            }))
            .send()
            .await
            .map_err(|e| net_error(ProviderName::Click, "invoice/create", e))?;

        let status = response.status();
        let invoice: InvoiceResponse = response
            .json()
            .await
            .map_err(|e| net_error(ProviderName::Click, "invoice/create", e))?;

        if !status.is_success() || invoice.invoice_id.is_none() {
            return Err(AppError::Upstream(format!(
                "click invoice/create: {}",
                invoice
                    .error_note
                    .unwrap_or_else(|| format!("HTTP {}", status))
            )));
        }
        Ok(invoice)
    }

    // ============ Webhook phase handlers ============

    /// Prepare: validate the payment before anything is charged. Creates
    /// the pending ledger row on success; every rejection leaves the
    /// ledger untouched.
    fn handle_prepare(&self, conn: &Connection, req: &ClickRequest, raw: &serde_json::Value) -> WebhookReply {
        let (user_id, plan_id, _) = match parse_merchant_trans_id(&req.merchant_trans_id) {
            Some(parts) => parts,
            None => return ClickReply::reject(ERR_USER, "Invalid merchant_trans_id format"),
        };

        let user = match queries::get_user_by_id(conn, &user_id) {
            Ok(Some(u)) => u,
            Ok(None) => return ClickReply::reject(ERR_USER, "User not found"),
            Err(e) => {
                tracing::error!("click prepare: db error: {}", e);
                return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
            }
        };

        match queries::get_plan_by_id(conn, &plan_id) {
            Ok(Some(_)) => {}
            Ok(None) => return ClickReply::reject(ERR_USER, "Plan not found"),
            Err(e) => {
                tracing::error!("click prepare: db error: {}", e);
                return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
            }
        }

        // The payload amount must equal the plan's price for the user's
        // country exactly - amounts are minor units on both sides.
        let pricing = match queries::get_pricing_exact(conn, &plan_id, &user.country_code) {
            Ok(Some(p)) => p,
            Ok(None) => return ClickReply::reject(ERR_AMOUNT, "Invalid amount"),
            Err(e) => {
                tracing::error!("click prepare: db error: {}", e);
                return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
            }
        };
        if pricing.price_minor != req.amount {
            return ClickReply::reject(ERR_AMOUNT, "Invalid amount");
        }

        match queries::get_transaction_by_provider_id(conn, ProviderName::Click, &req.click_trans_id)
        {
            Ok(Some(_)) => return ClickReply::reject(ERR_ALREADY, "Transaction already exists"),
            Ok(None) => {}
            Err(e) => {
                tracing::error!("click prepare: db error: {}", e);
                return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
            }
        }

        let input = NewTransaction {
            user_id: user.id.clone(),
            provider: ProviderName::Click,
            provider_transaction_id: req.click_trans_id.clone(),
            kind: TransactionKind::Subscription,
            amount: req.amount,
            currency: pricing.currency.clone(),
            provider_data: Some(raw.clone()),
        };

        match ledger::record(conn, &input) {
            Ok(ledger::RecordOutcome::Created(txn)) => ClickReply::prepared(req, &txn.id),
            // Lost a concurrent-prepare race: same as the pre-check above.
            Ok(ledger::RecordOutcome::Existing(_)) => {
                ClickReply::reject(ERR_ALREADY, "Transaction already exists")
            }
            Err(e) => {
                tracing::error!("click prepare: ledger record failed: {}", e);
                ClickReply::reject(ERR_UPDATE, "Failed to update transaction")
            }
        }
    }

    /// Complete: settle a prepared transaction. The already-completed
    /// short-circuit is the primary defense against duplicate delivery.
    fn handle_complete(
        &self,
        conn: &mut Connection,
        req: &ClickRequest,
        raw: &serde_json::Value,
    ) -> WebhookReply {
        let existing = match queries::get_transaction_by_provider_id(
            conn,
            ProviderName::Click,
            &req.click_trans_id,
        ) {
            Ok(Some(t)) => t,
            Ok(None) => return ClickReply::reject(ERR_TXN_NOT_FOUND, "Transaction not found"),
            Err(e) => {
                tracing::error!("click complete: db error: {}", e);
                return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
            }
        };

        if existing.status == TransactionStatus::Succeeded {
            return ClickReply::completed(
                req,
                Some(&existing.id),
                ERR_ALREADY,
                "Transaction already completed",
            );
        }

        // The network reports its own upstream failure: record it and
        // reply with the fixed cancellation code.
        if req.error < 0 {
            let reason = req
                .error_note
                .clone()
                .unwrap_or_else(|| "Payment failed".to_string());
            match ledger::transition(
                conn,
                ProviderName::Click,
                &req.click_trans_id,
                TransactionStatus::Failed,
                Some(&reason),
                Some(raw),
            ) {
                Ok(_) | Err(AppError::Conflict(_)) => {}
                Err(e) => {
                    tracing::error!("click complete: failed to record failure: {}", e);
                    return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
                }
            }
            return ClickReply::completed(req, None, ERR_CANCELED, "Transaction canceled");
        }

        let txn = match ledger::transition(
            conn,
            ProviderName::Click,
            &req.click_trans_id,
            TransactionStatus::Succeeded,
            None,
            Some(raw),
        ) {
            Ok(ledger::TransitionOutcome::Applied(t)) => t,
            Ok(ledger::TransitionOutcome::AlreadyProcessed(t)) => {
                // Concurrent duplicate got there first.
                return ClickReply::completed(
                    req,
                    Some(&t.id),
                    ERR_ALREADY,
                    "Transaction already completed",
                );
            }
            Ok(ledger::TransitionOutcome::NotFound) => {
                return ClickReply::reject(ERR_TXN_NOT_FOUND, "Transaction not found");
            }
            // The row failed earlier; a late success cannot resurrect it.
            Err(AppError::Conflict(_)) => {
                return ClickReply::completed(req, None, ERR_CANCELED, "Transaction canceled");
            }
            Err(e) => {
                tracing::error!("click complete: transition failed: {}", e);
                return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
            }
        };

        // Settled: activate the one-month subscription period encoded in
        // the merchant transaction id.
        match parse_merchant_trans_id(&req.merchant_trans_id) {
            Some((user_id, plan_id, _)) => {
                if let Err(e) = ledger::activate_for(
                    conn,
                    &txn,
                    &user_id,
                    &plan_id,
                    &req.click_trans_id,
                    None,
                ) {
                    tracing::error!(
                        click_trans_id = %req.click_trans_id,
                        user_id = %user_id,
                        plan_id = %plan_id,
                        "click complete: subscription activation failed: {}",
                        e
                    );
                    return ClickReply::reject(ERR_UPDATE, "Failed to update transaction");
                }
            }
            None => {
                // Prepare validated the format, so this only fires for rows
                // created through another path.
                tracing::warn!(
                    merchant_trans_id = %req.merchant_trans_id,
                    "click complete: unparseable merchant_trans_id, skipping activation"
                );
            }
        }

        ClickReply::completed(req, Some(&txn.id), OK, "Success")
    }
}

#[async_trait]
impl PaymentProvider for ClickProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Click
    }

    async fn create_subscription(
        &self,
        req: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome> {
        // Click has no native subscriptions: create an invoice whose
        // merchant id carries the user/plan/epoch triple the webhook will
        // parse back out.
        let merchant_trans_id = format!(
            "sub_{}_{}_{}",
            req.user.id,
            req.plan_id,
            chrono::Utc::now().timestamp()
        );
        let phone = req.user.phone.clone().unwrap_or_default();

        let invoice = self
            .create_invoice(req.amount, &phone, &merchant_trans_id, &req.user.id)
            .await
            .map_err(|e| {
                tracing::error!(user_id = %req.user.id, "click subscription creation failed: {}", e);
                e
            })?;

        Ok(SubscriptionOutcome {
            provider_subscription_id: invoice
                .invoice_id
                .as_ref()
                .map(id_to_string)
                .unwrap_or_default(),
            status: SubscriptionStatus::Pending,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            checkout_url: invoice.payment_url,
            customer_id: None,
            amount: Some(req.amount),
            raw: serde_json::Value::Null,
        })
    }

    async fn update_subscription(
        &self,
        _subscription_id: &str,
        _req: &UpdateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome> {
        Err(AppError::BadRequest(
            "Subscription updates not supported. Please cancel and create a new subscription."
                .into(),
        ))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool> {
        // Recurrence is merchant-side for Click; cancellation means we
        // stop issuing invoices. Nothing to tear down remotely.
        tracing::info!(
            subscription_id = %subscription_id,
            "click subscription canceled merchant-side"
        );
        Ok(true)
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionOutcome> {
        let signature = {
            let mut hasher = Sha256::new();
            hasher.update(subscription_id.as_bytes());
            hasher.update(self.secret_key.as_bytes());
            hex::encode(hasher.finalize())
        };

        let response = self
            .client
            .get(format!(
                "{}/merchant/invoice/status/{}",
                self.base_url, subscription_id
            ))
            .header("Auth", format!("{}:{}", self.merchant_id, signature))
            .send()
            .await
            .map_err(|e| net_error(ProviderName::Click, "invoice/status", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "click invoice/status: HTTP {}",
                status
            )));
        }
        let invoice: InvoiceStatusResponse = response
            .json()
            .await
            .map_err(|e| net_error(ProviderName::Click, "invoice/status", e))?;

        Ok(SubscriptionOutcome {
            provider_subscription_id: subscription_id.to_string(),
            status: map_invoice_status(invoice.status.as_deref()),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            checkout_url: None,
            customer_id: None,
            amount: invoice.amount,
            raw: serde_json::Value::Null,
        })
    }

    async fn process_payment(&self, req: &ProcessPaymentRequest) -> Result<PaymentOutcome> {
        let merchant_trans_id = format!("payment_{}", uuid::Uuid::new_v4().simple());
        let phone = req.phone.clone().unwrap_or_default();

        let invoice = self
            .create_invoice(req.amount, &phone, &merchant_trans_id, &req.user_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %req.user_id,
                    amount = req.amount,
                    "click payment failed: {}",
                    e
                );
                e
            })?;

        Ok(PaymentOutcome {
            provider_transaction_id: invoice
                .invoice_id
                .as_ref()
                .map(id_to_string)
                .unwrap_or_default(),
            status: TransactionStatus::Pending,
            amount: req.amount,
            currency: req.currency.clone(),
            checkout_url: invoice.payment_url,
        })
    }

    async fn create_payment_method(
        &self,
        req: &CreatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome> {
        // Click charges phone numbers directly; there is nothing to
        // register remotely.
        let phone = req
            .phone
            .clone()
            .ok_or_else(|| AppError::BadRequest("phone number is required".into()))?;

        Ok(PaymentMethodOutcome {
            payment_method_id: phone.clone(),
            kind: PaymentMethodKind::Phone,
            display: mask_phone(&phone),
        })
    }

    async fn update_payment_method(
        &self,
        _payment_method_id: &str,
        _req: &UpdatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome> {
        Err(AppError::BadRequest("Payment method updates not supported".into()))
    }

    async fn delete_payment_method(&self, _payment_method_id: &str) -> Result<bool> {
        // Nothing stored remotely.
        Ok(true)
    }

    fn verify_webhook_signature(&self, body: &[u8], signature: &str) -> bool {
        let req: ClickRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(_) => return false,
        };

        let sign_string = format!(
            "{}{}{}{}{}{}{}",
            req.click_trans_id,
            req.service_id,
            req.click_paydoc_id,
            req.amount,
            req.action,
            req.sign_time,
            self.secret_key
        );
        let mut hasher = Md5::new();
        hasher.update(sign_string.as_bytes());
        let expected = hex::encode(hasher.finalize());

        let expected = expected.as_bytes();
        let provided = signature.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        expected.ct_eq(provided).into()
    }

    fn handle_webhook(&self, conn: &mut Connection, body: &[u8]) -> WebhookReply {
        let raw: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("click webhook: parse error: {}", e);
                return ClickReply::reject(ERR_REQUEST, "Error in request");
            }
        };
        let req: ClickRequest = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("click webhook: invalid payload: {}", e);
                return ClickReply::reject(ERR_REQUEST, "Error in request");
            }
        };

        match req.action {
            ACTION_PREPARE => self.handle_prepare(conn, &req, &raw),
            ACTION_COMPLETE => self.handle_complete(conn, &req, &raw),
            other => {
                tracing::debug!("click webhook: invalid action {}", other);
                ClickReply::reject(ERR_REQUEST, "Invalid action")
            }
        }
    }
}
