//! Mobile-money adapter A (Payme).
//!
//! Outbound calls use the receipts API with an `X-Auth` header. The
//! webhook is JSON-RPC: the network invokes five methods against our
//! ledger and expects Payme's own error-code vocabulary in the reply
//! body. Credentials are checked as a Basic-Auth digest of merchant id
//! and shared secret.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::config::PaymeConfig;
use crate::db::queries;
use crate::error::{AppError, Result};
use crate::ledger;
use crate::models::{
    NewTransaction, PaymentMethodKind, ProviderName, SubscriptionStatus, Transaction,
    TransactionKind, TransactionStatus,
};
use crate::util::detect_card_brand;

use super::{
    net_error, CreatePaymentMethodRequest, CreateSubscriptionRequest, PaymentMethodOutcome,
    PaymentOutcome, PaymentProvider, ProcessPaymentRequest, SubscriptionOutcome,
    UpdatePaymentMethodRequest, UpdateSubscriptionRequest, WebhookReply,
};

// JSON-RPC / Payme error codes
const ERR_PARSE: i64 = -32700;
const ERR_METHOD_NOT_FOUND: i64 = -32601;
const ERR_INVALID_AMOUNT: i64 = -31001;
const ERR_TXN_NOT_FOUND: i64 = -31003;
const ERR_CANNOT_CANCEL: i64 = -31007;
const ERR_CANNOT_PERFORM: i64 = -31008;
const ERR_USER_NOT_FOUND: i64 = -31050;

// Payme transaction state codes
const STATE_CREATED: i64 = 1;
const STATE_PERFORMED: i64 = 2;
const STATE_CANCELED: i64 = -1;
const STATE_REFUNDED: i64 = -2;

#[derive(Debug, Clone)]
pub struct PaymeProvider {
    client: Client,
    merchant_id: String,
    secret_key: String,
    base_url: String,
}

// ============ Webhook request types ============

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: RpcParams,
}

#[derive(Debug, Default, Deserialize)]
struct RpcParams {
    /// Payme's transaction id
    id: Option<String>,
    /// Minor units (tiyin)
    amount: Option<i64>,
    account: Option<Account>,
    reason: Option<Reason>,
}

#[derive(Debug, Clone, Deserialize)]
struct Account {
    user_id: Option<String>,
    plan_id: Option<String>,
}

/// Payme sends cancellation reasons either as a bare numeric code or as a
/// detail object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reason {
    Code(i64),
    Detail { message: Option<String> },
}

impl Reason {
    fn message(&self) -> String {
        match self {
            Reason::Code(code) => format!("Canceled (reason {})", code),
            Reason::Detail { message } => {
                message.clone().unwrap_or_else(|| "Canceled".to_string())
            }
        }
    }
}

// ============ Receipts API types ============

#[derive(Debug, Deserialize)]
struct ReceiptEnvelope {
    result: Option<ReceiptResult>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct ReceiptResult {
    receipt: Receipt,
}

#[derive(Debug, Deserialize)]
struct Receipt {
    #[serde(rename = "_id")]
    id: String,
    state: Option<i64>,
    amount: Option<i64>,
    #[serde(default)]
    checkout_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CardEnvelope {
    result: Option<CardResult>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct CardResult {
    card: Card,
}

#[derive(Debug, Deserialize)]
struct Card {
    token: String,
    number: String,
}

fn rpc_result(value: serde_json::Value) -> WebhookReply {
    WebhookReply::json(json!({ "result": value }))
}

fn rpc_error(code: i64, message: &str) -> WebhookReply {
    WebhookReply::json(json!({ "error": { "code": code, "message": message } }))
}

/// Payme receipt states: 0 created, 1 waiting, 2 preauth, 3 postauth,
/// 4 paid/active, 50 canceled, 51 refunded.
fn map_receipt_state(state: Option<i64>) -> SubscriptionStatus {
    match state {
        Some(4) => SubscriptionStatus::Active,
        Some(50) | Some(51) => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Pending,
    }
}

impl PaymeProvider {
    pub fn new(config: &PaymeConfig, timeout_secs: u64) -> Self {
        Self {
            client: super::http_client(timeout_secs),
            merchant_id: config.merchant_id.clone(),
            secret_key: config.secret_key.clone(),
            base_url: config.base_url.clone(),
        }
    }

    fn auth_header(&self) -> String {
        format!("{}:{}", self.merchant_id, self.secret_key)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-Auth", self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| net_error(ProviderName::Payme, path, e))?;

        response
            .json()
            .await
            .map_err(|e| net_error(ProviderName::Payme, path, e))
    }

    async fn post_receipt(&self, path: &str, body: serde_json::Value) -> Result<Receipt> {
        let envelope: ReceiptEnvelope = serde_json::from_value(self.post(path, body).await?)?;
        match (envelope.result, envelope.error) {
            (Some(result), _) => Ok(result.receipt),
            (None, Some(error)) => Err(AppError::Upstream(format!(
                "payme {}: {}",
                path,
                error.message.unwrap_or_else(|| "request rejected".to_string())
            ))),
            (None, None) => Err(AppError::Upstream(format!("payme {}: empty reply", path))),
        }
    }

    // ============ Webhook method handlers ============

    /// Eligibility probe. MUST have no side effect - the network calls
    /// this speculatively before creating anything.
    fn check_perform(&self, conn: &Connection, params: &RpcParams) -> WebhookReply {
        let user_id = match params.account.as_ref().and_then(|a| a.user_id.clone()) {
            Some(id) => id,
            None => return rpc_error(ERR_USER_NOT_FOUND, "User not found"),
        };

        match queries::get_user_by_id(conn, &user_id) {
            Ok(Some(_)) => {}
            Ok(None) => return rpc_error(ERR_USER_NOT_FOUND, "User not found"),
            Err(e) => {
                tracing::error!("payme CheckPerformTransaction: db error: {}", e);
                return rpc_error(ERR_CANNOT_PERFORM, "Internal error");
            }
        }

        if params.amount.unwrap_or(0) <= 0 {
            return rpc_error(ERR_INVALID_AMOUNT, "Invalid amount");
        }

        rpc_result(json!({ "allow": true }))
    }

    fn create_transaction(&self, conn: &Connection, params: &RpcParams) -> WebhookReply {
        let remote_id = match params.id.clone() {
            Some(id) => id,
            None => return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found"),
        };
        let account = match params.account.clone() {
            Some(a) => a,
            None => return rpc_error(ERR_USER_NOT_FOUND, "User not found"),
        };
        let user_id = match account.user_id.clone() {
            Some(id) => id,
            None => return rpc_error(ERR_USER_NOT_FOUND, "User not found"),
        };
        let amount = match params.amount {
            Some(a) if a > 0 => a,
            _ => return rpc_error(ERR_INVALID_AMOUNT, "Invalid amount"),
        };

        match queries::get_user_by_id(conn, &user_id) {
            Ok(Some(_)) => {}
            Ok(None) => return rpc_error(ERR_USER_NOT_FOUND, "User not found"),
            Err(e) => {
                tracing::error!("payme CreateTransaction: db error: {}", e);
                return rpc_error(ERR_CANNOT_PERFORM, "Internal error");
            }
        }

        let kind = if account.plan_id.is_some() {
            TransactionKind::Subscription
        } else {
            TransactionKind::OneTime
        };

        // The account block is kept in provider_data so PerformTransaction
        // can activate the right user/plan later.
        let input = NewTransaction {
            user_id,
            provider: ProviderName::Payme,
            provider_transaction_id: remote_id,
            kind,
            amount,
            currency: "UZS".to_string(),
            provider_data: Some(json!({
                "account": {
                    "user_id": account.user_id,
                    "plan_id": account.plan_id,
                }
            })),
        };

        match ledger::record(conn, &input) {
            Ok(ledger::RecordOutcome::Created(txn)) => rpc_result(json!({
                "create_time": txn.created_at * 1000,
                "transaction": txn.id,
                "state": STATE_CREATED,
            })),
            Ok(ledger::RecordOutcome::Existing(txn)) => {
                if txn.amount != amount {
                    return rpc_error(ERR_INVALID_AMOUNT, "Invalid amount");
                }
                match txn.status {
                    // Redelivery of the original create: same reply.
                    TransactionStatus::Pending => rpc_result(json!({
                        "create_time": txn.created_at * 1000,
                        "transaction": txn.id,
                        "state": STATE_CREATED,
                    })),
                    _ => rpc_error(ERR_CANNOT_PERFORM, "Unable to perform operation"),
                }
            }
            Err(e) => {
                tracing::error!("payme CreateTransaction failed: {}", e);
                rpc_error(ERR_CANNOT_PERFORM, "Internal error")
            }
        }
    }

    fn perform_transaction(&self, conn: &mut Connection, params: &RpcParams) -> WebhookReply {
        let remote_id = match params.id.clone() {
            Some(id) => id,
            None => return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found"),
        };

        let txn = match ledger::transition(
            conn,
            ProviderName::Payme,
            &remote_id,
            TransactionStatus::Succeeded,
            None,
            None,
        ) {
            Ok(ledger::TransitionOutcome::Applied(t)) => {
                self.activate_from_transaction(conn, &t, &remote_id);
                t
            }
            Ok(ledger::TransitionOutcome::AlreadyProcessed(t)) => t,
            Ok(ledger::TransitionOutcome::NotFound) => {
                return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found");
            }
            Err(AppError::Conflict(_)) => {
                return rpc_error(ERR_CANNOT_PERFORM, "Unable to perform operation");
            }
            Err(e) => {
                tracing::error!("payme PerformTransaction failed: {}", e);
                return rpc_error(ERR_CANNOT_PERFORM, "Internal error");
            }
        };

        rpc_result(json!({
            "transaction": txn.id,
            "perform_time": txn.updated_at * 1000,
            "state": STATE_PERFORMED,
        }))
    }

    fn cancel_transaction(&self, conn: &mut Connection, params: &RpcParams) -> WebhookReply {
        let remote_id = match params.id.clone() {
            Some(id) => id,
            None => return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found"),
        };
        let reason = params
            .reason
            .as_ref()
            .map(|r| r.message())
            .unwrap_or_else(|| "Canceled".to_string());

        let txn = match ledger::transition(
            conn,
            ProviderName::Payme,
            &remote_id,
            TransactionStatus::Failed,
            Some(&reason),
            None,
        ) {
            Ok(ledger::TransitionOutcome::Applied(t))
            | Ok(ledger::TransitionOutcome::AlreadyProcessed(t)) => t,
            Ok(ledger::TransitionOutcome::NotFound) => {
                return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found");
            }
            Err(AppError::Conflict(_)) => {
                return rpc_error(ERR_CANNOT_CANCEL, "Unable to cancel transaction");
            }
            Err(e) => {
                tracing::error!("payme CancelTransaction failed: {}", e);
                return rpc_error(ERR_CANNOT_CANCEL, "Internal error");
            }
        };

        rpc_result(json!({
            "transaction": txn.id,
            "cancel_time": txn.updated_at * 1000,
            "state": STATE_CANCELED,
        }))
    }

    /// Pure read: maps internal status onto Payme's state codes.
    fn check_transaction(&self, conn: &Connection, params: &RpcParams) -> WebhookReply {
        let remote_id = match params.id.clone() {
            Some(id) => id,
            None => return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found"),
        };

        let txn = match queries::get_transaction_by_provider_id(conn, ProviderName::Payme, &remote_id)
        {
            Ok(Some(t)) => t,
            Ok(None) => return rpc_error(ERR_TXN_NOT_FOUND, "Transaction not found"),
            Err(e) => {
                tracing::error!("payme CheckTransaction: db error: {}", e);
                return rpc_error(ERR_CANNOT_PERFORM, "Internal error");
            }
        };

        let state = match txn.status {
            TransactionStatus::Pending => STATE_CREATED,
            TransactionStatus::Succeeded => STATE_PERFORMED,
            TransactionStatus::Failed => STATE_CANCELED,
            TransactionStatus::Refunded => STATE_REFUNDED,
        };
        let perform_time = if txn.status == TransactionStatus::Succeeded {
            txn.updated_at * 1000
        } else {
            0
        };
        let cancel_time = if matches!(
            txn.status,
            TransactionStatus::Failed | TransactionStatus::Refunded
        ) {
            txn.updated_at * 1000
        } else {
            0
        };

        rpc_result(json!({
            "create_time": txn.created_at * 1000,
            "perform_time": perform_time,
            "cancel_time": cancel_time,
            "transaction": txn.id,
            "state": state,
            "reason": txn.failure_reason.map(|m| json!({ "message": m })),
        }))
    }

    /// Activate the subscription paid for by a just-performed transaction,
    /// using the account block captured at create time.
    fn activate_from_transaction(&self, conn: &Connection, txn: &Transaction, remote_id: &str) {
        let account = txn
            .provider_data
            .as_deref()
            .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
            .and_then(|v| {
                serde_json::from_value::<Account>(v.get("account").cloned()?).ok()
            });

        let (user_id, plan_id) = match account {
            Some(Account {
                user_id: Some(user_id),
                plan_id: Some(plan_id),
            }) => (user_id, plan_id),
            _ => {
                // One-time payment or missing account: nothing to activate.
                tracing::debug!(
                    provider_transaction_id = %remote_id,
                    "payme: no plan account on transaction, skipping activation"
                );
                return;
            }
        };

        if let Err(e) = ledger::activate_for(conn, txn, &user_id, &plan_id, remote_id, None) {
            tracing::error!(
                provider_transaction_id = %remote_id,
                user_id = %user_id,
                plan_id = %plan_id,
                "payme: subscription activation failed: {}",
                e
            );
        }
    }
}

#[async_trait]
impl PaymentProvider for PaymeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Payme
    }

    async fn create_subscription(
        &self,
        req: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionOutcome> {
        let receipt = self
            .post_receipt(
                "/receipts/create",
                json!({
                    "amount": req.amount,
                    "account": {
                        "user_id": req.user.id,
                        "plan_id": req.plan_id,
                    },
                    "description": format!("Subscription: {}", req.plan_name),
                    "detail": {
                        "receipt_type": 1, // Recurring
                        "items": [{
                            "title": req.plan_name,
                            "price": req.amount,
                            "count": 1,
                            "vat": 0,
                        }],
                    },
                }),
            )
            .await
            .map_err(|e| {
                tracing::error!(user_id = %req.user.id, "payme subscription creation failed: {}", e);
                e
            })?;

        Ok(SubscriptionOutcome {
            provider_subscription_id: receipt.id,
            status: SubscriptionStatus::Pending,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            checkout_url: receipt.checkout_url,
            customer_id: None,
            amount: receipt.amount,
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
        match self
            .post_receipt("/receipts/cancel", json!({ "id": subscription_id }))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    "payme subscription cancellation failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<SubscriptionOutcome> {
        let receipt = self
            .post_receipt("/receipts/get", json!({ "id": subscription_id }))
            .await?;

        Ok(SubscriptionOutcome {
            provider_subscription_id: receipt.id,
            status: map_receipt_state(receipt.state),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            checkout_url: receipt.checkout_url,
            customer_id: None,
            amount: receipt.amount,
            raw: serde_json::Value::Null,
        })
    }

    async fn process_payment(&self, req: &ProcessPaymentRequest) -> Result<PaymentOutcome> {
        let receipt = self
            .post_receipt(
                "/receipts/create",
                json!({
                    "amount": req.amount,
                    "account": { "user_id": req.user_id },
                    "description": req.description.clone().unwrap_or_else(|| "One-time payment".to_string()),
                    "detail": { "receipt_type": 0 }, // One-time
                }),
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %req.user_id,
                    amount = req.amount,
                    "payme payment failed: {}",
                    e
                );
                e
            })?;

        Ok(PaymentOutcome {
            provider_transaction_id: receipt.id,
            status: TransactionStatus::Pending,
            amount: receipt.amount.unwrap_or(req.amount),
            currency: "UZS".to_string(),
            checkout_url: receipt.checkout_url,
        })
    }

    async fn create_payment_method(
        &self,
        req: &CreatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome> {
        let number = req
            .card_number
            .clone()
            .ok_or_else(|| AppError::BadRequest("card number is required".into()))?;
        let expire = req
            .expire
            .clone()
            .ok_or_else(|| AppError::BadRequest("card expiry is required".into()))?;

        let body = self
            .post(
                "/cards/create",
                json!({
                    "card": { "number": number, "expire": expire },
                    "account": { "user_id": req.user_id },
                    "save": true,
                }),
            )
            .await?;
        let envelope: CardEnvelope = serde_json::from_value(body)?;
        let card = match (envelope.result, envelope.error) {
            (Some(result), _) => result.card,
            (None, error) => {
                return Err(AppError::Upstream(format!(
                    "payme /cards/create: {}",
                    error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "request rejected".to_string())
                )));
            }
        };

        Ok(PaymentMethodOutcome {
            payment_method_id: card.token,
            kind: PaymentMethodKind::Card,
            display: format!("{} {}", detect_card_brand(&card.number), card.number),
        })
    }

    async fn update_payment_method(
        &self,
        _payment_method_id: &str,
        _req: &UpdatePaymentMethodRequest,
    ) -> Result<PaymentMethodOutcome> {
        Err(AppError::BadRequest("Payment method updates not supported".into()))
    }

    async fn delete_payment_method(&self, payment_method_id: &str) -> Result<bool> {
        // Reply carries {"result": {"success": true}} or an error block.
        let body = self
            .post("/cards/remove", json!({ "token": payment_method_id }))
            .await?;
        Ok(body.get("error").map_or(true, |e| e.is_null()))
    }

    fn verify_webhook_signature(&self, _body: &[u8], signature: &str) -> bool {
        // Payme authenticates webhooks with Basic Auth over merchant
        // credentials, not a body digest.
        let expected = format!("Basic {}", BASE64.encode(self.auth_header()));
        let expected = expected.as_bytes();
        let provided = signature.as_bytes();
        if expected.len() != provided.len() {
            return false;
        }
        expected.ct_eq(provided).into()
    }

    fn handle_webhook(&self, conn: &mut Connection, body: &[u8]) -> WebhookReply {
        let request: RpcRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("payme webhook: parse error: {}", e);
                return rpc_error(ERR_PARSE, "Parse error");
            }
        };

        match request.method.as_str() {
            "CheckPerformTransaction" => self.check_perform(conn, &request.params),
            "CreateTransaction" => self.create_transaction(conn, &request.params),
            "PerformTransaction" => self.perform_transaction(conn, &request.params),
            "CancelTransaction" => self.cancel_transaction(conn, &request.params),
            "CheckTransaction" => self.check_transaction(conn, &request.params),
            other => {
                tracing::debug!("payme webhook: unknown method {}", other);
                rpc_error(ERR_METHOD_NOT_FOUND, "Method not found")
            }
        }
    }
}
