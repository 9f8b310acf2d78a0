//! Test utilities and fixtures for paygate integration tests

#![allow(dead_code)]

use rusqlite::Connection;

pub use paygate::config::{ClickConfig, PaymeConfig, StripeConfig};
pub use paygate::db::{init_db, queries};
pub use paygate::ledger;
pub use paygate::models::*;
pub use paygate::providers::{ClickProvider, PaymeProvider, PaymentProvider, StripeProvider};

pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const PAYME_MERCHANT_ID: &str = "test_merchant";
pub const PAYME_SECRET_KEY: &str = "payme_test_key";
pub const CLICK_SERVICE_ID: &str = "12345";
pub const CLICK_SECRET_KEY: &str = "click_test_key";

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

pub fn stripe_provider() -> StripeProvider {
    StripeProvider::new(
        &StripeConfig {
            secret_key: "sk_test_xxx".to_string(),
            webhook_secret: STRIPE_WEBHOOK_SECRET.to_string(),
        },
        5,
    )
}

pub fn payme_provider() -> PaymeProvider {
    PaymeProvider::new(
        &PaymeConfig {
            merchant_id: PAYME_MERCHANT_ID.to_string(),
            secret_key: PAYME_SECRET_KEY.to_string(),
            base_url: "https://checkout.paycom.uz/api".to_string(),
        },
        5,
    )
}

pub fn click_provider() -> ClickProvider {
    ClickProvider::new(
        &ClickConfig {
            merchant_id: "click_merchant".to_string(),
            service_id: CLICK_SERVICE_ID.to_string(),
            secret_key: CLICK_SECRET_KEY.to_string(),
            base_url: "https://api.click.uz/v2".to_string(),
        },
        5,
    )
}

/// Create a test user with a fixed id (ids come from the main app, so the
/// schema takes whatever we insert).
pub fn create_test_user(conn: &Connection, id: &str, country_code: &str) -> User {
    let now = queries::now();
    conn.execute(
        "INSERT INTO users (id, email, name, phone, country_code, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            id,
            format!("{}@example.com", id.to_lowercase()),
            format!("Test User {}", id),
            "998901234567",
            country_code,
            now,
            now
        ],
    )
    .expect("Failed to create test user");
    queries::get_user_by_id(conn, id)
        .expect("query user")
        .expect("user exists")
}

/// Create a test plan with pricing for one country
pub fn create_test_plan(
    conn: &Connection,
    id: &str,
    country_code: &str,
    currency: &str,
    price_minor: i64,
) -> Plan {
    let plan = queries::create_plan(conn, id, &format!("Plan {}", id), "gold")
        .expect("Failed to create test plan");
    queries::create_plan_pricing(conn, id, country_code, currency, price_minor, None)
        .expect("Failed to create test pricing");
    plan
}

/// Insert a pending ledger row directly
pub fn create_pending_transaction(
    conn: &Connection,
    user_id: &str,
    provider: ProviderName,
    provider_transaction_id: &str,
    amount: i64,
) -> Transaction {
    match ledger::record(
        conn,
        &NewTransaction {
            user_id: user_id.to_string(),
            provider,
            provider_transaction_id: provider_transaction_id.to_string(),
            kind: TransactionKind::Subscription,
            amount,
            currency: "UZS".to_string(),
            provider_data: None,
        },
    )
    .expect("Failed to record transaction")
    {
        ledger::RecordOutcome::Created(t) => t,
        ledger::RecordOutcome::Existing(t) => t,
    }
}

/// Insert a local subscription row directly (as the outbound create path
/// would have done before the first webhook arrives).
pub fn create_local_subscription(
    conn: &Connection,
    user_id: &str,
    plan_id: &str,
    provider: ProviderName,
    provider_subscription_id: &str,
    status: SubscriptionStatus,
) -> Subscription {
    let now = queries::now();
    queries::insert_subscription(
        conn,
        &NewSubscription {
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            provider,
            provider_subscription_id: provider_subscription_id.to_string(),
            status,
            current_period_start: now,
            current_period_end: now + 30 * 86400,
            metadata: None,
        },
    )
    .expect("Failed to create local subscription")
}

// ============ Signature helpers ============

/// Compute a Stripe-style `t=...,v1=...` signature header for a payload.
pub fn stripe_signature_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// Compute the Basic-Auth credential Payme sends with webhooks.
pub fn payme_credential(merchant_id: &str, secret_key: &str) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    format!("Basic {}", BASE64.encode(format!("{}:{}", merchant_id, secret_key)))
}

/// Compute the MD5 sign string Click puts in its payloads.
pub fn click_signature(
    click_trans_id: &str,
    service_id: &str,
    click_paydoc_id: &str,
    amount: i64,
    action: i64,
    sign_time: &str,
    secret_key: &str,
) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(
        format!(
            "{}{}{}{}{}{}{}",
            click_trans_id, service_id, click_paydoc_id, amount, action, sign_time, secret_key
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// A fully-signed Click webhook payload.
pub fn click_payload(
    action: i64,
    click_trans_id: &str,
    amount: i64,
    merchant_trans_id: &str,
    error: i64,
) -> serde_json::Value {
    let sign_time = "2023-11-03 12:00:00";
    let paydoc_id = "paydoc_1";
    let error_note = if error < 0 { "Upstream failure" } else { "Success" };
    serde_json::json!({
        "action": action,
        "click_trans_id": click_trans_id,
        "service_id": CLICK_SERVICE_ID,
        "click_paydoc_id": paydoc_id,
        "amount": amount,
        "error": error,
        "error_note": error_note,
        "merchant_trans_id": merchant_trans_id,
        "sign_time": sign_time,
        "sign_string": click_signature(
            click_trans_id,
            CLICK_SERVICE_ID,
            paydoc_id,
            amount,
            action,
            sign_time,
            CLICK_SECRET_KEY,
        ),
    })
}

/// Run a JSON-RPC style request through the Payme adapter.
pub fn payme_call(
    provider: &PaymeProvider,
    conn: &mut Connection,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let body = serde_json::json!({ "method": method, "params": params });
    provider
        .handle_webhook(conn, body.to_string().as_bytes())
        .body
}

/// Run a payload through the Click adapter.
pub fn click_call(
    provider: &ClickProvider,
    conn: &mut Connection,
    payload: &serde_json::Value,
) -> serde_json::Value {
    provider.handle_webhook(conn, payload.to_string().as_bytes()).body
}
