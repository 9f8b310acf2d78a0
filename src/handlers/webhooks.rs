//! Webhook endpoints for the three payment networks.
//!
//! Signature verification always runs before the adapter is allowed to
//! touch the ledger. Each network gets its reply in its own vocabulary:
//! the body of an HTTP 200 is the contract, not the status code.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::json;

use crate::db::AppState;
use crate::models::ProviderName;
use crate::providers::PaymentProvider;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhook/stripe", post(handle_stripe_webhook))
        .route("/webhook/payme", post(handle_payme_webhook))
        .route("/webhook/click", post(handle_click_webhook))
}

/// Run the verified body through the adapter and reply with its body.
fn process(state: &AppState, provider: ProviderName, body: &Bytes) -> Response {
    let adapter = state.providers.get(provider);
    let mut conn = match state.db.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("webhook: db connection error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };
    let reply = adapter.handle_webhook(&mut conn, body);
    axum::Json(reply.body).into_response()
}

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = match headers.get("stripe-signature").and_then(|v| v.to_str().ok()) {
        Some(s) => s.to_string(),
        None => {
            return (StatusCode::BAD_REQUEST, "Missing stripe-signature header").into_response();
        }
    };

    let adapter = state.providers.get(ProviderName::Stripe);
    if !adapter.verify_webhook_signature(&body, &signature) {
        tracing::warn!("stripe webhook: signature verification failed");
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }

    process(&state, ProviderName::Stripe, &body)
}

pub async fn handle_payme_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Payme authenticates with Basic credentials in the Authorization
    // header and expects a JSON-RPC error body on rejection.
    let credential = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let adapter = state.providers.get(ProviderName::Payme);
    if !adapter.verify_webhook_signature(&body, &credential) {
        tracing::warn!("payme webhook: credential verification failed");
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({
                "error": { "code": -32504, "message": "Insufficient privileges" }
            })),
        )
            .into_response();
    }

    process(&state, ProviderName::Payme, &body)
}

pub async fn handle_click_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    // Click carries its signature inside the payload and expects the
    // rejection in-body with HTTP 200, like every other click reply.
    let sign_string = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("sign_string")
                .and_then(|s| s.as_str().map(String::from))
        });

    let adapter = state.providers.get(ProviderName::Click);
    let verified = match sign_string {
        Some(ref sign) => adapter.verify_webhook_signature(&body, sign),
        None => false,
    };
    if !verified {
        tracing::warn!("click webhook: sign check failed");
        return axum::Json(json!({ "error": -1, "error_note": "Sign check failed" }))
            .into_response();
    }

    process(&state, ProviderName::Click, &body)
}
