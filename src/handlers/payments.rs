//! Internal one-time payment and payment-method API.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::db::{queries, AppState};
use crate::error::{AppError, OptionExt, Result};
use crate::extractors::{Json, Query};
use crate::ledger;
use crate::models::{
    NewTransaction, PaymentMethod, ProviderName, Transaction, TransactionKind,
};
use crate::providers::{
    CreatePaymentMethodRequest, PaymentProvider, ProcessPaymentRequest, ProviderRegistry,
    UpdatePaymentMethodRequest,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/payments", post(process_payment))
        .route(
            "/api/payment-methods",
            post(create_payment_method).get(list_payment_methods),
        )
        .route(
            "/api/payment-methods/{id}",
            post(update_payment_method).delete(delete_payment_method),
        )
}

fn parse_provider(s: &str) -> Result<ProviderName> {
    s.parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown payment provider: {}", s)))
}

fn default_currency(provider: ProviderName) -> &'static str {
    match provider {
        ProviderName::Stripe => "usd",
        ProviderName::Payme | ProviderName::Click => "UZS",
    }
}

// ============ POST /api/payments ============

#[derive(Debug, Deserialize)]
pub struct ProcessPaymentBody {
    pub user_id: String,
    pub provider: String,
    /// Minor currency units
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub transaction: Transaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

pub async fn process_payment(
    State(state): State<AppState>,
    Json(body): Json<ProcessPaymentBody>,
) -> Result<Json<PaymentResponse>> {
    if body.amount <= 0 {
        return Err(AppError::BadRequest("amount must be positive".into()));
    }
    let provider_name = parse_provider(&body.provider)?;

    let user = {
        let conn = state.db.get()?;
        queries::get_user_by_id(&conn, &body.user_id)?.or_not_found("User")?
    };
    if !ProviderRegistry::available_for_country(&user.country_code).contains(&provider_name) {
        return Err(AppError::BadRequest(format!(
            "Provider {} is not available in {}",
            provider_name, user.country_code
        )));
    }

    let currency = body
        .currency
        .clone()
        .unwrap_or_else(|| default_currency(provider_name).to_string());

    let outcome = state
        .providers
        .get(provider_name)
        .process_payment(&ProcessPaymentRequest {
            user_id: user.id.clone(),
            amount: body.amount,
            currency: currency.clone(),
            payment_method_id: body.payment_method_id.clone(),
            customer_id: user.stripe_customer_id.clone(),
            phone: user.phone.clone(),
            description: body.description.clone(),
        })
        .await?;

    let mut conn = state.db.get()?;
    let recorded = ledger::record(
        &conn,
        &NewTransaction {
            user_id: user.id.clone(),
            provider: provider_name,
            provider_transaction_id: outcome.provider_transaction_id.clone(),
            kind: TransactionKind::OneTime,
            amount: outcome.amount,
            currency: outcome.currency.clone(),
            provider_data: None,
        },
    )?;

    // Card payments can settle synchronously; the ledger still owns the
    // transition so replayed webhooks stay no-ops.
    let transaction = if outcome.status.is_terminal() {
        match ledger::transition(
            &mut conn,
            provider_name,
            &outcome.provider_transaction_id,
            outcome.status,
            None,
            None,
        )? {
            ledger::TransitionOutcome::Applied(t)
            | ledger::TransitionOutcome::AlreadyProcessed(t) => t,
            ledger::TransitionOutcome::NotFound => recorded.transaction().clone(),
        }
    } else {
        recorded.transaction().clone()
    };

    Ok(Json(PaymentResponse {
        transaction,
        checkout_url: outcome.checkout_url,
    }))
}

// ============ POST /api/payment-methods ============

#[derive(Debug, Deserialize)]
pub struct CreatePaymentMethodBody {
    pub provider: String,
    #[serde(flatten)]
    pub request: CreatePaymentMethodRequest,
}

pub async fn create_payment_method(
    State(state): State<AppState>,
    Json(body): Json<CreatePaymentMethodBody>,
) -> Result<Json<PaymentMethod>> {
    let provider_name = parse_provider(&body.provider)?;

    let user = {
        let conn = state.db.get()?;
        queries::get_user_by_id(&conn, &body.request.user_id)?.or_not_found("User")?
    };

    let mut request = body.request.clone();
    if request.customer_id.is_none() {
        request.customer_id = user.stripe_customer_id.clone();
    }
    if request.phone.is_none() {
        request.phone = user.phone.clone();
    }

    let outcome = state
        .providers
        .get(provider_name)
        .create_payment_method(&request)
        .await?;

    let conn = state.db.get()?;
    let method = queries::insert_payment_method(
        &conn,
        &outcome.payment_method_id,
        &user.id,
        provider_name,
        outcome.kind,
        &outcome.display,
    )?;

    Ok(Json(method))
}

// ============ GET /api/payment-methods?user_id= ============

#[derive(Debug, Deserialize)]
pub struct ListPaymentMethodsQuery {
    pub user_id: String,
}

pub async fn list_payment_methods(
    State(state): State<AppState>,
    Query(query): Query<ListPaymentMethodsQuery>,
) -> Result<Json<Vec<PaymentMethod>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_payment_methods(&conn, &query.user_id)?))
}

// ============ POST /api/payment-methods/{id} ============

pub async fn update_payment_method(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdatePaymentMethodRequest>,
) -> Result<Json<PaymentMethod>> {
    let method = {
        let conn = state.db.get()?;
        queries::get_payment_method(&conn, &id)?.or_not_found("Payment method")?
    };

    let outcome = state
        .providers
        .get(method.provider)
        .update_payment_method(&method.id, &body)
        .await?;

    let conn = state.db.get()?;
    let method = queries::insert_payment_method(
        &conn,
        &outcome.payment_method_id,
        &method.user_id,
        method.provider,
        outcome.kind,
        &outcome.display,
    )?;

    Ok(Json(method))
}

// ============ DELETE /api/payment-methods/{id} ============

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

pub async fn delete_payment_method(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let method = {
        let conn = state.db.get()?;
        queries::get_payment_method(&conn, &id)?.or_not_found("Payment method")?
    };

    let deleted = state
        .providers
        .get(method.provider)
        .delete_payment_method(&method.id)
        .await?;

    if deleted {
        let conn = state.db.get()?;
        queries::delete_payment_method(&conn, &method.id)?;
    }

    Ok(Json(DeleteResponse { deleted }))
}
