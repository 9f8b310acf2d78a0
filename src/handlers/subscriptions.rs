//! Internal subscription API: the outbound path from our callers to the
//! payment networks. Resolves users, plans, and country pricing before
//! dispatching to the chosen adapter.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::db::{queries, AppState};
use crate::error::{AppError, OptionExt, Result};
use crate::extractors::{Json, Query};
use crate::models::{
    NewSubscription, NewTransaction, ProviderName, Subscription, SubscriptionStatus,
    TransactionKind,
};
use crate::providers::{
    CreateSubscriptionRequest, PaymentProvider, ProviderRegistry, SubscriptionOutcome,
    UpdateSubscriptionRequest,
};
use crate::util::one_month_after;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/subscriptions", post(create_subscription))
        .route(
            "/api/subscriptions/{id}",
            get(get_subscription).delete(cancel_subscription),
        )
        .route("/api/subscriptions/{id}/plan", post(change_plan))
        .route("/api/providers", get(list_providers))
}

fn parse_provider(s: &str) -> Result<ProviderName> {
    s.parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown payment provider: {}", s)))
}

fn ensure_available(provider: ProviderName, country_code: &str) -> Result<()> {
    if !ProviderRegistry::available_for_country(country_code).contains(&provider) {
        return Err(AppError::BadRequest(format!(
            "Provider {} is not available in {}",
            provider, country_code
        )));
    }
    Ok(())
}

// ============ POST /api/subscriptions ============

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionBody {
    pub user_id: String,
    pub plan_id: String,
    pub provider: String,
    #[serde(default)]
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub trial_days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Subscription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    /// True while the network still needs the user to complete payment
    pub requires_action: bool,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<Json<SubscriptionResponse>> {
    let provider_name = parse_provider(&body.provider)?;

    let (user, plan, pricing) = {
        let conn = state.db.get()?;
        let user = queries::get_user_by_id(&conn, &body.user_id)?.or_not_found("User")?;
        ensure_available(provider_name, &user.country_code)?;

        if let Some(existing) = queries::get_active_subscription_for_user(&conn, &user.id)? {
            return Err(AppError::Conflict(format!(
                "User already has an active subscription ({})",
                existing.id
            )));
        }

        let plan = queries::get_plan_by_id(&conn, &body.plan_id)?.or_not_found("Plan")?;
        let pricing = queries::get_pricing_for_country(&conn, &plan.id, &user.country_code)?
            .or_not_found("No pricing available for this plan")?;
        (user, plan, pricing)
    };

    let request = CreateSubscriptionRequest {
        user: user.clone(),
        plan_id: plan.id.clone(),
        plan_name: plan.name.clone(),
        amount: pricing.price_minor,
        currency: pricing.currency.clone(),
        stripe_price_id: pricing.stripe_price_id.clone(),
        payment_method_id: body.payment_method_id.clone(),
        trial_days: body.trial_days,
    };

    let outcome = state
        .providers
        .get(provider_name)
        .create_subscription(&request)
        .await?;

    let conn = state.db.get()?;

    // Cache the lazily-created remote customer on the user row.
    if let Some(ref customer_id) = outcome.customer_id {
        if user.stripe_customer_id.as_deref() != Some(customer_id.as_str()) {
            queries::set_stripe_customer_id(&conn, &user.id, customer_id)?;
        }
    }

    let now = queries::now();
    let period_start = outcome.current_period_start.unwrap_or(now);
    let period_end = outcome
        .current_period_end
        .unwrap_or_else(|| one_month_after(period_start));

    let subscription = queries::insert_subscription(
        &conn,
        &NewSubscription {
            user_id: user.id.clone(),
            plan_id: plan.id.clone(),
            provider: provider_name,
            provider_subscription_id: outcome.provider_subscription_id.clone(),
            status: outcome.status,
            current_period_start: period_start,
            current_period_end: period_end,
            metadata: Some(outcome.raw.clone()),
        },
    )?;

    // Open the ledger row for this attempt; the webhook path settles it.
    crate::ledger::record(
        &conn,
        &NewTransaction {
            user_id: user.id.clone(),
            provider: provider_name,
            provider_transaction_id: outcome.provider_subscription_id.clone(),
            kind: TransactionKind::Subscription,
            amount: pricing.price_minor,
            currency: pricing.currency.clone(),
            provider_data: None,
        },
    )?;

    let requires_action = outcome.status != SubscriptionStatus::Active;
    Ok(Json(SubscriptionResponse {
        subscription,
        checkout_url: outcome.checkout_url,
        requires_action,
    }))
}

// ============ GET /api/subscriptions/{id} ============

#[derive(Debug, Serialize)]
pub struct SubscriptionDetail {
    pub subscription: Subscription,
    /// Authoritative remote state, when the network answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<SubscriptionOutcome>,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionDetail>> {
    let subscription = {
        let conn = state.db.get()?;
        queries::get_subscription_by_id(&conn, &id)?.or_not_found("Subscription")?
    };

    let remote = match state
        .providers
        .get(subscription.provider)
        .get_subscription(&subscription.provider_subscription_id)
        .await
    {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            // The local row still answers; remote state is best-effort.
            tracing::warn!(
                subscription_id = %subscription.id,
                "failed to fetch remote subscription state: {}",
                e
            );
            None
        }
    };

    Ok(Json(SubscriptionDetail { subscription, remote }))
}

// ============ DELETE /api/subscriptions/{id} ============

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Subscription>> {
    let subscription = {
        let conn = state.db.get()?;
        queries::get_subscription_by_id(&conn, &id)?.or_not_found("Subscription")?
    };

    if subscription.status == SubscriptionStatus::Canceled {
        return Ok(Json(subscription));
    }

    let canceled = state
        .providers
        .get(subscription.provider)
        .cancel_subscription(&subscription.provider_subscription_id)
        .await?;
    if !canceled {
        return Err(AppError::Upstream(format!(
            "{} refused to cancel subscription {}",
            subscription.provider, subscription.provider_subscription_id
        )));
    }

    let conn = state.db.get()?;
    queries::cancel_subscription(&conn, &subscription.id)?;
    queries::get_subscription_by_id(&conn, &subscription.id)?
        .or_not_found("Subscription")
        .map(Json)
}

// ============ POST /api/subscriptions/{id}/plan ============

#[derive(Debug, Deserialize)]
pub struct ChangePlanBody {
    pub plan_id: String,
    #[serde(default)]
    pub proration_behavior: Option<String>,
}

pub async fn change_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChangePlanBody>,
) -> Result<Json<SubscriptionDetail>> {
    let (subscription, new_plan, pricing) = {
        let conn = state.db.get()?;
        let subscription =
            queries::get_subscription_by_id(&conn, &id)?.or_not_found("Subscription")?;
        let user = queries::get_user_by_id(&conn, &subscription.user_id)?.or_not_found("User")?;
        let plan = queries::get_plan_by_id(&conn, &body.plan_id)?.or_not_found("Plan")?;
        let pricing = queries::get_pricing_for_country(&conn, &plan.id, &user.country_code)?
            .or_not_found("No pricing available for this plan")?;
        (subscription, plan, pricing)
    };

    // The networks without native plan swaps reject this with guidance;
    // that error flows straight back to the caller as retryable-by-user.
    let outcome = state
        .providers
        .get(subscription.provider)
        .update_subscription(
            &subscription.provider_subscription_id,
            &UpdateSubscriptionRequest {
                stripe_price_id: pricing.stripe_price_id.clone(),
                proration_behavior: body.proration_behavior.clone(),
                payment_method_id: None,
            },
        )
        .await?;

    let conn = state.db.get()?;
    queries::set_subscription_plan(&conn, &subscription.id, &new_plan.id)?;
    let subscription = queries::get_subscription_by_id(&conn, &subscription.id)?
        .or_not_found("Subscription")?;

    Ok(Json(SubscriptionDetail {
        subscription,
        remote: Some(outcome),
    }))
}

// ============ GET /api/providers ============

#[derive(Debug, Deserialize)]
pub struct ProvidersQuery {
    pub country: String,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderName>,
}

pub async fn list_providers(
    Query(query): Query<ProvidersQuery>,
) -> Result<Json<ProvidersResponse>> {
    Ok(Json(ProvidersResponse {
        providers: ProviderRegistry::available_for_country(&query.country),
    }))
}
