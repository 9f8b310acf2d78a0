use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

use super::from_row::{
    query_all, query_one, PAYMENT_METHOD_COLS, PLAN_COLS, PLAN_PRICING_COLS, SUBSCRIPTION_COLS,
    TRANSACTION_COLS, USER_COLS,
};

pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

/// Whether a rusqlite error is a UNIQUE-constraint violation.
/// The ledger uses this to resolve losing concurrent inserts to the
/// existing row instead of erroring.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============ Users ============

pub fn create_user(conn: &Connection, input: &CreateUser) -> Result<User> {
    let id = gen_id();
    let now = now();
    let email = input.email.trim().to_lowercase();

    conn.execute(
        "INSERT INTO users (id, email, name, phone, country_code, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![&id, &email, &input.name, &input.phone, &input.country_code, now, now],
    )?;

    Ok(User {
        id,
        email,
        name: input.name.clone(),
        phone: input.phone.clone(),
        country_code: input.country_code.clone(),
        stripe_customer_id: None,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_user_by_id(conn: &Connection, id: &str) -> Result<Option<User>> {
    query_one(
        conn,
        &format!("SELECT {} FROM users WHERE id = ?1", USER_COLS),
        &[&id],
    )
}

/// Cache the card network's customer id on the user row so it is created
/// at most once per user.
pub fn set_stripe_customer_id(conn: &Connection, user_id: &str, customer_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE users SET stripe_customer_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![customer_id, now(), user_id],
    )?;
    Ok(())
}

// ============ Plans (read-only catalog; writes are seeding only) ============

pub fn create_plan(conn: &Connection, id: &str, name: &str, tier: &str) -> Result<Plan> {
    let now = now();
    conn.execute(
        "INSERT INTO plans (id, name, tier, is_active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
        params![id, name, tier, now],
    )?;
    Ok(Plan {
        id: id.to_string(),
        name: name.to_string(),
        tier: tier.to_string(),
        is_active: true,
        created_at: now,
    })
}

pub fn create_plan_pricing(
    conn: &Connection,
    plan_id: &str,
    country_code: &str,
    currency: &str,
    price_minor: i64,
    stripe_price_id: Option<&str>,
) -> Result<PlanPricing> {
    let id = gen_id();
    conn.execute(
        "INSERT INTO plan_pricing (id, plan_id, country_code, currency, price_minor, stripe_price_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![&id, plan_id, country_code, currency, price_minor, stripe_price_id],
    )?;
    Ok(PlanPricing {
        id,
        plan_id: plan_id.to_string(),
        country_code: country_code.to_string(),
        currency: currency.to_string(),
        price_minor,
        stripe_price_id: stripe_price_id.map(|s| s.to_string()),
    })
}

pub fn get_plan_by_id(conn: &Connection, id: &str) -> Result<Option<Plan>> {
    query_one(
        conn,
        &format!("SELECT {} FROM plans WHERE id = ?1 AND is_active = 1", PLAN_COLS),
        &[&id],
    )
}

/// Price for a plan in exactly this country - no fallback. The click
/// prepare step validates payload amounts against this.
pub fn get_pricing_exact(
    conn: &Connection,
    plan_id: &str,
    country_code: &str,
) -> Result<Option<PlanPricing>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM plan_pricing WHERE plan_id = ?1 AND country_code = ?2",
            PLAN_PRICING_COLS
        ),
        &[&plan_id, &country_code],
    )
}

/// Price for a plan in a given country, falling back to the USD row when
/// no country-specific price exists.
pub fn get_pricing_for_country(
    conn: &Connection,
    plan_id: &str,
    country_code: &str,
) -> Result<Option<PlanPricing>> {
    let exact = get_pricing_exact(conn, plan_id, country_code)?;
    if exact.is_some() {
        return Ok(exact);
    }
    query_one(
        conn,
        &format!(
            "SELECT {} FROM plan_pricing WHERE plan_id = ?1 AND currency = 'USD'",
            PLAN_PRICING_COLS
        ),
        &[&plan_id],
    )
}

// ============ Transactions ============

/// Raw ledger insert. UNIQUE(provider, provider_transaction_id) violations
/// propagate to the caller - use `ledger::record` for conflict-safe inserts.
pub fn insert_transaction(conn: &Connection, input: &NewTransaction) -> Result<Transaction> {
    let id = gen_id();
    let now = now();
    let provider_data = input
        .provider_data
        .as_ref()
        .map(|v| v.to_string());

    conn.execute(
        "INSERT INTO transactions
             (id, user_id, provider, provider_transaction_id, kind, amount, currency, status,
              provider_data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10)",
        params![
            &id,
            &input.user_id,
            input.provider.as_str(),
            &input.provider_transaction_id,
            input.kind.as_str(),
            input.amount,
            &input.currency,
            &provider_data,
            now,
            now
        ],
    )?;

    Ok(Transaction {
        id,
        user_id: input.user_id.clone(),
        provider: input.provider,
        provider_transaction_id: input.provider_transaction_id.clone(),
        kind: input.kind,
        amount: input.amount,
        currency: input.currency.clone(),
        status: TransactionStatus::Pending,
        provider_data,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_transaction_by_provider_id(
    conn: &Connection,
    provider: ProviderName,
    provider_transaction_id: &str,
) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE provider = ?1 AND provider_transaction_id = ?2",
            TRANSACTION_COLS
        ),
        &[&provider.as_str(), &provider_transaction_id],
    )
}

pub fn count_transactions(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

// ============ Subscriptions ============

pub fn insert_subscription(conn: &Connection, input: &NewSubscription) -> Result<Subscription> {
    let id = gen_id();
    let now = now();
    let metadata = input.metadata.as_ref().map(|v| v.to_string());

    conn.execute(
        "INSERT INTO subscriptions
             (id, user_id, plan_id, provider, provider_subscription_id, status,
              current_period_start, current_period_end, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            &id,
            &input.user_id,
            &input.plan_id,
            input.provider.as_str(),
            &input.provider_subscription_id,
            input.status.as_str(),
            input.current_period_start,
            input.current_period_end,
            &metadata,
            now,
            now
        ],
    )?;

    Ok(Subscription {
        id,
        user_id: input.user_id.clone(),
        plan_id: input.plan_id.clone(),
        provider: input.provider,
        provider_subscription_id: input.provider_subscription_id.clone(),
        status: input.status,
        current_period_start: input.current_period_start,
        current_period_end: input.current_period_end,
        canceled_at: None,
        metadata,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_subscription_by_id(conn: &Connection, id: &str) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!("SELECT {} FROM subscriptions WHERE id = ?1", SUBSCRIPTION_COLS),
        &[&id],
    )
}

pub fn get_subscription_by_provider_id(
    conn: &Connection,
    provider: ProviderName,
    provider_subscription_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions WHERE provider = ?1 AND provider_subscription_id = ?2",
            SUBSCRIPTION_COLS
        ),
        &[&provider.as_str(), &provider_subscription_id],
    )
}

/// The user's subscription that currently grants access, if any.
pub fn get_active_subscription_for_user(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<Subscription>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM subscriptions
             WHERE user_id = ?1 AND status IN ('active', 'past_due')
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLS
        ),
        &[&user_id],
    )
}

pub fn count_subscriptions(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM subscriptions", [], |row| row.get(0))?;
    Ok(count)
}

/// Extend a subscription's period and reactivate it (renewal path).
pub fn extend_subscription_period(
    conn: &Connection,
    id: &str,
    period_start: i64,
    period_end: i64,
    metadata: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions
         SET status = 'active', current_period_start = ?1, current_period_end = ?2,
             metadata = COALESCE(?3, metadata), updated_at = ?4
         WHERE id = ?5",
        params![period_start, period_end, metadata, now(), id],
    )?;
    Ok(())
}

pub fn set_subscription_status(
    conn: &Connection,
    id: &str,
    status: SubscriptionStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now(), id],
    )?;
    Ok(())
}

pub fn set_subscription_plan(conn: &Connection, id: &str, plan_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions SET plan_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![plan_id, now(), id],
    )?;
    Ok(())
}

pub fn cancel_subscription(conn: &Connection, id: &str) -> Result<()> {
    let now = now();
    conn.execute(
        "UPDATE subscriptions SET status = 'canceled', canceled_at = ?1, updated_at = ?1
         WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

// ============ Payment methods ============

pub fn insert_payment_method(
    conn: &Connection,
    id: &str,
    user_id: &str,
    provider: ProviderName,
    kind: PaymentMethodKind,
    display: &str,
) -> Result<PaymentMethod> {
    let now = now();
    conn.execute(
        "INSERT OR REPLACE INTO payment_methods (id, user_id, provider, kind, display, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, user_id, provider.as_str(), kind.as_str(), display, now],
    )?;
    Ok(PaymentMethod {
        id: id.to_string(),
        user_id: user_id.to_string(),
        provider,
        kind,
        display: display.to_string(),
        created_at: now,
    })
}

pub fn get_payment_method(conn: &Connection, id: &str) -> Result<Option<PaymentMethod>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payment_methods WHERE id = ?1", PAYMENT_METHOD_COLS),
        &[&id],
    )
}

pub fn list_payment_methods(conn: &Connection, user_id: &str) -> Result<Vec<PaymentMethod>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_methods WHERE user_id = ?1 ORDER BY created_at DESC",
            PAYMENT_METHOD_COLS
        ),
        &[&user_id],
    )
}

pub fn delete_payment_method(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute("DELETE FROM payment_methods WHERE id = ?1", params![id])?;
    Ok(affected > 0)
}
