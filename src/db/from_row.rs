//! Row mapping trait and helpers for reducing boilerplate in queries.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to
/// rusqlite errors instead of panicking on corrupted data.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const USER_COLS: &str =
    "id, email, name, phone, country_code, stripe_customer_id, created_at, updated_at";

pub const PLAN_COLS: &str = "id, name, tier, is_active, created_at";

pub const PLAN_PRICING_COLS: &str =
    "id, plan_id, country_code, currency, price_minor, stripe_price_id";

pub const TRANSACTION_COLS: &str = "id, user_id, provider, provider_transaction_id, kind, amount, currency, status, provider_data, failure_reason, created_at, updated_at";

pub const SUBSCRIPTION_COLS: &str = "id, user_id, plan_id, provider, provider_subscription_id, status, current_period_start, current_period_end, canceled_at, metadata, created_at, updated_at";

pub const PAYMENT_METHOD_COLS: &str = "id, user_id, provider, kind, display, created_at";

// ============ FromRow Implementations ============

impl FromRow for User {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            country_code: row.get(4)?,
            stripe_customer_id: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

impl FromRow for Plan {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Plan {
            id: row.get(0)?,
            name: row.get(1)?,
            tier: row.get(2)?,
            is_active: row.get::<_, i64>(3)? != 0,
            created_at: row.get(4)?,
        })
    }
}

impl FromRow for PlanPricing {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PlanPricing {
            id: row.get(0)?,
            plan_id: row.get(1)?,
            country_code: row.get(2)?,
            currency: row.get(3)?,
            price_minor: row.get(4)?,
            stripe_price_id: row.get(5)?,
        })
    }
}

impl FromRow for Transaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Transaction {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider: parse_enum(row, 2, "provider")?,
            provider_transaction_id: row.get(3)?,
            kind: parse_enum(row, 4, "kind")?,
            amount: row.get(5)?,
            currency: row.get(6)?,
            status: parse_enum(row, 7, "status")?,
            provider_data: row.get(8)?,
            failure_reason: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl FromRow for Subscription {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Subscription {
            id: row.get(0)?,
            user_id: row.get(1)?,
            plan_id: row.get(2)?,
            provider: parse_enum(row, 3, "provider")?,
            provider_subscription_id: row.get(4)?,
            status: parse_enum(row, 5, "status")?,
            current_period_start: row.get(6)?,
            current_period_end: row.get(7)?,
            canceled_at: row.get(8)?,
            metadata: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl FromRow for PaymentMethod {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PaymentMethod {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider: parse_enum(row, 2, "provider")?,
            kind: parse_enum(row, 3, "kind")?,
            display: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}
