use rusqlite::Connection;

/// Initialize the database schema.
///
/// The UNIQUE constraints on transactions and subscriptions are the
/// service's only concurrency-control primitive: concurrent duplicate
/// webhook deliveries race on the insert and the loser resolves to the
/// winner's row.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Users (projection of the main application's user store)
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            phone TEXT,
            country_code TEXT NOT NULL DEFAULT 'US',
            stripe_customer_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);

        -- Plans (read-only catalog)
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tier TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        );

        -- Regional plan pricing, amounts in minor units
        CREATE TABLE IF NOT EXISTS plan_pricing (
            id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
            country_code TEXT NOT NULL,
            currency TEXT NOT NULL,
            price_minor INTEGER NOT NULL,
            stripe_price_id TEXT,
            UNIQUE(plan_id, country_code)
        );
        CREATE INDEX IF NOT EXISTS idx_plan_pricing_country ON plan_pricing(country_code);

        -- Transaction ledger: every payment attempt across all networks.
        -- Rows are never deleted; status only moves pending -> terminal.
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            provider TEXT NOT NULL CHECK (provider IN ('stripe', 'payme', 'click')),
            provider_transaction_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('subscription', 'one_time')),
            amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'succeeded', 'failed', 'refunded')),
            provider_data TEXT,
            failure_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(provider, provider_transaction_id)
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, status);

        -- Subscriptions, created/extended only by the activator
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            plan_id TEXT NOT NULL REFERENCES plans(id),
            provider TEXT NOT NULL CHECK (provider IN ('stripe', 'payme', 'click')),
            provider_subscription_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'active', 'canceled', 'past_due')),
            current_period_start INTEGER NOT NULL,
            current_period_end INTEGER NOT NULL,
            canceled_at INTEGER,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(provider, provider_subscription_id)
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_user ON subscriptions(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_period_end ON subscriptions(current_period_end);

        -- Stored payment instruments (id = provider's own token)
        CREATE TABLE IF NOT EXISTS payment_methods (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            provider TEXT NOT NULL CHECK (provider IN ('stripe', 'payme', 'click')),
            kind TEXT NOT NULL CHECK (kind IN ('card', 'phone')),
            display TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_payment_methods_user ON payment_methods(user_id);
        "#,
    )?;
    Ok(())
}
