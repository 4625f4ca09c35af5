use rusqlite::Connection;

/// Create the ledger, entitlement, and history tables if they don't exist.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Transactions (one row per payment attempt; never deleted)
        -- Amounts are integer minor units
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_email TEXT,
            solution_id TEXT NOT NULL,
            tier TEXT NOT NULL CHECK (tier IN ('free', 'registered', 'pro')),
            gateway TEXT NOT NULL CHECK (gateway IN ('razorpay', 'payu', 'phonepe')),
            gateway_order_id TEXT,
            gateway_payment_id TEXT,
            base_amount INTEGER NOT NULL,
            tax_amount INTEGER NOT NULL DEFAULT 0,
            total_amount INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('initiated', 'pending', 'completed', 'failed', 'refunded', 'unknown')),
            payment_mode TEXT,
            provider_status TEXT,
            provider_checked_at INTEGER,
            invoice_status TEXT NOT NULL DEFAULT 'none' CHECK (invoice_status IN ('none', 'pending', 'issued')),
            billing_info TEXT,
            gateway_raw_data TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_gateway_order ON transactions(gateway, gateway_order_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions(created_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_user_solution ON transactions(user_id, solution_id);

        -- Entitlements (access state per user and solution)
        -- quota_daily_limit = -1 means unlimited
        CREATE TABLE IF NOT EXISTS entitlements (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_email TEXT,
            solution_id TEXT NOT NULL,
            tier TEXT NOT NULL CHECK (tier IN ('free', 'registered', 'pro')),
            token TEXT UNIQUE,
            quota_daily_limit INTEGER NOT NULL,
            daily_usage_count INTEGER NOT NULL DEFAULT 0,
            last_usage_date TEXT,
            tier_expires_at INTEGER,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'expired')),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,

            UNIQUE(user_id, solution_id)
        );
        CREATE INDEX IF NOT EXISTS idx_entitlements_pro_expiry ON entitlements(tier_expires_at) WHERE tier = 'pro';

        -- Subscription history (append-only)
        CREATE TABLE IF NOT EXISTS subscription_events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            solution_id TEXT NOT NULL,
            from_tier TEXT NOT NULL,
            to_tier TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('register', 'upgrade', 'renew', 'expire', 'refund')),
            transaction_id TEXT REFERENCES transactions(id),
            tier_expires_at INTEGER,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_subscription_events_user ON subscription_events(user_id, solution_id);
        -- One history row per (transaction, action): replays can't append twice
        CREATE UNIQUE INDEX IF NOT EXISTS idx_subscription_events_txn_action
            ON subscription_events(transaction_id, action) WHERE transaction_id IS NOT NULL;
        "#,
    )
}
