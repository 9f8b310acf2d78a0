use serde::{Deserialize, Serialize};

/// A subscription plan. The catalog is read-only from paygate's point of
/// view - rows are written only by seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub tier: String,
    pub is_active: bool,
    pub created_at: i64,
}

/// Regional price for a plan. Amounts are minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPricing {
    pub id: String,
    pub plan_id: String,
    pub country_code: String,
    pub currency: String,
    pub price_minor: i64,
    /// Stripe price id (price_xxx) for card-network subscriptions
    pub stripe_price_id: Option<String>,
}
