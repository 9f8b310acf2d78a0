use serde::{Deserialize, Serialize};

/// Minimal projection of the user store that the payment adapters need.
/// Registration and profile data live in the main application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    /// ISO 3166-1 alpha-2, used for plan pricing and provider availability
    pub country_code: String,
    /// Cached remote customer id, created lazily by the card adapter
    pub stripe_customer_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub country_code: String,
}
