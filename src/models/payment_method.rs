use serde::{Deserialize, Serialize};

use super::ProviderName;

/// A stored payment instrument. The id is the provider's own token
/// (stripe pm_xxx, payme card token, click phone number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub user_id: String,
    pub provider: ProviderName,
    pub kind: PaymentMethodKind,
    /// Masked display representation ("Visa ****4242", "9989****67")
    pub display: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    Phone,
}

impl PaymentMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Phone => "phone",
        }
    }
}

impl std::str::FromStr for PaymentMethodKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "phone" => Ok(Self::Phone),
            _ => Err(()),
        }
    }
}
