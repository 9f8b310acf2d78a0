use serde::{Deserialize, Serialize};

use super::ProviderName;

/// A ledger row: one payment attempt on one network.
///
/// `(provider, provider_transaction_id)` is unique - duplicate webhook
/// deliveries for the same remote id always resolve to the same row.
/// Rows are never deleted, only transitioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub provider: ProviderName,
    /// The network's own id for this payment (receipt id, click_trans_id,
    /// payment intent / invoice id)
    pub provider_transaction_id: String,
    pub kind: TransactionKind,
    /// Minor currency units (tiyin, cents)
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    /// Last-known raw data from the network, merged across deliveries (JSON)
    pub provider_data: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Data required to create a new ledger row.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: String,
    pub provider: ProviderName,
    pub provider_transaction_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub currency: String,
    pub provider_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Subscription,
    OneTime,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::OneTime => "one_time",
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "one_time" => Ok(Self::OneTime),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
