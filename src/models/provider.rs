use serde::{Deserialize, Serialize};

/// The external payment networks paygate talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    /// Global card processor
    Stripe,
    /// Mobile money, JSON-RPC webhook
    Payme,
    /// Mobile money, two-phase prepare/complete webhook
    Click,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Payme => "payme",
            Self::Click => "click",
        }
    }
}

impl std::str::FromStr for ProviderName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "payme" => Ok(Self::Payme),
            "click" => Ok(Self::Click),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
