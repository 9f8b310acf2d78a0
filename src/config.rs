use std::env;

/// Stripe credentials (card network).
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

/// Payme credentials (mobile money, JSON-RPC webhook).
#[derive(Debug, Clone)]
pub struct PaymeConfig {
    pub merchant_id: String,
    pub secret_key: String,
    pub base_url: String,
}

/// Click credentials (mobile money, prepare/complete webhook).
#[derive(Debug, Clone)]
pub struct ClickConfig {
    pub merchant_id: String,
    pub service_id: String,
    pub secret_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    pub dev_mode: bool,
    /// Bounded timeout for outbound calls to any payment network, in seconds.
    pub provider_timeout_secs: u64,
    pub stripe: StripeConfig,
    pub payme: PaymeConfig,
    pub click: ClickConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("PAYGATE_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://{}:{}", host, port));

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "paygate.db".to_string()),
            base_url,
            dev_mode,
            provider_timeout_secs: env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            stripe: StripeConfig {
                secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
                webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            },
            payme: PaymeConfig {
                merchant_id: env::var("PAYME_MERCHANT_ID").unwrap_or_default(),
                secret_key: env::var("PAYME_SECRET_KEY").unwrap_or_default(),
                base_url: env::var("PAYME_BASE_URL")
                    .unwrap_or_else(|_| "https://checkout.paycom.uz/api".to_string()),
            },
            click: ClickConfig {
                merchant_id: env::var("CLICK_MERCHANT_ID").unwrap_or_default(),
                service_id: env::var("CLICK_SERVICE_ID").unwrap_or_default(),
                secret_key: env::var("CLICK_SECRET_KEY").unwrap_or_default(),
                base_url: env::var("CLICK_BASE_URL")
                    .unwrap_or_else(|_| "https://api.click.uz/v2".to_string()),
            },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
