use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub user_id: String,
    pub password: String,
    pub signature: String,
    pub app_id: String,
    pub pay_endpoint: String,      // Adaptive Payments "Pay" API
    pub pay_base_url: String,      // checkout page; pay key is appended
    pub validate_ipn_url: String,  // notification round-trip
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    /// HTTP relay that accepts one JSON message per POST. `None` logs mail instead.
    pub relay_url: Option<String>,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub base_url: String,
    pub paypal: PayPalConfig,
    pub mail: MailConfig,
    pub reminder_sweep_interval: Duration,
    pub admin_enabled: bool,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let session = SessionConfig {
            secret: std::env::var("SESSION_SECRET")?,
            issuer: env_or("SESSION_ISSUER", "paydue"),
            audience: env_or("SESSION_AUDIENCE", "paydue-users"),
        };
        let paypal = PayPalConfig {
            user_id: env_or("PAYPAL_USER_ID", ""),
            password: env_or("PAYPAL_PASSWORD", ""),
            signature: env_or("PAYPAL_SIGNATURE", ""),
            app_id: env_or("PAYPAL_APP_ID", "APP-80W284485P519543T"),
            pay_endpoint: env_or(
                "PAYPAL_PAY_ENDPOINT",
                "https://svcs.sandbox.paypal.com/AdaptivePayments/Pay",
            ),
            pay_base_url: env_or(
                "PAYPAL_PAY_BASE_URL",
                "https://www.sandbox.paypal.com/cgi-bin/webscr?cmd=_ap-payment",
            ),
            validate_ipn_url: env_or(
                "PAYPAL_VALIDATE_IPN_URL",
                "https://www.sandbox.paypal.com/cgi-bin/webscr",
            ),
        };
        let mail = MailConfig {
            relay_url: std::env::var("MAIL_RELAY_URL").ok(),
            sender: env_or("MAIL_SENDER", "Paydue <noreply@paydue.local>"),
        };
        let reminder_sweep_interval = Duration::from_secs(
            std::env::var("REMINDER_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60 * 60),
        );
        let admin_enabled = std::env::var("ADMIN_ENABLED")
            .map(|v| v == "true")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            session,
            base_url: env_or("APP_BASE_URL", "http://localhost:8080"),
            paypal,
            mail,
            reminder_sweep_interval,
            admin_enabled,
        })
    }
}
