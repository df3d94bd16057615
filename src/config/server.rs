use super::{env_opt, env_parse};

/// Process-level settings for the HTTP server and its collaborators
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub cors_allowed_origins: Vec<String>,
    pub webhook_secret: Option<String>,
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_api_key: Option<String>,
    pub notification_webhook_url: Option<String>,
    pub reconcile_interval_seconds: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Self {
            port: env_parse("PORT", 3001),
            database_url: env_opt("DATABASE_URL"),
            cors_allowed_origins,
            webhook_secret: env_opt("WEBHOOK_SECRET"),
            payment_gateway_url: env_opt("PAYMENT_GATEWAY_URL"),
            payment_gateway_api_key: env_opt("PAYMENT_GATEWAY_API_KEY"),
            notification_webhook_url: env_opt("NOTIFICATION_WEBHOOK_URL"),
            reconcile_interval_seconds: env_parse("RECONCILE_INTERVAL_SECONDS", 30),
        }
    }
}
