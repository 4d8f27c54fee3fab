//! Environment configuration for the registry service.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub secret_key: String,
    pub webhook_timeout: Duration,
    pub require_tokens: bool,
    pub coinbase_api_key: Option<String>,
    pub coinbase_webhook_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match var("REGISTRY_PORT") {
            Some(s) => s
                .parse()
                .map_err(|_| format!("REGISTRY_PORT is not a valid port: {}", s))?,
            None => 8000,
        };

        let timeout_secs: u64 = match var("WEBHOOK_TIMEOUT_SECS") {
            Some(s) => s
                .parse()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| format!("WEBHOOK_TIMEOUT_SECS must be a positive integer: {}", s))?,
            None => 30,
        };

        let require_tokens = match var("MCP_REQUIRE_TOKENS") {
            Some(s) => parse_flag(&s)
                .ok_or_else(|| format!("MCP_REQUIRE_TOKENS must be true or false: {}", s))?,
            None => true,
        };

        Ok(Self {
            host: var("REGISTRY_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            database_url: var("DATABASE_URL").unwrap_or_else(|| "./agent_registry.db".to_string()),
            secret_key: var("SECRET_KEY").ok_or("SECRET_KEY must be set")?,
            webhook_timeout: Duration::from_secs(timeout_secs),
            require_tokens,
            coinbase_api_key: var("COINBASE_API_KEY"),
            coinbase_webhook_secret: var("COINBASE_WEBHOOK_SECRET"),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
