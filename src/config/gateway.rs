use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_optional_env, require_env};
use crate::error::ConfigError;

/// HTTP gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token for the admin-gated routes.
    pub admin_token: SecretString,
    /// Deployment environment name reported by `/healthz`.
    pub env: String,
    pub body_limit_bytes: usize,
    /// Requests per client per minute. `0` disables the limiter.
    pub rate_limit_per_minute: u32,
}

impl GatewayConfig {
    pub fn new(admin_token: impl Into<String>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_token: SecretString::from(admin_token.into()),
            env: "production".to_string(),
            body_limit_bytes: 2 * 1024 * 1024,
            rate_limit_per_minute: 60,
        }
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let admin_token = require_env(
            "ADMIN_TOKEN",
            "set ADMIN_TOKEN to the bearer token admins will use",
        )?;
        let defaults = Self::new(admin_token);
        Ok(Self {
            host: optional_env("HOST")?.unwrap_or(defaults.host.clone()),
            port: parse_optional_env("PORT", defaults.port)?,
            env: optional_env("APP_ENV")?.unwrap_or(defaults.env.clone()),
            body_limit_bytes: parse_optional_env("BODY_LIMIT_BYTES", defaults.body_limit_bytes)?,
            rate_limit_per_minute: parse_optional_env(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            )?,
            admin_token: defaults.admin_token,
        })
    }

    pub fn admin_token(&self) -> &str {
        self.admin_token.expose_secret()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
