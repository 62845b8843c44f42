use std::time::Duration;

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_duration_ms_env};
use crate::error::ConfigError;

/// Signed webhook trigger.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: SecretString,
    /// Largest accepted distance between the sender's timestamp and server time.
    pub drift: Duration,
    /// True when no secret was configured and a random one was generated.
    pub generated: bool,
}

impl WebhookConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            drift: Duration::from_secs(300),
            generated: false,
        }
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let mut config = match optional_env("RTA_WEBHOOK_SECRET")? {
            Some(secret) => Self::new(secret),
            None => {
                tracing::warn!(
                    "RTA_WEBHOOK_SECRET is not set; generated a random secret, webhook callers will be rejected"
                );
                let mut config = Self::new(random_secret());
                config.generated = true;
                config
            }
        };
        config.drift = parse_duration_ms_env("WEBHOOK_DRIFT_MS", config.drift)?;
        Ok(config)
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

/// 32 random bytes, hex-encoded.
fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
