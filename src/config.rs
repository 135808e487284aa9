use std::env;

use thiserror::Error;
use uuid::Uuid;

/// The default port the gateway will listen on.
pub const DEFAULT_PORT: u16 = 9050;

/// Runtime configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable identifier of this server instance.
    pub server_id: String,
    /// Human-readable server name, embedded in every token.
    pub server_name: String,
    /// Public websocket base url clients connect to.
    pub ws_url: String,
    /// Public HTTP base url track urls are minted under.
    pub url: String,
    /// Port the gateway listens on.
    pub port: u16,
    /// Symmetric key used to sign and verify tokens.
    pub jwt_secret: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set")]
    MissingSecret,
    #[error("SOUNDBOOTH_PORT must be a number: {0}")]
    BadPort(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::MissingSecret)?;

        let port = match env::var("SOUNDBOOTH_PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::BadPort(raw))?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            jwt_secret,
            port,
            server_id: env::var("SOUNDBOOTH_ID").unwrap_or_else(|_| Uuid::new_v4().to_string()),
            server_name: env::var("SOUNDBOOTH_NAME").unwrap_or_else(|_| "soundbooth".to_string()),
            ws_url: env::var("SOUNDBOOTH_WS_URL")
                .unwrap_or_else(|_| format!("ws://localhost:{}/", port)),
            url: env::var("SOUNDBOOTH_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}/", port)),
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn mock() -> Self {
        Self {
            server_id: "test-server".to_string(),
            server_name: "booth test".to_string(),
            ws_url: "ws://localhost:9050/".to_string(),
            url: "http://localhost:9050/".to_string(),
            port: DEFAULT_PORT,
            jwt_secret: "not a secret".to_string(),
        }
    }
}
