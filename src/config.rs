use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::dispatch::DEFAULT_MAX_BODY_BYTES;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub max_body_bytes: usize,
    pub request_timeout: Option<Duration>,
    pub json_pretty: bool,
    /// `(principal name, token)` pairs.
    pub bearer_tokens: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MAX_BODY_BYTES must be a positive integer")]
    InvalidMaxBodyBytes,
    #[error("REQUEST_TIMEOUT_SECS must be a positive integer")]
    InvalidRequestTimeout,
    #[error("JSON_PRETTY must be `true` or `false`")]
    InvalidJsonPretty,
    #[error("BEARER_TOKENS must be comma-separated `name=token` pairs")]
    InvalidBearerTokens,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 8080,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout: None,
            json_pretty: true,
            bearer_tokens: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Blank values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let bind_addr = var("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let bind_port = var("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(defaults.bind_port);
        let max_body_bytes = var("MAX_BODY_BYTES")
            .map(|value| {
                value
                    .parse::<usize>()
                    .ok()
                    .filter(|limit| *limit > 0)
                    .ok_or(ConfigError::InvalidMaxBodyBytes)
            })
            .transpose()?
            .unwrap_or(defaults.max_body_bytes);
        let request_timeout = var("REQUEST_TIMEOUT_SECS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .ok_or(ConfigError::InvalidRequestTimeout)
            })
            .transpose()?;
        let json_pretty = var("JSON_PRETTY")
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(ConfigError::InvalidJsonPretty),
            })
            .transpose()?
            .unwrap_or(defaults.json_pretty);
        let bearer_tokens = var("BEARER_TOKENS")
            .map(|value| parse_bearer_tokens(&value))
            .transpose()?
            .unwrap_or_default();

        let config = Self {
            bind_addr,
            bind_port,
            max_body_bytes,
            request_timeout,
            json_pretty,
            bearer_tokens,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn parse_bearer_tokens(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, token) = entry
                .split_once('=')
                .ok_or(ConfigError::InvalidBearerTokens)?;
            let (name, token) = (name.trim(), token.trim());
            if name.is_empty() || token.is_empty() {
                return Err(ConfigError::InvalidBearerTokens);
            }
            Ok((name.to_string(), token.to_string()))
        })
        .collect()
}
