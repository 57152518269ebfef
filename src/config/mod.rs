use std::str::FromStr;
use std::time::Duration;

use crate::core::error::ConfigError;
use crate::jobs::PollPolicy;
use crate::media::MediaPolicy;
use crate::transport::http::{HttpTransport, RetryPolicy};

pub const HTTP_TIMEOUT_MS_ENV: &str = "GATEWAY_HTTP_TIMEOUT_MS";
pub const HTTP_MAX_ATTEMPTS_ENV: &str = "GATEWAY_HTTP_MAX_ATTEMPTS";
pub const POLL_INTERVAL_MS_ENV: &str = "GATEWAY_POLL_INTERVAL_MS";
pub const POLL_TIMEOUT_MS_ENV: &str = "GATEWAY_POLL_TIMEOUT_MS";
pub const POLL_MAX_ATTEMPTS_ENV: &str = "GATEWAY_POLL_MAX_ATTEMPTS";
pub const MEDIA_MAX_BYTES_ENV: &str = "GATEWAY_MEDIA_MAX_BYTES";
pub const MEDIA_TIMEOUT_MS_ENV: &str = "GATEWAY_MEDIA_TIMEOUT_MS";
pub const MEDIA_ALLOW_PRIVATE_NETWORKS_ENV: &str = "GATEWAY_MEDIA_ALLOW_PRIVATE_NETWORKS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
}

impl HttpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                timeout_ms: self.timeout_ms,
            });
        }
        self.retry_policy.validate()
    }

    pub fn build_transport(&self) -> Result<HttpTransport, ConfigError> {
        HttpTransport::new(self.timeout_ms, self.retry_policy.clone())
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Process-wide settings shared by the runtime and the bundled adapters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GatewayConfig {
    pub http: HttpConfig,
    pub poll: PollPolicy,
    pub media: MediaPolicy,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.validate()?;
        self.poll.validate()?;
        self.media.validate()
    }

    /// Defaults overridden by `GATEWAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Like [`GatewayConfig::from_env`] with an injectable variable lookup.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(timeout_ms) = parse_var::<u64, _>(&lookup, HTTP_TIMEOUT_MS_ENV)? {
            config.http.timeout_ms = timeout_ms;
        }
        if let Some(max_attempts) = parse_var::<u32, _>(&lookup, HTTP_MAX_ATTEMPTS_ENV)? {
            config.http.retry_policy.max_attempts = max_attempts;
        }

        if let Some(interval_ms) = parse_var::<u64, _>(&lookup, POLL_INTERVAL_MS_ENV)? {
            config.poll.interval = Duration::from_millis(interval_ms);
            config.poll.max_interval = config.poll.max_interval.max(config.poll.interval);
        }
        if let Some(timeout_ms) = parse_var::<u64, _>(&lookup, POLL_TIMEOUT_MS_ENV)? {
            // 0 disables the deadline; max_attempts must then bound the loop.
            config.poll.timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        }
        if let Some(max_attempts) = parse_var::<u32, _>(&lookup, POLL_MAX_ATTEMPTS_ENV)? {
            config.poll.max_attempts = Some(max_attempts);
        }

        if let Some(max_bytes) = parse_var::<u64, _>(&lookup, MEDIA_MAX_BYTES_ENV)? {
            config.media.max_bytes = max_bytes;
        }
        if let Some(timeout_ms) = parse_var::<u64, _>(&lookup, MEDIA_TIMEOUT_MS_ENV)? {
            config.media.timeout_ms = timeout_ms;
        }
        if let Some(raw) = non_empty(&lookup, MEDIA_ALLOW_PRIVATE_NETWORKS_ENV) {
            config.media.allow_private_networks =
                parse_bool(MEDIA_ALLOW_PRIVATE_NETWORKS_ENV, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = non_empty(lookup, name) else {
        return Ok(None);
    };

    raw.parse::<T>()
        .map(Some)
        .map_err(|error| ConfigError::InvalidEnvVar {
            name: name.to_string(),
            reason: format!("{raw:?}: {error}"),
        })
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvVar {
            name: name.to_string(),
            reason: format!("{raw:?}: expected a boolean"),
        }),
    }
}
