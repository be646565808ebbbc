//! Reconnect policy and client options, with environment-variable loading.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Backoff parameters for the reconnect manager.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.5,
        }
    }
}

impl ReconnectPolicy {
    pub fn no_reconnect() -> Self {
        Self {
            auto_reconnect: false,
            ..Default::default()
        }
    }

    /// Computes `delay(n) = min(cap, base * 2^n)` without jitter; the caller
    /// applies jitter separately so it can be tested deterministically.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Top-level options for the connection orchestrator.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub user_agent: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: None,
            reconnect: ReconnectPolicy::default(),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builds options from `HOMELINK_URL` and the `HOMELINK_RECONNECT_*`
    /// family of environment variables, applying `${VAR}` / `${VAR:-default}`
    /// expansion to each value the same way the rest of this codebase
    /// expands configuration strings.
    pub fn from_env() -> ConfigResult<Self> {
        let url = expand_env_var("${HOMELINK_URL}").ok_or(ConfigError::InvalidUrl {
            reason: "HOMELINK_URL is not set".into(),
        })?;
        if url.is_empty() {
            return Err(ConfigError::InvalidUrl {
                reason: "HOMELINK_URL is not set".into(),
            });
        }

        let mut opts = ClientOptions::new(url);

        if let Some(base_ms) = std::env::var("HOMELINK_RECONNECT_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            opts.reconnect.base_delay = Duration::from_millis(base_ms);
        }
        if let Some(max_ms) = std::env::var("HOMELINK_RECONNECT_MAX_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            opts.reconnect.max_delay = Duration::from_millis(max_ms);
        }
        if let Ok(auto) = std::env::var("HOMELINK_RECONNECT_AUTO") {
            opts.reconnect.auto_reconnect = auto != "false" && auto != "0";
        }

        Ok(opts)
    }
}

/// Expands `${VAR}` and `${VAR:-default}` occurrences in `input` against the
/// process environment. Unmatched variables with no default expand to the
/// empty string.
pub fn expand_env_var(input: &str) -> Option<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(:-([^}]*))?\}").ok()?;
    if !re.is_match(input) {
        return Some(input.to_string());
    }
    let mut result = input.to_string();
    for cap in re.captures_iter(input) {
        let full_match = cap.get(0)?.as_str();
        let var_name = cap.get(1)?.as_str();
        let default_value = cap.get(3).map(|m| m.as_str());
        let value = std::env::var(var_name)
            .ok()
            .or_else(|| default_value.map(String::from))
            .unwrap_or_default();
        result = result.replace(full_match, &value);
    }
    Some(result)
}
