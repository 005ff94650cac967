//! Engine configuration.
//!
//! Everything has a sensible default; `from_env` overlays `TIDEMARK_*` variables.

use std::time::Duration;

use serde::Serialize;

use crate::http::RetryPolicy;

pub const ENV_WORKERS: &str = "TIDEMARK_WORKERS";
pub const ENV_POLL_INTERVAL_SECS: &str = "TIDEMARK_POLL_INTERVAL_SECS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "TIDEMARK_HTTP_TIMEOUT_SECS";
pub const ENV_HTTP_CONNECT_TIMEOUT_SECS: &str = "TIDEMARK_HTTP_CONNECT_TIMEOUT_SECS";
pub const ENV_HTTP_MAX_RETRIES: &str = "TIDEMARK_HTTP_MAX_RETRIES";
pub const ENV_HTTP_BACKOFF_MS: &str = "TIDEMARK_HTTP_BACKOFF_MS";
pub const ENV_FAILURE_POLICY: &str = "TIDEMARK_FAILURE_POLICY";
pub const ENV_GOOGLE_CLIENT_ID: &str = "GOOGLE_CLIENT_ID";
pub const ENV_GOOGLE_CLIENT_SECRET: &str = "GOOGLE_CLIENT_SECRET";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// What a multi-collection sync does when one collection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log, count the collection as skipped, keep going.
    #[default]
    Continue,
    /// Fail the whole job on the first failing collection.
    Abort,
}

impl core::str::FromStr for FailurePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            _ => Err(()),
        }
    }
}

/// Remote HTTP settings shared by every connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Per-call timeout.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// OAuth client used to refresh calendar tokens.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl core::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Concurrency cap of the worker pool.
    pub workers: usize,
    /// Scheduler cycle length; also the per-account due threshold.
    pub poll_interval: Duration,
    pub http: HttpConfig,
    pub failure_policy: FailurePolicy,
    pub google: OAuthClientConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(600),
            http: HttpConfig::default(),
            failure_policy: FailurePolicy::Continue,
            google: OAuthClientConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each known key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = get(ENV_WORKERS) {
            let workers: usize = parse(ENV_WORKERS, &raw)?;
            if workers == 0 {
                return Err(invalid(ENV_WORKERS, &raw));
            }
            config.workers = workers;
        }
        if let Some(raw) = get(ENV_POLL_INTERVAL_SECS) {
            let secs: u64 = parse(ENV_POLL_INTERVAL_SECS, &raw)?;
            if secs == 0 {
                return Err(invalid(ENV_POLL_INTERVAL_SECS, &raw));
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = get(ENV_HTTP_TIMEOUT_SECS) {
            config.http.timeout = Duration::from_secs(parse(ENV_HTTP_TIMEOUT_SECS, &raw)?);
        }
        if let Some(raw) = get(ENV_HTTP_CONNECT_TIMEOUT_SECS) {
            config.http.connect_timeout =
                Duration::from_secs(parse(ENV_HTTP_CONNECT_TIMEOUT_SECS, &raw)?);
        }
        if let Some(raw) = get(ENV_HTTP_MAX_RETRIES) {
            config.http.retry.max_retries = parse(ENV_HTTP_MAX_RETRIES, &raw)?;
        }
        if let Some(raw) = get(ENV_HTTP_BACKOFF_MS) {
            config.http.retry.base_delay = Duration::from_millis(parse(ENV_HTTP_BACKOFF_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_FAILURE_POLICY) {
            config.failure_policy = raw
                .parse()
                .map_err(|_| invalid(ENV_FAILURE_POLICY, &raw))?;
        }
        if let Some(id) = get(ENV_GOOGLE_CLIENT_ID) {
            config.google.client_id = id.trim().to_string();
        }
        if let Some(secret) = get(ENV_GOOGLE_CLIENT_SECRET) {
            config.google.client_secret = secret.trim().to_string();
        }

        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.http.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_google_client(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.google = OAuthClientConfig {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        };
        self
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn parse<T: core::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(key, raw))
}
