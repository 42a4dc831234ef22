//! Runtime settings loaded from the environment.

use std::time::Duration;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("JOB_SOFT_TIMEOUT_SECS ({soft}s) must not exceed JOB_HARD_TIMEOUT_SECS ({hard}s)")]
    SoftTimeoutAfterHard { soft: u64, hard: u64 },
}

/// Process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `None` selects the in-memory store.
    pub redis_url: Option<String>,
    pub cache_key_prefix: String,
    pub cache_default_ttl: Duration,
    pub compute_timeout: Duration,
    pub job_hard_timeout: Duration,
    pub job_soft_timeout: Duration,
    pub job_max_attempts: u32,
    pub job_workers: usize,
    /// TTL of job records; `None` keeps them forever.
    pub job_retention: Option<Duration>,
    pub slow_operation_threshold: Duration,
    pub analysis_cache_ttl: Duration,
    pub jwt_secret: Option<String>,
    pub allowed_origins: Vec<String>,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: None,
            cache_key_prefix: "estimation_app".to_string(),
            cache_default_ttl: Duration::from_secs(300),
            compute_timeout: Duration::from_secs(30),
            job_hard_timeout: Duration::from_secs(300),
            job_soft_timeout: Duration::from_secs(240),
            job_max_attempts: 3,
            job_workers: 4,
            job_retention: Some(Duration::from_secs(86_400)),
            slow_operation_threshold: Duration::from_millis(5000),
            analysis_cache_ttl: Duration::from_secs(86_400),
            jwt_secret: None,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            port: 5000,
        }
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`; unset or empty variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            var(name)
                .map(|v| parse::<u64>(name, &v, "a whole number of seconds").map(Duration::from_secs))
                .unwrap_or(Ok(default))
        };

        let settings = Self {
            redis_url: var("REDIS_URL"),
            cache_key_prefix: var("CACHE_KEY_PREFIX").unwrap_or(defaults.cache_key_prefix),
            cache_default_ttl: secs("CACHE_DEFAULT_TTL_SECS", defaults.cache_default_ttl)?,
            compute_timeout: secs("COMPUTE_TIMEOUT_SECS", defaults.compute_timeout)?,
            job_hard_timeout: secs("JOB_HARD_TIMEOUT_SECS", defaults.job_hard_timeout)?,
            job_soft_timeout: secs("JOB_SOFT_TIMEOUT_SECS", defaults.job_soft_timeout)?,
            job_max_attempts: match var("JOB_MAX_ATTEMPTS") {
                Some(v) => positive("JOB_MAX_ATTEMPTS", &v)?,
                None => defaults.job_max_attempts,
            },
            job_workers: match var("JOB_WORKERS") {
                Some(v) => positive::<u32>("JOB_WORKERS", &v)? as usize,
                None => defaults.job_workers,
            },
            job_retention: match var("JOB_RETENTION_SECS") {
                Some(v) => match parse::<u64>("JOB_RETENTION_SECS", &v, "a whole number of seconds")? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                None => defaults.job_retention,
            },
            slow_operation_threshold: match var("SLOW_OPERATION_THRESHOLD_MS") {
                Some(v) => Duration::from_millis(parse(
                    "SLOW_OPERATION_THRESHOLD_MS",
                    &v,
                    "a whole number of milliseconds",
                )?),
                None => defaults.slow_operation_threshold,
            },
            analysis_cache_ttl: secs("ANALYSIS_CACHE_TTL_SECS", defaults.analysis_cache_ttl)?,
            jwt_secret: var("JWT_SECRET_KEY"),
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.allowed_origins),
            port: match var("PORT") {
                Some(v) => parse("PORT", &v, "a port number")?,
                None => defaults.port,
            },
        };

        if settings.job_soft_timeout > settings.job_hard_timeout {
            return Err(ConfigError::SoftTimeoutAfterHard {
                soft: settings.job_soft_timeout.as_secs(),
                hard: settings.job_hard_timeout.as_secs(),
            });
        }

        Ok(settings)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str, expected: &'static str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        name,
        expected,
        value: value.to_string(),
    })
}

fn positive<T: std::str::FromStr + PartialOrd + From<u8>>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    let parsed: T = parse(name, value, "a positive integer")?;
    if parsed < T::from(1) {
        return Err(ConfigError::Invalid {
            name,
            expected: "a positive integer",
            value: value.to_string(),
        });
    }
    Ok(parsed)
}
