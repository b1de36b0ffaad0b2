//! Configuration loading and representation.
//!
//! Everything is read once at startup into an immutable [`AppConfig`] which is
//! then handed to component constructors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use snipstash_auth::{AuthConfig, KEY_SIZE};
use snipstash_observability::LogFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("TOKEN_SYMMETRIC_KEY must be exactly {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone)]
pub struct AppConfig {
    pub token_symmetric_key: Vec<u8>,
    pub access_token_duration: Duration,
    pub refresh_token_duration: Duration,
    pub http_server_address: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub store_timeout: Duration,
    pub enqueue_timeout: Duration,
    pub worker_concurrency: usize,
    pub log_format: LogFormat,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("token_symmetric_key", &"<redacted>")
            .field("access_token_duration", &self.access_token_duration)
            .field("refresh_token_duration", &self.refresh_token_duration)
            .field("http_server_address", &self.http_server_address)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("store_timeout", &self.store_timeout)
            .field("enqueue_timeout", &self.enqueue_timeout)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let key = get("TOKEN_SYMMETRIC_KEY").ok_or(ConfigError::Missing("TOKEN_SYMMETRIC_KEY"))?;
        if key.len() != KEY_SIZE {
            return Err(ConfigError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key.len(),
            });
        }

        Ok(Self {
            token_symmetric_key: key.into_bytes(),
            access_token_duration: duration_setting(&get, "ACCESS_TOKEN_DURATION", "15m")?,
            refresh_token_duration: duration_setting(&get, "REFRESH_TOKEN_DURATION", "24h")?,
            http_server_address: get("HTTP_SERVER_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            store_timeout: duration_setting(&get, "STORE_TIMEOUT", "5s")?,
            enqueue_timeout: duration_setting(&get, "ENQUEUE_TIMEOUT", "3s")?,
            worker_concurrency: number_setting(&get, "WORKER_CONCURRENCY", 4)?,
            log_format: match get("LOG_FORMAT") {
                Some(raw) => raw.parse().map_err(|e: snipstash_observability::UnknownLogFormat| {
                    ConfigError::Invalid {
                        key: "LOG_FORMAT",
                        reason: e.to_string(),
                    }
                })?,
                None => LogFormat::default(),
            },
            argon2_memory_kib: number_setting(&get, "ARGON2_MEMORY_KIB", 19_456)?,
            argon2_iterations: number_setting(&get, "ARGON2_ITERATIONS", 2)?,
            argon2_parallelism: number_setting(&get, "ARGON2_PARALLELISM", 1)?,
        })
    }

    /// Token lifetimes and storage timeout for the auth service.
    pub fn auth_config(&self) -> Result<AuthConfig, ConfigError> {
        let to_chrono = |key: &'static str, d: Duration| {
            chrono::Duration::from_std(d).map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })
        };

        Ok(AuthConfig {
            access_token_ttl: to_chrono("ACCESS_TOKEN_DURATION", self.access_token_duration)?,
            refresh_token_ttl: to_chrono("REFRESH_TOKEN_DURATION", self.refresh_token_duration)?,
            store_timeout: self.store_timeout,
        })
    }
}

fn duration_setting<G>(get: &G, key: &'static str, default: &str) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    parse_duration(&raw).map_err(|reason| ConfigError::Invalid { key, reason })
}

fn number_setting<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse `90s`, `15m`, `1h30m`, `250ms`. A bare number is rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number in `{s}`"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number out of range in `{s}`"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "" => return Err(format!("missing unit in `{s}`")),
            other => return Err(format!("unknown unit `{other}` in `{s}`")),
        };
        rest = &rest[unit_len..];
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("duration overflow in `{s}`"))?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const KEY: &str = "12345678901234567890123456789012";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config = AppConfig::from_lookup(lookup(&[("TOKEN_SYMMETRIC_KEY", KEY)])).unwrap();

        assert_eq!(config.access_token_duration, Duration::from_secs(15 * 60));
        assert_eq!(config.refresh_token_duration, Duration::from_secs(24 * 3600));
        assert_eq!(config.http_server_address, "0.0.0.0:8080");
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.enqueue_timeout, Duration::from_secs(3));
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.argon2_memory_kib, 19_456);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn missing_key_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("TOKEN_SYMMETRIC_KEY"));
    }

    #[test]
    fn short_key_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("TOKEN_SYMMETRIC_KEY", "short")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidKeyLength {
                expected: 32,
                actual: 5
            }
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TOKEN_SYMMETRIC_KEY", KEY),
            ("ACCESS_TOKEN_DURATION", "1h30m"),
            ("WORKER_CONCURRENCY", "8"),
            ("LOG_FORMAT", "pretty"),
            ("DATABASE_URL", "postgres://localhost/snipstash"),
        ]))
        .unwrap();

        assert_eq!(config.access_token_duration, Duration::from_secs(5400));
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/snipstash"));

        let auth = config.auth_config().unwrap();
        assert_eq!(auth.access_token_ttl, chrono::Duration::minutes(90));
    }

    #[test]
    fn bad_values_name_the_setting() {
        let err = AppConfig::from_lookup(lookup(&[
            ("TOKEN_SYMMETRIC_KEY", KEY),
            ("STORE_TIMEOUT", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STORE_TIMEOUT", .. }));

        let err = AppConfig::from_lookup(lookup(&[
            ("TOKEN_SYMMETRIC_KEY", KEY),
            ("WORKER_CONCURRENCY", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. }));
    }

    #[test]
    fn debug_redacts_the_key() {
        let config = AppConfig::from_lookup(lookup(&[("TOKEN_SYMMETRIC_KEY", KEY)])).unwrap();
        assert!(!format!("{config:?}").contains(KEY));
    }

    #[test]
    fn debug_hides_connection_urls() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TOKEN_SYMMETRIC_KEY", KEY),
            ("DATABASE_URL", "postgres://app:pg-hunter2@db/snipstash"),
            ("REDIS_URL", "redis://:redis-hunter2@cache:6379"),
        ]))
        .unwrap();

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("pg-hunter2"));
        assert!(!rendered.contains("redis-hunter2"));
        assert!(rendered.contains("redis_url: Some(\"<set>\")"));
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h15m10s"), Ok(Duration::from_secs(8110)));
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("").is_err());
    }
}
