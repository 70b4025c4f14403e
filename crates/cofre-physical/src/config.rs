//! Backend and lease configuration
//!
//! Backends are configured through a string-keyed map handed down from
//! the server's configuration file. Every recognized option is parsed
//! once, with environment overrides resolved before validation, into a
//! typed structure that the rest of the crate consumes.

use std::collections::HashMap;
use std::time::Duration;

use cofre_common::{CofreError, Result, DEFAULT_STORAGE_PATH};

/// Environment variable consulted when the configuration map does not
/// set `url`.
pub const URL_ENV: &str = "REDIS_URL";

/// Connection target used when neither the configuration nor the
/// environment provides one.
pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";

const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
const DEFAULT_RENEW_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 5_000;

/// Durations governing one backend's lease locks. Constructed once and
/// shared immutably by every lock the backend hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// How long a claimed lease survives without renewal.
    pub lease_ttl: Duration,
    /// How often the holder extends the lease back to the full TTL.
    pub renew_interval: Duration,
    /// How long a contender waits between claim attempts.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_millis(DEFAULT_LEASE_TTL_MS),
            renew_interval: Duration::from_millis(DEFAULT_RENEW_INTERVAL_MS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
        }
    }
}

impl LockConfig {
    /// Parse the lease durations from the configuration map.
    ///
    /// Recognized keys, all integer milliseconds: `leader_ttl`,
    /// `leader_ttl_renew_interval`, `leader_lock_retry_interval`.
    ///
    /// Renewal must run at least twice per TTL window; otherwise a single
    /// missed renewal can let the lease expire before the next attempt,
    /// so `renew_interval * 2 > lease_ttl` is rejected outright.
    pub fn parse(conf: &HashMap<String, String>) -> Result<Self> {
        let lease_ttl = parse_millis(conf, "leader_ttl", DEFAULT_LEASE_TTL_MS)?;
        let renew_interval =
            parse_millis(conf, "leader_ttl_renew_interval", DEFAULT_RENEW_INTERVAL_MS)?;
        let retry_interval =
            parse_millis(conf, "leader_lock_retry_interval", DEFAULT_RETRY_INTERVAL_MS)?;

        if renew_interval * 2 > lease_ttl {
            return Err(CofreError::InvalidLeaseConfig(format!(
                "renew interval {:?} must be at most half the lease ttl {:?}",
                renew_interval, lease_ttl
            )));
        }

        Ok(Self {
            lease_ttl,
            renew_interval,
            retry_interval,
        })
    }

    /// Round every duration up to a whole multiple of the store's expiry
    /// granularity. Rounding is always upward so the effective TTL is
    /// never shorter than configured.
    pub fn aligned(&self, granularity: Duration) -> Self {
        Self {
            lease_ttl: round_up(self.lease_ttl, granularity),
            renew_interval: round_up(self.renew_interval, granularity),
            retry_interval: round_up(self.retry_interval, granularity),
        }
    }
}

/// Fully parsed backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Namespace root all keys are stored under.
    pub path: String,
    /// Connection target for the backing store.
    pub url: String,
    /// Lease durations shared by all locks of this backend.
    pub lock: LockConfig,
}

impl BackendConfig {
    /// Parse the whole configuration map once, at backend construction.
    ///
    /// `path` defaults to the product namespace; `url` falls back to the
    /// `REDIS_URL` environment variable and then to the local default.
    pub fn parse(conf: &HashMap<String, String>) -> Result<Self> {
        let path = conf
            .get("path")
            .cloned()
            .unwrap_or_else(|| DEFAULT_STORAGE_PATH.to_string());

        let url = conf
            .get("url")
            .cloned()
            .or_else(|| std::env::var(URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_URL.to_string());

        let lock = LockConfig::parse(conf)?;

        Ok(Self { path, url, lock })
    }
}

fn parse_millis(conf: &HashMap<String, String>, key: &str, default_ms: u64) -> Result<Duration> {
    match conf.get(key) {
        None => Ok(Duration::from_millis(default_ms)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| {
                CofreError::ConfigError(format!(
                    "option '{}' must be integer milliseconds, got '{}'",
                    key, raw
                ))
            }),
    }
}

fn round_up(value: Duration, granularity: Duration) -> Duration {
    if granularity.is_zero() {
        return value;
    }
    let gran = granularity.as_nanos();
    let nanos = value.as_nanos();
    let rounded = nanos.div_ceil(gran) * gran;
    Duration::from_nanos(rounded as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_lock_config_defaults() {
        let cfg = LockConfig::parse(&HashMap::new()).unwrap();
        assert_eq!(cfg.lease_ttl, Duration::from_millis(30_000));
        assert_eq!(cfg.renew_interval, Duration::from_millis(1_000));
        assert_eq!(cfg.retry_interval, Duration::from_millis(5_000));
    }

    #[test]
    fn test_lock_config_renew_interval_bound() {
        // 600ms * 2 > 1000ms: a missed renewal could outlive the lease.
        let err = LockConfig::parse(&conf(&[
            ("leader_ttl", "1000"),
            ("leader_ttl_renew_interval", "600"),
        ]))
        .unwrap_err();
        assert!(matches!(err, CofreError::InvalidLeaseConfig(_)));

        // 400ms * 2 <= 1000ms is fine.
        let cfg = LockConfig::parse(&conf(&[
            ("leader_ttl", "1000"),
            ("leader_ttl_renew_interval", "400"),
        ]))
        .unwrap();
        assert_eq!(cfg.renew_interval, Duration::from_millis(400));

        // Exactly half is allowed.
        let cfg = LockConfig::parse(&conf(&[
            ("leader_ttl", "1000"),
            ("leader_ttl_renew_interval", "500"),
        ]))
        .unwrap();
        assert_eq!(cfg.renew_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_lock_config_rejects_non_numeric() {
        let err = LockConfig::parse(&conf(&[("leader_ttl", "thirty")])).unwrap_err();
        assert!(matches!(err, CofreError::ConfigError(_)));
    }

    #[test]
    fn test_aligned_rounds_up_never_down() {
        let cfg = LockConfig {
            lease_ttl: Duration::from_millis(30_500),
            renew_interval: Duration::from_millis(1_001),
            retry_interval: Duration::from_millis(5_000),
        };

        let aligned = cfg.aligned(Duration::from_secs(1));
        assert_eq!(aligned.lease_ttl, Duration::from_secs(31));
        assert_eq!(aligned.renew_interval, Duration::from_secs(2));
        assert_eq!(aligned.retry_interval, Duration::from_secs(5));

        // Millisecond granularity leaves millisecond configs untouched.
        assert_eq!(cfg.aligned(Duration::from_millis(1)), cfg);
    }

    #[test]
    fn test_backend_config_path_default() {
        let cfg = BackendConfig::parse(&HashMap::new()).unwrap();
        assert_eq!(cfg.path, "cofre");

        let cfg = BackendConfig::parse(&conf(&[("path", "secrets")])).unwrap();
        assert_eq!(cfg.path, "secrets");
    }

    #[test]
    fn test_backend_config_explicit_url_wins() {
        let cfg = BackendConfig::parse(&conf(&[("url", "redis://10.0.0.1:6380")])).unwrap();
        assert_eq!(cfg.url, "redis://10.0.0.1:6380");
    }
}
