//! Environment-driven server configuration.
//!
//! Every setting has a default; numbers that fail to parse fall back to it.

use std::path::PathBuf;
use std::time::Duration;

use crate::recommend::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommenderConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// `None` when no endpoint is set; reservations then carry the fallback text.
    pub recommender: Option<RecommenderConfig>,
}

const DEFAULT_PORT: u16 = 5433;
const DEFAULT_MAX_CONNECTIONS: usize = 256;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_RECOMMENDER_TIMEOUT_MS: u64 = 5000;

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value source, so tests never touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str| get(name).and_then(|v| v.trim().parse::<u64>().ok());

        let defaults = RetryPolicy::default();
        let recommender = get("PITSTOP_RECOMMENDER_URL").map(|url| RecommenderConfig {
            url,
            api_key: get("PITSTOP_RECOMMENDER_API_KEY"),
            model: get("PITSTOP_RECOMMENDER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            timeout: Duration::from_millis(
                parsed("PITSTOP_RECOMMENDER_TIMEOUT_MS").unwrap_or(DEFAULT_RECOMMENDER_TIMEOUT_MS),
            ),
            retry: RetryPolicy {
                max_attempts: parsed("PITSTOP_RECOMMENDER_MAX_ATTEMPTS")
                    .and_then(|n| usize::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.max_attempts),
                base_backoff_ms: parsed("PITSTOP_RECOMMENDER_BACKOFF_MS")
                    .unwrap_or(defaults.base_backoff_ms),
            },
        });

        Self {
            bind: get("PITSTOP_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: get("PITSTOP_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_PORT),
            data_dir: PathBuf::from(get("PITSTOP_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PITSTOP_PASSWORD").unwrap_or_else(|| "pitstop".into()),
            admin_user: get("PITSTOP_ADMIN_USER").unwrap_or_else(|| "admin".into()),
            max_connections: parsed("PITSTOP_MAX_CONNECTIONS")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            compact_threshold: parsed("PITSTOP_COMPACT_THRESHOLD")
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            tls_cert: get("PITSTOP_TLS_CERT"),
            tls_key: get("PITSTOP_TLS_KEY"),
            metrics_port: get("PITSTOP_METRICS_PORT").and_then(|v| v.trim().parse().ok()),
            recommender,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("pitstop.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/pitstop.wal"));
        assert_eq!(config.password, "pitstop");
        assert_eq!(config.admin_user, "admin");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert!(config.tls_cert.is_none() && config.tls_key.is_none());
        assert!(config.recommender.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = config_from(&[
            ("PITSTOP_BIND", "127.0.0.1"),
            ("PITSTOP_PORT", "6543"),
            ("PITSTOP_DATA_DIR", "/var/lib/pitstop"),
            ("PITSTOP_ADMIN_USER", "boss"),
            ("PITSTOP_MAX_CONNECTIONS", "8"),
            ("PITSTOP_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/pitstop/pitstop.wal"));
        assert_eq!(config.admin_user, "boss");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = config_from(&[
            ("PITSTOP_PORT", "not-a-port"),
            ("PITSTOP_MAX_CONNECTIONS", "0"),
            ("PITSTOP_COMPACT_THRESHOLD", "-5"),
            ("PITSTOP_METRICS_PORT", "99999"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn recommender_enabled_by_url() {
        let config = config_from(&[
            ("PITSTOP_RECOMMENDER_URL", "http://llm.local/v1/chat/completions"),
            ("PITSTOP_RECOMMENDER_API_KEY", "sk-test"),
            ("PITSTOP_RECOMMENDER_TIMEOUT_MS", "1200"),
            ("PITSTOP_RECOMMENDER_MAX_ATTEMPTS", "5"),
        ]);
        let recommender = config.recommender.unwrap();
        assert_eq!(recommender.url, "http://llm.local/v1/chat/completions");
        assert_eq!(recommender.api_key.as_deref(), Some("sk-test"));
        assert_eq!(recommender.model, "gpt-4o-mini");
        assert_eq!(recommender.timeout, Duration::from_millis(1200));
        assert_eq!(recommender.retry.max_attempts, 5);
        assert_eq!(recommender.retry.base_backoff_ms, 250);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("PITSTOP_RECOMMENDER_URL", "  "), ("PITSTOP_PASSWORD", "")]);
        assert!(config.recommender.is_none());
        assert_eq!(config.password, "pitstop");
    }
}
