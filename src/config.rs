//! Process configuration read once from the environment (and `.env`)

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CORE_URL: &str = "http://localhost:1999";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:26658";
pub const DEFAULT_LEDGER_DB_PATH: &str = "ledger.db";
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error in {}: {}", self.key, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// What Commit reports when the backend fails to assemble the block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitFailurePolicy {
    /// Return an error result and halt block production.
    #[default]
    Report,
    /// Log the failure and return OK with a zero-filled hash.
    Mask,
}

impl FromStr for CommitFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Ok(CommitFailurePolicy::Report),
            "mask" => Ok(CommitFailurePolicy::Mask),
            other => Err(format!("expected 'report' or 'mask', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Detailed,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "detailed" => Ok(LogFormat::Detailed),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'compact', 'detailed' or 'json', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    Static,
    Compensation,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(StrategyKind::Static),
            "compensation" => Ok(StrategyKind::Compensation),
            other => Err(format!("expected 'static' or 'compensation', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub core_url: String,
    pub commit_failure_policy: CommitFailurePolicy,
    pub listen_addr: SocketAddr,
    pub ledger_db_path: String,
    pub query_timeout: Duration,
    pub log_format: LogFormat,
    pub strategy: StrategyKind,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            core_url: DEFAULT_CORE_URL.to_string(),
            commit_failure_policy: CommitFailurePolicy::default(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 26658)),
            ledger_db_path: DEFAULT_LEDGER_DB_PATH.to_string(),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            log_format: LogFormat::default(),
            strategy: StrategyKind::default(),
        }
    }
}

impl AppConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();

        let core_url = lookup("CORE_URL").unwrap_or(defaults.core_url);
        if !(core_url.starts_with("http://") || core_url.starts_with("https://")) {
            return Err(ConfigError {
                key: "CORE_URL".to_string(),
                reason: format!("'{}' is not an http(s) URL", core_url),
            });
        }

        let query_timeout_secs: u64 = parse(&lookup, "QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS)?;
        if query_timeout_secs == 0 {
            return Err(ConfigError {
                key: "QUERY_TIMEOUT_SECS".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        Ok(AppConfig {
            core_url: core_url.trim_end_matches('/').to_string(),
            commit_failure_policy: parse(
                &lookup,
                "COMMIT_FAILURE_POLICY",
                defaults.commit_failure_policy,
            )?,
            listen_addr: parse(&lookup, "LISTEN_ADDR", defaults.listen_addr)?,
            ledger_db_path: lookup("LEDGER_DB_PATH").unwrap_or(defaults.ledger_db_path),
            query_timeout: Duration::from_secs(query_timeout_secs),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,
            strategy: parse(&lookup, "STRATEGY", defaults.strategy)?,
        })
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_commit_failure_policy(mut self, policy: CommitFailurePolicy) -> Self {
        self.commit_failure_policy = policy;
        self
    }

    pub fn with_core_url(mut self, url: &str) -> Self {
        self.core_url = url.trim_end_matches('/').to_string();
        self
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.core_url, "http://localhost:1999");
        assert_eq!(config.commit_failure_policy, CommitFailurePolicy::Report);
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.query_timeout, Duration::from_secs(10));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("CORE_URL", "https://core.internal:2000/"),
            ("COMMIT_FAILURE_POLICY", "Mask"),
            ("LISTEN_ADDR", "0.0.0.0:9000"),
            ("QUERY_TIMEOUT_SECS", "3"),
            ("LOG_FORMAT", "detailed"),
            ("STRATEGY", "compensation"),
        ]))
        .unwrap();
        assert_eq!(config.core_url, "https://core.internal:2000");
        assert_eq!(config.commit_failure_policy, CommitFailurePolicy::Mask);
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.query_timeout, Duration::from_secs(3));
        assert_eq!(config.log_format, LogFormat::Detailed);
        assert_eq!(config.strategy, StrategyKind::Compensation);
    }

    #[test]
    fn test_invalid_values() {
        let err = AppConfig::from_lookup(lookup(&[("COMMIT_FAILURE_POLICY", "ignore")])).unwrap_err();
        assert_eq!(err.key, "COMMIT_FAILURE_POLICY");

        let err = AppConfig::from_lookup(lookup(&[("CORE_URL", "localhost:1999")])).unwrap_err();
        assert_eq!(err.key, "CORE_URL");

        let err = AppConfig::from_lookup(lookup(&[("QUERY_TIMEOUT_SECS", "0")])).unwrap_err();
        assert_eq!(err.key, "QUERY_TIMEOUT_SECS");

        assert!(AppConfig::from_lookup(lookup(&[("LISTEN_ADDR", "nowhere")])).is_err());
    }
}
