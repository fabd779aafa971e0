#![forbid(unsafe_code)]

// Process configuration loaded once from environment variables

use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_RTC_MIN_PORT: u16 = 10000;
const DEFAULT_RTC_MAX_PORT: u16 = 10100;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {name}={value}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("RTC port range {min}..={max} is empty")]
    EmptyPortRange { min: u16, max: u16 },
}

/// Settings shared by every component of the server
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Shared store and cross-node fan-out; in-memory when unset
    pub redis_url: Option<String>,
    /// Public address advertised in ICE candidates
    pub announce_ip: IpAddr,
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub max_connections: usize,
    /// Bearer token guarding `/metrics`
    pub metrics_token: Option<String>,
    pub node_id: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            redis_url: None,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            num_workers: num_cpus::get(),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            metrics_token: None,
            node_id: Uuid::new_v4().to_string(),
        }
    }
}

impl AppConfig {
    /// Reads `PORT`, `REDIS_URL`, `ANNOUNCE_IP`, `NUM_WORKERS`, `RTC_MIN_PORT`,
    /// `RTC_MAX_PORT`, `MAX_CONNECTIONS`, `METRICS_TOKEN` and `NODE_ID`.
    ///
    /// # Errors
    /// Returns an error naming the first variable that fails to parse
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`AppConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            redis_url: non_empty("REDIS_URL"),
            announce_ip: parse_var(&lookup, "ANNOUNCE_IP")?.unwrap_or(defaults.announce_ip),
            num_workers: parse_var(&lookup, "NUM_WORKERS")?.unwrap_or(defaults.num_workers),
            rtc_min_port: parse_var(&lookup, "RTC_MIN_PORT")?.unwrap_or(defaults.rtc_min_port),
            rtc_max_port: parse_var(&lookup, "RTC_MAX_PORT")?.unwrap_or(defaults.rtc_max_port),
            max_connections: parse_var(&lookup, "MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            metrics_token: non_empty("METRICS_TOKEN"),
            node_id: non_empty("NODE_ID").unwrap_or(defaults.node_id),
        };

        if config.num_workers == 0 {
            return Err(invalid("NUM_WORKERS", "0", "at least one worker is required"));
        }
        if config.max_connections == 0 {
            return Err(invalid("MAX_CONNECTIONS", "0", "would reject all connections"));
        }
        if config.rtc_min_port > config.rtc_max_port {
            return Err(ConfigError::EmptyPortRange {
                min: config.rtc_min_port,
                max: config.rtc_max_port,
            });
        }
        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(name, &raw, &e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.redis_url, None);
        assert_eq!(config.announce_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!((config.rtc_min_port, config.rtc_max_port), (10000, 10100));
        assert_eq!(config.max_connections, 10_000);
        assert!(config.num_workers >= 1);
        assert!(Uuid::parse_str(&config.node_id).is_ok());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("REDIS_URL", "redis://cache:6379"),
            ("ANNOUNCE_IP", "203.0.113.7"),
            ("NUM_WORKERS", "3"),
            ("METRICS_TOKEN", "secret"),
            ("NODE_ID", "node-a"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.announce_ip.to_string(), "203.0.113.7");
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.metrics_token.as_deref(), Some("secret"));
        assert_eq!(config.node_id, "node-a");
    }

    #[test]
    fn blank_values_fall_back() {
        let config = load(&[("PORT", " "), ("REDIS_URL", "")]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.redis_url, None);
    }

    #[test]
    fn rejects_bad_values() {
        let err = load(&[("ANNOUNCE_IP", "not-an-ip")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ANNOUNCE_IP", .. }));

        let err = load(&[("MAX_CONNECTIONS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MAX_CONNECTIONS", .. }));

        let err = load(&[("RTC_MIN_PORT", "20000"), ("RTC_MAX_PORT", "10000")]).unwrap_err();
        assert_eq!(err, ConfigError::EmptyPortRange { min: 20000, max: 10000 });
    }
}
