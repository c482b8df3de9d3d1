use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::booking::DEFAULT_SLOT_PRICE;
use crate::limits::MAX_PRICE;
use crate::model::Cents;
use crate::store::StoreOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("both FITSLOT_TLS_CERT and FITSLOT_TLS_KEY must be set, or neither")]
    TlsPair,
}

/// Process settings, read once at start-up from `FITSLOT_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Only this user name may log in. `None` admits any.
    pub role: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<(String, String)>,
    pub slot_price: Cents,
    pub currency: String,
    pub lock_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "fitslot".into(),
            role: None,
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            slot_price: DEFAULT_SLOT_PRICE,
            currency: "KZT".into(),
            lock_timeout: Duration::from_millis(5000),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Missing or empty variables keep their defaults; malformed ones fail.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(bind) = get("FITSLOT_BIND") {
            config.bind = bind;
        }
        if let Some(v) = get("FITSLOT_PORT") {
            config.port = parse("FITSLOT_PORT", v)?;
        }
        if let Some(dir) = get("FITSLOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(password) = get("FITSLOT_PASSWORD") {
            config.password = password;
        }
        config.role = get("FITSLOT_USER");
        if let Some(v) = get("FITSLOT_MAX_CONNECTIONS") {
            config.max_connections = positive("FITSLOT_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = get("FITSLOT_COMPACT_THRESHOLD") {
            config.compact_threshold = positive("FITSLOT_COMPACT_THRESHOLD", v)?;
        }
        if let Some(v) = get("FITSLOT_METRICS_PORT") {
            config.metrics_port = Some(parse("FITSLOT_METRICS_PORT", v)?);
        }
        config.tls = match (get("FITSLOT_TLS_CERT"), get("FITSLOT_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => return Err(ConfigError::TlsPair),
        };
        if let Some(v) = get("FITSLOT_SLOT_PRICE") {
            let price: Cents = parse("FITSLOT_SLOT_PRICE", v.clone())?;
            if !(0..=MAX_PRICE).contains(&price) {
                return Err(ConfigError::Invalid {
                    var: "FITSLOT_SLOT_PRICE",
                    value: v,
                    reason: format!("must be between 0 and {MAX_PRICE}"),
                });
            }
            config.slot_price = price;
        }
        if let Some(currency) = get("FITSLOT_CURRENCY") {
            if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(ConfigError::Invalid {
                    var: "FITSLOT_CURRENCY",
                    value: currency,
                    reason: "expected a three-letter ISO code".into(),
                });
            }
            config.currency = currency;
        }
        if let Some(v) = get("FITSLOT_LOCK_TIMEOUT_MS") {
            config.lock_timeout = Duration::from_millis(positive("FITSLOT_LOCK_TIMEOUT_MS", v)?);
        }
        if let Some(v) = get("FITSLOT_SWEEP_INTERVAL_SECS") {
            config.sweep_interval =
                Duration::from_secs(positive("FITSLOT_SWEEP_INTERVAL_SECS", v)?);
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fitslot.wal")
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: self.lock_timeout,
            currency: self.currency.clone(),
        }
    }
}

fn parse<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value,
    })
}

fn positive<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialOrd,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(var, value.clone())?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be positive".into(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.slot_price, 1000);
        assert_eq!(config.store_options().currency, "KZT");
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("FITSLOT_PORT", "6000"),
            ("FITSLOT_DATA_DIR", "/var/lib/fitslot"),
            ("FITSLOT_METRICS_PORT", "9090"),
            ("FITSLOT_SLOT_PRICE", "0"),
            ("FITSLOT_CURRENCY", "USD"),
            ("FITSLOT_LOCK_TIMEOUT_MS", "250"),
            ("FITSLOT_TLS_CERT", "cert.pem"),
            ("FITSLOT_TLS_KEY", "key.pem"),
            ("FITSLOT_USER", "frontdesk"),
        ]))
        .unwrap();
        assert_eq!(config.role.as_deref(), Some("frontdesk"));
        assert_eq!(config.port, 6000);
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/fitslot/fitslot.wal"));
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.slot_price, 0);
        assert_eq!(config.currency, "USD");
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.tls, Some(("cert.pem".into(), "key.pem".into())));
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = Config::from_lookup(lookup(&[("FITSLOT_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FITSLOT_PORT", .. }));

        let err = Config::from_lookup(lookup(&[("FITSLOT_MAX_CONNECTIONS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FITSLOT_MAX_CONNECTIONS", .. }));

        let err = Config::from_lookup(lookup(&[("FITSLOT_SLOT_PRICE", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FITSLOT_SLOT_PRICE", .. }));

        let err = Config::from_lookup(lookup(&[("FITSLOT_CURRENCY", "tenge")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FITSLOT_CURRENCY", .. }));
    }

    #[test]
    fn tls_needs_both_files() {
        let err = Config::from_lookup(lookup(&[("FITSLOT_TLS_CERT", "cert.pem")])).unwrap_err();
        assert_eq!(err, ConfigError::TlsPair);
    }

    #[test]
    fn empty_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[("FITSLOT_PORT", " ")])).unwrap();
        assert_eq!(config.port, 5433);
    }
}
