//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockledger_inventory::DEFAULT_WAREHOUSE_CODES;

/// Hard upper bound for one ledger page.
pub const MAX_LEDGER_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime settings shared by the engine, the orchestrator and the Postgres backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for one whole operation. Row lock waits have no bound of
    /// their own; they end when this budget runs out.
    #[serde(with = "millis")]
    pub transaction_timeout: Duration,
    /// Reserved warehouse codes. The earliest-created active warehouse carrying
    /// any of them is the default; list order does not matter.
    pub default_warehouse_codes: Vec<String>,
    pub ledger_page_size: u32,
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(30),
            default_warehouse_codes: DEFAULT_WAREHOUSE_CODES.iter().map(|c| c.to_string()).collect(),
            ledger_page_size: 50,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load from `STOCKLEDGER_*` variables and `DATABASE_URL`.
    ///
    /// Missing variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_u64(&lookup, "STOCKLEDGER_TRANSACTION_TIMEOUT_MS")? {
            config.transaction_timeout = Duration::from_millis(ms);
        }
        if let Some(codes) = lookup("STOCKLEDGER_DEFAULT_WAREHOUSE_CODES") {
            config.default_warehouse_codes = codes
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(size) = parse_u64(&lookup, "STOCKLEDGER_LEDGER_PAGE_SIZE")? {
            config.ledger_page_size = u32::try_from(size).unwrap_or(u32::MAX);
        }
        config.database_url = lookup("DATABASE_URL").filter(|u| !u.is_empty());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "transaction_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.ledger_page_size == 0 {
            return Err(ConfigError::Invalid {
                var: "ledger_page_size",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Page size actually used for ledger scans.
    pub fn effective_page_size(&self) -> u32 {
        self.ledger_page_size.clamp(1, MAX_LEDGER_PAGE_SIZE)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
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
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_warehouse_codes, vec!["YYCOM_MAIN", "MAIN"]);
        assert_eq!(config.transaction_timeout, Duration::from_secs(30));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("STOCKLEDGER_TRANSACTION_TIMEOUT_MS", "1500"),
            ("STOCKLEDGER_DEFAULT_WAREHOUSE_CODES", " HQ, ,MAIN "),
            ("STOCKLEDGER_LEDGER_PAGE_SIZE", "5000"),
            ("DATABASE_URL", "postgres://localhost/stock"),
        ]))
        .unwrap();

        assert_eq!(config.transaction_timeout, Duration::from_millis(1500));
        assert_eq!(config.default_warehouse_codes, vec!["HQ", "MAIN"]);
        assert_eq!(config.effective_page_size(), MAX_LEDGER_PAGE_SIZE);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/stock"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("STOCKLEDGER_TRANSACTION_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { var: "STOCKLEDGER_TRANSACTION_TIMEOUT_MS", .. }
        ));

        let err = EngineConfig::from_lookup(lookup(&[("STOCKLEDGER_TRANSACTION_TIMEOUT_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "transaction_timeout", .. }));
    }

    #[test]
    fn deserializes_durations_as_milliseconds() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"transaction_timeout": 2000, "ledger_page_size": 10}"#).unwrap();
        assert_eq!(config.transaction_timeout, Duration::from_secs(2));
        assert_eq!(config.default_warehouse_codes, vec!["YYCOM_MAIN", "MAIN"]);
        assert_eq!(config.ledger_page_size, 10);
    }
}
