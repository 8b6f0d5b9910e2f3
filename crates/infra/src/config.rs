//! Commerce service configuration.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use std::env;

use chrono::Duration;

use retail_core::Currency;

/// Settings shared by the order, payment and inventory services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommerceConfig {
    /// Currency new orders are priced in
    pub currency: Currency,

    /// How long a pending payment stays payable
    pub payment_expiry: Duration,

    /// Available quantity at or below which a record counts as low stock
    pub low_stock_threshold: i64,

    /// Prefix of generated order numbers (`ORD-00000001`)
    pub order_number_prefix: String,

    /// Prefix of generated payment numbers (`PAY-00000001`)
    pub payment_number_prefix: String,

    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            currency: Currency::USD,
            payment_expiry: Duration::minutes(30),
            low_stock_threshold: 10,
            order_number_prefix: "ORD".to_string(),
            payment_number_prefix: "PAY".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl CommerceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let currency = match lookup("COMMERCE_CURRENCY") {
            Some(raw) => Currency::new(&raw)
                .map_err(|_| ConfigError::InvalidValue("COMMERCE_CURRENCY".to_string()))?,
            None => defaults.currency,
        };

        let expiry_minutes: i64 = parse_or(&lookup, "PAYMENT_EXPIRY_MINUTES", 30)?;
        let payment_expiry = Duration::try_minutes(expiry_minutes)
            .filter(|d| *d > Duration::zero())
            .ok_or_else(|| ConfigError::InvalidValue("PAYMENT_EXPIRY_MINUTES".to_string()))?;

        let low_stock_threshold: i64 =
            parse_or(&lookup, "LOW_STOCK_THRESHOLD", defaults.low_stock_threshold)?;
        if low_stock_threshold < 0 {
            return Err(ConfigError::InvalidValue("LOW_STOCK_THRESHOLD".to_string()));
        }

        let order_number_prefix =
            prefix_or(&lookup, "ORDER_NUMBER_PREFIX", defaults.order_number_prefix)?;
        let payment_number_prefix =
            prefix_or(&lookup, "PAYMENT_NUMBER_PREFIX", defaults.payment_number_prefix)?;

        Ok(Self {
            currency,
            payment_expiry,
            low_stock_threshold,
            order_number_prefix,
            payment_number_prefix,
            log_filter: lookup("LOG_FILTER").unwrap_or(defaults.log_filter),
        })
    }
}

fn parse_or<T: core::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn prefix_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> Result<String, ConfigError> {
    match lookup(key) {
        Some(raw) if raw.trim().is_empty() => Err(ConfigError::InvalidValue(key.to_string())),
        Some(raw) => Ok(raw.trim().to_string()),
        None => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
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
    fn defaults_apply_when_nothing_is_set() {
        let config = CommerceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CommerceConfig::default());
        assert_eq!(config.payment_expiry, Duration::minutes(30));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = CommerceConfig::from_lookup(lookup(&[
            ("COMMERCE_CURRENCY", "eur"),
            ("PAYMENT_EXPIRY_MINUTES", "15"),
            ("LOW_STOCK_THRESHOLD", "3"),
            ("ORDER_NUMBER_PREFIX", "SO"),
            ("LOG_FILTER", "retail_infra=debug"),
        ]))
        .unwrap();

        assert_eq!(config.currency, Currency::EUR);
        assert_eq!(config.payment_expiry, Duration::minutes(15));
        assert_eq!(config.low_stock_threshold, 3);
        assert_eq!(config.order_number_prefix, "SO");
        assert_eq!(config.payment_number_prefix, "PAY");
        assert_eq!(config.log_filter, "retail_infra=debug");
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let expiry =
            |raw: &str| CommerceConfig::from_lookup(lookup(&[("PAYMENT_EXPIRY_MINUTES", raw)]));

        let err = expiry("soon").unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for PAYMENT_EXPIRY_MINUTES");

        let err = expiry("0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var) if var == "PAYMENT_EXPIRY_MINUTES"));

        assert!(CommerceConfig::from_lookup(lookup(&[("COMMERCE_CURRENCY", "dollars")])).is_err());
        assert!(CommerceConfig::from_lookup(lookup(&[("ORDER_NUMBER_PREFIX", "  ")])).is_err());
    }

    #[test]
    fn expiry_beyond_the_duration_range_is_rejected() {
        let huge = i64::MAX.to_string();
        let err = CommerceConfig::from_lookup(lookup(&[("PAYMENT_EXPIRY_MINUTES", &huge)]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var) if var == "PAYMENT_EXPIRY_MINUTES"));

        // A valid window; deadlines past the calendar range are caught at payment creation.
        let config =
            CommerceConfig::from_lookup(lookup(&[("PAYMENT_EXPIRY_MINUTES", "200000000000")]))
                .unwrap();
        assert_eq!(config.payment_expiry, Duration::minutes(200_000_000_000));
    }
}
