//! Environment configuration, loaded once at start-up.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing environment variable '{0}'")]
    Missing(&'static str),

    #[error("Invalid {var} value '{value}': {reason}")]
    Invalid { var: &'static str, value: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpesaEnvironment { Sandbox, Production, Test }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayPalEnvironment { Sandbox, Live, Test }

impl MpesaEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Production => "https://api.safaricom.co.ke",
            Self::Sandbox | Self::Test => "https://sandbox.safaricom.co.ke",
        }
    }
}

impl PayPalEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Live => "https://api-m.paypal.com",
            Self::Sandbox | Self::Test => "https://api-m.sandbox.paypal.com",
        }
    }
}

#[derive(Clone, Debug)]
pub struct MpesaConfig {
    pub environment: MpesaEnvironment,
    pub base_url: String,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub shortcode: Option<String>,
    pub passkey: Option<String>,
    pub callback_url: Option<String>,
    /// Simulate when the token endpoint answers 400/401.
    pub allow_simulation_fallback: bool,
}

#[derive(Clone, Debug)]
pub struct PayPalConfig {
    pub environment: PayPalEnvironment,
    pub base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub return_url: String,
    pub cancel_url: String,
    pub currency: String,
    /// Store currency to `currency` multiplier.
    pub exchange_rate: Decimal,
    pub allow_simulation_fallback: bool,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    pub currency: String,
    pub gateway_timeout: Duration,
    pub simulation_delay: Duration,
    pub mpesa: MpesaConfig,
    pub paypal: PayPalConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mpesa_environment = match get("MPESA_ENVIRONMENT").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("sandbox") => MpesaEnvironment::Sandbox,
            Some("production") | Some("live") => MpesaEnvironment::Production,
            Some("test") => MpesaEnvironment::Test,
            Some(other) => return Err(invalid("MPESA_ENVIRONMENT", other, "expected sandbox, production or test")),
        };
        let paypal_environment = match get("PAYPAL_ENVIRONMENT").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("sandbox") => PayPalEnvironment::Sandbox,
            Some("live") | Some("production") => PayPalEnvironment::Live,
            Some("test") => PayPalEnvironment::Test,
            Some(other) => return Err(invalid("PAYPAL_ENVIRONMENT", other, "expected sandbox, live or test")),
        };

        let mpesa = MpesaConfig {
            environment: mpesa_environment,
            base_url: get("MPESA_BASE_URL").unwrap_or_else(|| mpesa_environment.base_url().to_string()),
            consumer_key: get("MPESA_CONSUMER_KEY"),
            consumer_secret: get("MPESA_CONSUMER_SECRET"),
            shortcode: get("MPESA_SHORTCODE"),
            passkey: get("MPESA_PASSKEY"),
            callback_url: get("MPESA_CALLBACK_URL"),
            allow_simulation_fallback: parse_or(
                "MPESA_ALLOW_SIMULATION_FALLBACK",
                get("MPESA_ALLOW_SIMULATION_FALLBACK"),
                mpesa_environment != MpesaEnvironment::Production,
            )?,
        };

        let paypal = PayPalConfig {
            environment: paypal_environment,
            base_url: get("PAYPAL_BASE_URL").unwrap_or_else(|| paypal_environment.base_url().to_string()),
            client_id: get("PAYPAL_CLIENT_ID"),
            client_secret: get("PAYPAL_CLIENT_SECRET"),
            return_url: get("PAYPAL_RETURN_URL").unwrap_or_else(|| "http://localhost:8083/payment/paypal/return".to_string()),
            cancel_url: get("PAYPAL_CANCEL_URL").unwrap_or_else(|| "http://localhost:8083/payment/paypal/cancel".to_string()),
            currency: get("PAYPAL_CURRENCY").unwrap_or_else(|| "USD".to_string()),
            exchange_rate: parse_or("PAYPAL_EXCHANGE_RATE", get("PAYPAL_EXCHANGE_RATE"), Decimal::new(77, 4))?,
            allow_simulation_fallback: parse_or(
                "PAYPAL_ALLOW_SIMULATION_FALLBACK",
                get("PAYPAL_ALLOW_SIMULATION_FALLBACK"),
                paypal_environment != PayPalEnvironment::Live,
            )?,
        };
        if paypal.exchange_rate <= Decimal::ZERO {
            return Err(invalid("PAYPAL_EXCHANGE_RATE", &paypal.exchange_rate.to_string(), "must be positive"));
        }

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("PORT", get("PORT"), 8083)?,
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", get("DATABASE_MAX_CONNECTIONS"), 10)?,
            nats_url: get("NATS_URL"),
            currency: get("STORE_CURRENCY").unwrap_or_else(|| "KES".to_string()),
            gateway_timeout: Duration::from_secs(parse_or("GATEWAY_TIMEOUT_SECS", get("GATEWAY_TIMEOUT_SECS"), 30)?),
            simulation_delay: Duration::from_millis(parse_or("SIMULATION_DELAY_MS", get("SIMULATION_DELAY_MS"), 500)?),
            mpesa,
            paypal,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { var, value: value.to_string(), reason: reason.into() }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|e| invalid(var, &value, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = load(&[("DATABASE_URL", "memory://")]).unwrap();
        assert_eq!(cfg.port, 8083);
        assert_eq!(cfg.currency, "KES");
        assert_eq!(cfg.gateway_timeout, Duration::from_secs(30));
        assert_eq!(cfg.mpesa.environment, MpesaEnvironment::Sandbox);
        assert_eq!(cfg.mpesa.base_url, "https://sandbox.safaricom.co.ke");
        assert!(cfg.mpesa.allow_simulation_fallback);
        assert_eq!(cfg.paypal.exchange_rate, Decimal::new(77, 4));
        assert!(cfg.mpesa.consumer_key.is_none());
    }

    #[test]
    fn test_production_disables_fallback_by_default() {
        let cfg = load(&[("DATABASE_URL", "memory://"), ("MPESA_ENVIRONMENT", "production"), ("PAYPAL_ENVIRONMENT", "live")]).unwrap();
        assert!(!cfg.mpesa.allow_simulation_fallback);
        assert!(!cfg.paypal.allow_simulation_fallback);
        assert_eq!(cfg.paypal.base_url, "https://api-m.paypal.com");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
        assert!(matches!(load(&[("DATABASE_URL", "x"), ("PORT", "eighty")]), Err(ConfigError::Invalid { var: "PORT", .. })));
        assert!(matches!(load(&[("DATABASE_URL", "x"), ("MPESA_ENVIRONMENT", "staging")]), Err(ConfigError::Invalid { var: "MPESA_ENVIRONMENT", .. })));
        assert!(matches!(load(&[("DATABASE_URL", "x"), ("PAYPAL_EXCHANGE_RATE", "0")]), Err(ConfigError::Invalid { .. })));
    }
}
