use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CURRENCY: &str = "PHP";
const DEFAULT_MAX_PAYMENT_ATTEMPTS: u32 = 3;
const CONFIG_DIR: &str = "config";

/// Where a gateway-confirmed order lands.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentPolicy {
    /// Paid orders wait in `processing` until fulfilment marks them completed.
    #[default]
    Processing,
    /// Paid orders are completed immediately (digital or pickup flows).
    Completed,
}

/// Redirect-based e-wallet gateway settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL of the gateway REST API
    #[serde(default = "default_gateway_base_url")]
    #[validate(url)]
    pub base_url: String,

    /// Secret API key, sent as the basic-auth username
    #[serde(default)]
    pub secret_key: String,

    /// Shared secret used to verify webhook signatures; unset disables verification
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Accepted clock skew for signed webhooks (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    /// Source type requested from the gateway (e.g. "gcash", "grab_pay")
    #[serde(default = "default_source_type")]
    pub source_type: String,

    /// Where the gateway sends the customer after a successful authorization
    #[serde(default = "default_success_url")]
    pub success_url: String,

    /// Where the gateway sends the customer after a failed authorization
    #[serde(default = "default_failed_url")]
    pub failed_url: String,

    /// Outbound request timeout (seconds)
    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            secret_key: String::new(),
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            source_type: default_source_type(),
            success_url: default_success_url(),
            failed_url: default_failed_url(),
            request_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// ISO 4217 currency every price and payment is denominated in
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Order status a confirmed payment moves the order to
    #[serde(default)]
    pub fulfillment_policy: FulfillmentPolicy,

    /// Payment attempts allowed per order before only cancellation remains
    #[serde(default = "default_max_payment_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_payment_attempts: u32,

    /// Capacity of the notification channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Payment gateway settings
    #[serde(default)]
    #[validate]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            currency: default_currency(),
            fulfillment_policy: FulfillmentPolicy::default(),
            max_payment_attempts: default_max_payment_attempts(),
            event_channel_capacity: default_event_channel_capacity(),
            gateway: GatewayConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if self.is_production() && self.gateway.webhook_secret.is_none() {
            let mut err = ValidationError::new("webhook_secret_required");
            err.message = Some(
                "Set APP__GATEWAY__WEBHOOK_SECRET in production; unsigned webhooks would move money state"
                    .into(),
            );
            errors.add("gateway", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_max_payment_attempts() -> u32 {
    DEFAULT_MAX_PAYMENT_ATTEMPTS
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_gateway_base_url() -> String {
    "https://api.paymongo.com/v1".to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_source_type() -> String {
    "gcash".to_string()
}

fn default_success_url() -> String {
    "http://localhost:3000/checkout/success".to_string()
}

fn default_failed_url() -> String {
    "http://localhost:3000/checkout/failed".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    15
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("pharmacy_checkout={},tower_http=debug", level);
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(default_directive));

    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://pharmacy.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint check failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            8080,
            "development".into(),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.fulfillment_policy, FulfillmentPolicy::Processing);
        assert_eq!(cfg.max_payment_attempts, 3);
    }

    #[test]
    fn production_requires_webhook_secret() {
        let mut cfg = base_config();
        cfg.environment = "production".into();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.gateway.webhook_secret = Some("whsec_live".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn rejects_unknown_log_level_and_bad_currency() {
        let mut cfg = base_config();
        cfg.log_level = "loud".into();
        cfg.currency = "PESO".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("log_level"));
        assert!(errors.field_errors().contains_key("currency"));
    }

    #[test]
    fn fulfillment_policy_deserializes_snake_case() {
        let policy: FulfillmentPolicy = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(policy, FulfillmentPolicy::Completed);
    }
}
