use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

const CONFIG_DIR: &str = "config";
const PROFILE_VARS: [&str; 2] = ["RUN_ENV", "APP_ENV"];
const FALLBACK_PROFILE: &str = "development";
const FALLBACK_DATABASE_URL: &str = "sqlite://retail.db?mode=rwc";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Tax applied to order subtotals unless configured otherwise.
pub const DEFAULT_TAX_RATE: Decimal = dec!(0.10);

mod defaults {
    use super::*;

    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn max_connections() -> u32 {
        10
    }
    pub fn min_connections() -> u32 {
        1
    }
    pub fn connect_timeout_secs() -> u64 {
        30
    }
    pub fn idle_timeout_secs() -> u64 {
        600
    }
    pub fn acquire_timeout_secs() -> u64 {
        8
    }
    pub fn tax_rate() -> Decimal {
        DEFAULT_TAX_RATE
    }
    pub fn order_number_prefix() -> String {
        "SO".to_string()
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn event_channel_capacity() -> usize {
        1024
    }
}

/// Runtime settings for the order core and the operator CLI.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Profile name; selects `config/{environment}.toml`.
    #[validate(length(min = 1))]
    pub environment: String,

    #[serde(default = "defaults::log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit log lines as JSON objects.
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "defaults::max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "defaults::min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "defaults::connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "defaults::idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "defaults::acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Fraction of the subtotal charged as tax, `0.10` for ten percent.
    #[serde(default = "defaults::tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Decimal,

    /// Leading segment of generated order numbers (`SO20240315000042`).
    #[serde(default = "defaults::order_number_prefix")]
    #[validate(length(min = 1, max = 8))]
    pub order_number_prefix: String,

    /// Book refunded plain (non-serialized) stock back on hand.
    #[serde(default = "defaults::enabled")]
    pub refund_restocks_inventory: bool,

    #[serde(default = "defaults::event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl AppConfig {
    /// Builds a configuration with every tunable at its default.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: defaults::log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: defaults::max_connections(),
            db_min_connections: defaults::min_connections(),
            db_connect_timeout_secs: defaults::connect_timeout_secs(),
            db_idle_timeout_secs: defaults::idle_timeout_secs(),
            db_acquire_timeout_secs: defaults::acquire_timeout_secs(),
            tax_rate: defaults::tax_rate(),
            order_number_prefix: defaults::order_number_prefix(),
            refund_restocks_inventory: defaults::enabled(),
            event_channel_capacity: defaults::event_channel_capacity(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Could not read configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn invalid(field: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(field);
    err.message = Some(message.into());
    err
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(invalid("log_level", "expected trace, debug, info, warn or error"))
    }
}

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        return Err(invalid("tax_rate", "tax_rate must lie in 0.0..=1.0"));
    }
    Ok(())
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        return Err(invalid("event_channel_capacity", "event channel needs room for at least one event"));
    }
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
/// Calling this twice is harmless; the second install is ignored.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("retail_core={level},retail_cli={level},sea_orm=warn"));

    let builder = fmt().with_env_filter(EnvFilter::new(directive));
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn active_profile() -> String {
    PROFILE_VARS
        .iter()
        .find_map(|var| env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| FALLBACK_PROFILE.to_string())
}

/// Reads `./config`. See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Merges, later sources overriding earlier ones:
///
/// 1. built-in defaults
/// 2. `{config_dir}/default.toml`
/// 3. `{config_dir}/{profile}.toml`, profile taken from `RUN_ENV` or `APP_ENV`
/// 4. `APP__*` environment variables, e.g. `APP__TAX_RATE=0.2`
///
/// Missing files are skipped.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let profile = active_profile();
    info!(profile = %profile, dir = %config_dir.display(), "Loading configuration");

    let config = Config::builder()
        .set_default("database_url", FALLBACK_DATABASE_URL)?
        .set_default("environment", profile.as_str())?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&profile)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    if let Err(errors) = app_config.validate() {
        error!(errors = %errors, "Configuration rejected");
        return Err(AppConfigError::Validation(errors));
    }

    info!(
        environment = %app_config.environment,
        tax_rate = %app_config.tax_rate,
        "Configuration loaded"
    );
    Ok(app_config)
}
