//! Layered configuration loading utilities.
//!
//! Sources (lowest to highest precedence):
//! 1. `config/default.toml` (optional)
//! 2. `config/local.toml` (optional, ignored in git)
//! 3. Process environment variables, unprefixed, so the documented names
//!    (`DATABASE_URL`, `BOT_TIMEFRAME`, ...) bind directly.
//!
//! Configuration problems are fatal at startup and never mid-run.

use std::path::Path;
use std::str::FromStr;

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use skiff_core::Interval;
use thiserror::Error;

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Raised for unreadable sources or failed validation; both abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Selects between simulated and real execution.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineMode {
    Paper,
    Live,
}

impl EngineMode {
    #[must_use]
    pub fn is_paper(self) -> bool {
        matches!(self, Self::Paper)
    }
}

/// Root application configuration deserialized from layered sources.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default = "default_engine_mode")]
    pub engine_mode: EngineMode,
    #[serde(default = "default_auto_paper")]
    pub auto_paper: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_engine_symbol")]
    pub engine_symbol: String,
    #[serde(default = "default_bot_timeframe")]
    pub bot_timeframe: String,
    #[serde(default = "default_bot_stale_data_ms")]
    pub bot_stale_data_ms: i64,
    #[serde(default = "default_bot_min_expected_edge")]
    pub bot_min_expected_edge: f64,
    #[serde(default = "default_bot_max_position_size_pct")]
    pub bot_max_position_size_pct: f64,
    #[serde(default = "default_bot_max_exposure_pct")]
    pub bot_max_exposure_pct: f64,
    #[serde(default = "default_bot_paper_slippage_bps")]
    pub bot_paper_slippage_bps: Decimal,
    #[serde(default = "default_bot_paper_fee_bps")]
    pub bot_paper_fee_bps: Decimal,
    #[serde(default = "default_bot_loop_ms")]
    pub bot_loop_ms: u64,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub kucoin_api_key: Option<String>,
    #[serde(default)]
    pub kucoin_api_secret: Option<String>,
    #[serde(default)]
    pub kucoin_api_passphrase: Option<String>,
}

impl AppConfig {
    /// Parse the configured timeframe label into an [`Interval`].
    pub fn timeframe(&self) -> ConfigResult<Interval> {
        Interval::from_str(&self.bot_timeframe).map_err(ConfigError::Invalid)
    }

    /// Validate cross-field constraints. LIVE mode without a complete
    /// credential set is a fatal configuration error.
    pub fn validate(&self) -> ConfigResult<()> {
        self.timeframe()?;
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("DATABASE_URL must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "CONFIDENCE_THRESHOLD must lie in [0, 1] (got {})",
                self.confidence_threshold
            )));
        }
        if self.bot_stale_data_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "BOT_STALE_DATA_MS must be positive (got {})",
                self.bot_stale_data_ms
            )));
        }
        if self.bot_loop_ms == 0 {
            return Err(ConfigError::Invalid("BOT_LOOP_MS must be positive".into()));
        }
        for (name, value) in [
            ("BOT_MAX_POSITION_SIZE_PCT", self.bot_max_position_size_pct),
            ("BOT_MAX_EXPOSURE_PCT", self.bot_max_exposure_pct),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must lie in [0, 1] (got {value})"
                )));
            }
        }
        if self.engine_mode == EngineMode::Live {
            let complete = [
                &self.kucoin_api_key,
                &self.kucoin_api_secret,
                &self.kucoin_api_passphrase,
            ]
            .iter()
            .all(|key| key.as_deref().is_some_and(|v| !v.trim().is_empty()));
            if !complete {
                return Err(ConfigError::Invalid(
                    "LIVE mode requires KUCOIN_API_KEY, KUCOIN_API_SECRET and \
                     KUCOIN_API_PASSPHRASE"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_database_url() -> String {
    "./data/skiff.db".into()
}

fn default_backend_port() -> u16 {
    4100
}

fn default_cors_origin() -> String {
    "http://localhost:5173".into()
}

fn default_engine_mode() -> EngineMode {
    EngineMode::Paper
}

fn default_auto_paper() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.6
}

fn default_engine_symbol() -> String {
    "BTC-USDC".into()
}

fn default_bot_timeframe() -> String {
    "1h".into()
}

fn default_bot_stale_data_ms() -> i64 {
    7_200_000
}

fn default_bot_min_expected_edge() -> f64 {
    5e-4
}

fn default_bot_max_position_size_pct() -> f64 {
    0.25
}

fn default_bot_max_exposure_pct() -> f64 {
    0.7
}

fn default_bot_paper_slippage_bps() -> Decimal {
    Decimal::from(4)
}

fn default_bot_paper_fee_bps() -> Decimal {
    Decimal::from(10)
}

fn default_bot_loop_ms() -> u64 {
    15_000
}

fn default_initial_balance() -> Decimal {
    Decimal::from(1_000)
}

fn default_log_level() -> String {
    "info".into()
}

/// Loads configuration by merging optional files and the environment.
pub fn load_config() -> ConfigResult<AppConfig> {
    let base_path = Path::new("config");
    let merged = Config::builder()
        .add_source(File::from(base_path.join("default.toml")).required(false))
        .add_source(File::from(base_path.join("local.toml")).required(false))
        .add_source(Environment::default().try_parsing(true).ignore_empty(true))
        .build()?;
    let config: AppConfig = merged.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
