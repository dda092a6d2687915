//! Configuration for the order engine.
//!
//! Loads a YAML file with `${VAR}` / `${VAR:-default}` environment variable
//! interpolation, applies per-field defaults, and validates the result.
//! Configuration is immutable after load; components receive it by value or
//! shared reference and never re-read it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use order_engine::config::load_config;
//!
//! let config = load_config(Some("config.yaml"))?;
//! println!("symbol: {}", config.trading.symbol);
//! ```

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::positions::{NettingMode, ReduceRule};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Which broker adapter to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// HTTP bridge to an MT5 terminal.
    Mt5,
    /// In-process paper simulation.
    Paper,
}

/// Intraday session window, in Ulaanbaatar local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Session {
    /// 09:00-12:00.
    Tokyo,
    /// 16:00-02:00, wrapping midnight.
    LdnNy,
    /// Always in session.
    Any,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker adapter configuration.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Symbol, session and risk parameters.
    #[serde(default)]
    pub trading: TradingConfig,
    /// Daily limit guard configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Risk governor configuration.
    #[serde(default)]
    pub governor: GovernorConfig,
    /// Economic news calendar configuration.
    #[serde(default)]
    pub news: NewsConfig,
    /// Durable store configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Reconciler timing configuration.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Worker pool configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Broker adapter selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Which adapter to use.
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    /// MT5 bridge settings (used when `kind` is `mt5`).
    #[serde(default)]
    pub mt5: Mt5Config,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            mt5: Mt5Config::default(),
        }
    }
}

/// MT5 bridge terminal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mt5Config {
    /// Base URL of the bridge HTTP API.
    #[serde(default = "default_mt5_base_url")]
    pub base_url: String,
    /// Per-call timeout in seconds.
    #[serde(default = "default_mt5_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for Mt5Config {
    fn default() -> Self {
        Self {
            base_url: default_mt5_base_url(),
            timeout_secs: default_mt5_timeout_secs(),
        }
    }
}

/// Symbol, session and risk parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Trading symbol.
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Strategy timeframe in minutes.
    #[serde(default = "default_timeframe_min")]
    pub timeframe_min: u32,
    /// Session window.
    #[serde(default = "default_session")]
    pub session: Session,
    /// Equity fraction risked per trade, in (0, 1].
    #[serde(default = "default_risk_pct")]
    pub risk_pct: Decimal,
    /// Stop distance as a multiple of ATR.
    #[serde(default = "default_sl_mult")]
    pub sl_mult: Decimal,
    /// Target distance as a multiple of ATR.
    #[serde(default = "default_tp_mult")]
    pub tp_mult: Decimal,
    /// Minimum ATR for a tradable signal.
    #[serde(default = "default_min_atr")]
    pub min_atr: Decimal,
    /// Cooldown between trades, as a multiple of the timeframe.
    #[serde(default = "default_cooldown_mult")]
    pub cooldown_mult: Decimal,
    /// ATR lookback period in bars.
    #[serde(default = "default_atr_period")]
    pub atr_period: u32,
    /// How same-symbol opposite orders interact.
    #[serde(default = "default_netting_mode")]
    pub netting_mode: NettingMode,
    /// Which positions absorb an opposing order.
    #[serde(default = "default_reduce_rule")]
    pub reduce_rule: ReduceRule,
    /// Short-circuit the broker and record synthetic acceptances.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            timeframe_min: default_timeframe_min(),
            session: default_session(),
            risk_pct: default_risk_pct(),
            sl_mult: default_sl_mult(),
            tp_mult: default_tp_mult(),
            min_atr: default_min_atr(),
            cooldown_mult: default_cooldown_mult(),
            atr_period: default_atr_period(),
            netting_mode: default_netting_mode(),
            reduce_rule: default_reduce_rule(),
            dry_run: false,
        }
    }
}

/// Daily limit guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Enable the daily limit checks.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum trades per trading day.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    /// Maximum concurrently open positions.
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    /// Daily drawdown from baseline that blocks the rest of the day, in percent.
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    /// Path of the keyed limits state file.
    #[serde(default = "default_limits_state_path")]
    pub state_path: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_trades_per_day: default_max_trades_per_day(),
            max_open_positions: default_max_open_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            state_path: default_limits_state_path(),
        }
    }
}

/// Risk governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Maximum trades per session day.
    #[serde(default = "default_session_limit")]
    pub session_limit: u32,
    /// Consecutive losses that trigger the cooldown.
    #[serde(default = "default_loss_streak_threshold")]
    pub loss_streak_threshold: u32,
    /// Cooldown length in minutes once the streak threshold is hit.
    #[serde(default = "default_governor_cooldown_minutes")]
    pub cooldown_minutes: u32,
    /// Path of the governor state document.
    #[serde(default = "default_governor_state_path")]
    pub state_path: String,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            session_limit: default_session_limit(),
            loss_streak_threshold: default_loss_streak_threshold(),
            cooldown_minutes: default_governor_cooldown_minutes(),
            state_path: default_governor_state_path(),
        }
    }
}

/// Economic news calendar configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsConfig {
    /// Enable the news blackout check.
    #[serde(default)]
    pub enabled: bool,
    /// Blackout window around a high-impact event, in minutes.
    #[serde(default = "default_news_window_min")]
    pub window_min: u32,
    /// Calendar API key. Empty disables the feed.
    #[serde(default)]
    pub api_key: String,
    /// Calendar API base URL.
    #[serde(default = "default_news_base_url")]
    pub base_url: String,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_min: default_news_window_min(),
            api_key: String::new(),
            base_url: default_news_base_url(),
        }
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path of the engine database (idempotency ledger + order book).
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Days to keep idempotency rows before purge.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

/// Reconciler timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Background poll interval in seconds.
    #[serde(default = "default_poll_sec")]
    pub poll_sec: f64,
    /// Per-order fill wait timeout in seconds.
    #[serde(default = "default_fill_timeout_sec")]
    pub fill_timeout_sec: f64,
    /// Per-order fill wait poll interval in seconds.
    #[serde(default = "default_fill_poll_sec")]
    pub fill_poll_sec: f64,
    /// Deal history lookback in hours.
    #[serde(default = "default_history_window_hours")]
    pub history_window_hours: u32,
    /// Age after which terminal orders are cleaned up, in hours.
    #[serde(default = "default_cleanup_max_age_hours")]
    pub cleanup_max_age_hours: u32,
    /// Consecutive fill-wait timeouts that raise an operator alert.
    #[serde(default = "default_timeout_alert_threshold")]
    pub timeout_alert_threshold: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_sec: default_poll_sec(),
            fill_timeout_sec: default_fill_timeout_sec(),
            fill_poll_sec: default_fill_poll_sec(),
            history_window_hours: default_history_window_hours(),
            cleanup_max_age_hours: default_cleanup_max_age_hours(),
            timeout_alert_threshold: default_timeout_alert_threshold(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker tasks draining the work queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration from a YAML file with environment variable
/// interpolation.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.yaml");

    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_string(),
        source: e,
    })?;

    load_config_from_string(&contents)
}

/// Load configuration from a YAML string (useful for testing).
///
/// # Errors
///
/// Returns a `ConfigError` if the YAML cannot be parsed or validated.
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let mut result = input.to_string();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    for cap in re.captures_iter(input) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let Some(var_match) = cap.get(1) else {
            continue;
        };
        let full_match = full_match.as_str();
        let var_name = var_match.as_str();
        let default_value = cap.get(2).map(|m| m.as_str());

        let value = match std::env::var(var_name) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.map_or_else(String::new, str::to_string),
        };

        result = result.replace(full_match, &value);
    }

    result
}

/// Validate configuration values.
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.trading.symbol.is_empty() {
        return Err(ConfigError::ValidationError(
            "trading.symbol must not be empty".to_string(),
        ));
    }

    if config.trading.risk_pct <= Decimal::ZERO || config.trading.risk_pct > Decimal::ONE {
        return Err(ConfigError::ValidationError(
            "trading.risk_pct must be in (0, 1]".to_string(),
        ));
    }

    if config.trading.sl_mult <= Decimal::ZERO || config.trading.tp_mult <= Decimal::ZERO {
        return Err(ConfigError::ValidationError(
            "trading.sl_mult and trading.tp_mult must be positive".to_string(),
        ));
    }

    if config.trading.timeframe_min == 0 {
        return Err(ConfigError::ValidationError(
            "trading.timeframe_min must be positive".to_string(),
        ));
    }

    if config.reconciler.poll_sec <= 0.0
        || config.reconciler.fill_timeout_sec <= 0.0
        || config.reconciler.fill_poll_sec <= 0.0
    {
        return Err(ConfigError::ValidationError(
            "reconciler intervals must be positive".to_string(),
        ));
    }

    if config.news.enabled && config.news.api_key.is_empty() {
        return Err(ConfigError::ValidationError(
            "news.api_key is required when news.enabled is true".to_string(),
        ));
    }

    if config.runtime.workers == 0 {
        return Err(ConfigError::ValidationError(
            "runtime.workers must be at least 1".to_string(),
        ));
    }

    Ok(())
}

// ============================================
// Defaults
// ============================================

const fn default_broker_kind() -> BrokerKind {
    BrokerKind::Paper
}

fn default_mt5_base_url() -> String {
    "http://127.0.0.1:18812".to_string()
}

const fn default_mt5_timeout_secs() -> u64 {
    10
}

fn default_symbol() -> String {
    "XAUUSD".to_string()
}

const fn default_timeframe_min() -> u32 {
    30
}

const fn default_session() -> Session {
    Session::Any
}

const fn default_risk_pct() -> Decimal {
    dec!(0.01)
}

const fn default_sl_mult() -> Decimal {
    dec!(1.5)
}

const fn default_tp_mult() -> Decimal {
    dec!(3.0)
}

const fn default_min_atr() -> Decimal {
    dec!(1.2)
}

const fn default_cooldown_mult() -> Decimal {
    dec!(1.0)
}

const fn default_atr_period() -> u32 {
    14
}

const fn default_netting_mode() -> NettingMode {
    NettingMode::Netting
}

const fn default_reduce_rule() -> ReduceRule {
    ReduceRule::Fifo
}

const fn default_true() -> bool {
    true
}

const fn default_max_trades_per_day() -> u32 {
    8
}

const fn default_max_open_positions() -> u32 {
    1
}

const fn default_max_daily_loss_pct() -> Decimal {
    dec!(3.0)
}

fn default_limits_state_path() -> String {
    "state/limits.json".to_string()
}

const fn default_session_limit() -> u32 {
    6
}

const fn default_loss_streak_threshold() -> u32 {
    3
}

const fn default_governor_cooldown_minutes() -> u32 {
    30
}

fn default_governor_state_path() -> String {
    "state/governor.json".to_string()
}

const fn default_news_window_min() -> u32 {
    60
}

fn default_news_base_url() -> String {
    "https://api.tradingeconomics.com".to_string()
}

fn default_db_path() -> String {
    "state/engine.db".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

const fn default_poll_sec() -> f64 {
    2.0
}

const fn default_fill_timeout_sec() -> f64 {
    3.0
}

const fn default_fill_poll_sec() -> f64 {
    0.25
}

const fn default_history_window_hours() -> u32 {
    2
}

const fn default_cleanup_max_age_hours() -> u32 {
    24
}

const fn default_timeout_alert_threshold() -> u32 {
    3
}

const fn default_workers() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let config = load_config_from_string("{}").unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Paper);
        assert_eq!(config.trading.symbol, "XAUUSD");
        assert_eq!(config.trading.session, Session::Any);
        assert_eq!(config.trading.risk_pct, dec!(0.01));
        assert_eq!(config.limits.max_trades_per_day, 8);
        assert_eq!(config.governor.loss_streak_threshold, 3);
        assert!((config.reconciler.poll_sec - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.persistence.retention_days, 30);
        assert!(!config.trading.dry_run);
    }

    #[test]
    fn parses_full_config() {
        let yaml = r"
broker:
  kind: mt5
  mt5:
    base_url: http://localhost:9999
trading:
  symbol: EURUSD
  timeframe_min: 15
  session: TOKYO
  risk_pct: 0.02
  netting_mode: HEDGING
  reduce_rule: PROPORTIONAL
  dry_run: true
governor:
  session_limit: 4
reconciler:
  poll_sec: 0.5
";
        let config = load_config_from_string(yaml).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Mt5);
        assert_eq!(config.broker.mt5.base_url, "http://localhost:9999");
        assert_eq!(config.trading.symbol, "EURUSD");
        assert_eq!(config.trading.session, Session::Tokyo);
        assert_eq!(config.trading.netting_mode, NettingMode::Hedging);
        assert_eq!(config.trading.reduce_rule, ReduceRule::Proportional);
        assert!(config.trading.dry_run);
        assert_eq!(config.governor.session_limit, 4);
    }

    #[test]
    fn rejects_out_of_range_risk_pct() {
        let err = load_config_from_string("trading:\n  risk_pct: 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn rejects_news_enabled_without_api_key() {
        let err = load_config_from_string("news:\n  enabled: true\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn env_interpolation_with_default() {
        let yaml = "trading:\n  symbol: ${ORDER_ENGINE_TEST_SYMBOL:-GBPUSD}\n";
        let config = load_config_from_string(yaml).unwrap();
        assert_eq!(config.trading.symbol, "GBPUSD");
    }

    #[test]
    fn rejects_zero_workers() {
        let err = load_config_from_string("runtime:\n  workers: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
