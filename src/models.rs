//! Configuration
//!
//! Environment-driven runtime configuration with an optional TOML file
//! override (`QUANTBOT_CONFIG`). Every knob the core consumes lives here;
//! helpers translate into per-subsystem config structs.

use crate::bus::EventBusConfig;
use crate::exchange::hyperliquid::HyperliquidConfig;
use crate::risk::RiskLimits;
use crate::types::{DecimalSpec, RoundingMode};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Server
    pub port: u16,
    /// Bearer token required by the control plane; unset disables auth.
    pub api_token: Option<String>,
    pub database_path: String,

    // Venue
    pub venue: String,
    pub testnet: bool,
    pub wallet_address: Option<String>,
    pub private_key: Option<String>,
    /// Symbols subscribed at startup, e.g. ["BTC-USDC", "ETH-USDC"].
    pub symbols: Vec<String>,

    // Rate limiting
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,

    // Order lifecycle
    pub pending_order_timeout_ms: i64,
    pub reconcile_interval_secs: u64,

    // Event bus
    pub event_bus_queue_size: usize,
    pub event_bus_publish_deadline_ms: u64,

    // Market data
    pub bar_interval_ms: i64,

    // Backtest defaults
    pub backtest_fee_rate: Decimal,
    pub backtest_slippage_model: String,
    pub backtest_slippage_value: Decimal,
    pub backtest_initial_capital: Decimal,

    // Risk
    pub risk_max_position_per_symbol: Decimal,
    pub risk_max_order_size: Decimal,
    pub risk_stop_loss_pct: Option<Decimal>,
    pub risk_kill_switch: bool,

    // Decimal conventions
    pub decimal_price_scale: u32,
    pub decimal_size_scale: u32,
    pub decimal_rounding: String,

    // Paper execution
    pub paper_slippage: Decimal,
    pub paper_fee_rate: Decimal,

    // Housekeeping
    pub persist_interval_secs: u64,
    pub max_strategy_errors: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            api_token: None,
            database_path: "./quantbot.db".to_string(),
            venue: "hyperliquid".to_string(),
            testnet: false,
            wallet_address: None,
            private_key: None,
            symbols: vec!["BTC-USDC".to_string()],
            rate_limit_per_sec: 20,
            rate_limit_burst: 20,
            pending_order_timeout_ms: 10_000,
            reconcile_interval_secs: 30,
            event_bus_queue_size: 1024,
            event_bus_publish_deadline_ms: 500,
            bar_interval_ms: 60_000,
            backtest_fee_rate: Decimal::new(5, 4),
            backtest_slippage_model: "proportional".to_string(),
            backtest_slippage_value: Decimal::new(1, 4),
            backtest_initial_capital: Decimal::from(10_000u64),
            risk_max_position_per_symbol: Decimal::from(1_000_000u64),
            risk_max_order_size: Decimal::from(1_000_000u64),
            risk_stop_loss_pct: None,
            risk_kill_switch: false,
            decimal_price_scale: 8,
            decimal_size_scale: 8,
            decimal_rounding: "half_even".to_string(),
            paper_slippage: Decimal::new(1, 4),
            paper_fee_rate: Decimal::new(5, 4),
            persist_interval_secs: 60,
            max_strategy_errors: 10,
        }
    }
}

impl Config {
    /// Load from the environment (`.env` honored), with `QUANTBOT_CONFIG`
    /// optionally naming a TOML file that supplies the base values.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match std::env::var("QUANTBOT_CONFIG") {
            Ok(path) => Self::from_toml_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(value) = std::env::var("PORT") {
            config.port = value.parse().context("PORT")?;
        }
        if let Ok(value) = std::env::var("API_TOKEN") {
            config.api_token = Some(value);
        }
        if let Ok(value) = std::env::var("DATABASE_PATH") {
            config.database_path = value;
        }
        if let Ok(value) = std::env::var("VENUE") {
            config.venue = value;
        }
        if let Ok(value) = std::env::var("TESTNET") {
            config.testnet = matches!(value.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(value) = std::env::var("WALLET_ADDRESS") {
            config.wallet_address = Some(value);
        }
        if let Ok(value) = std::env::var("PRIVATE_KEY") {
            config.private_key = Some(value);
        }
        if let Ok(value) = std::env::var("SYMBOLS") {
            config.symbols = value.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(value) = std::env::var("RATE_LIMIT_PER_SEC") {
            config.rate_limit_per_sec = value.parse().context("RATE_LIMIT_PER_SEC")?;
        }
        if let Ok(value) = std::env::var("PENDING_ORDER_TIMEOUT_MS") {
            config.pending_order_timeout_ms = value.parse().context("PENDING_ORDER_TIMEOUT_MS")?;
        }
        if let Ok(value) = std::env::var("EVENT_BUS_QUEUE_SIZE") {
            config.event_bus_queue_size = value.parse().context("EVENT_BUS_QUEUE_SIZE")?;
        }
        if let Ok(value) = std::env::var("BAR_INTERVAL_MS") {
            config.bar_interval_ms = value.parse().context("BAR_INTERVAL_MS")?;
        }
        if let Ok(value) = std::env::var("RISK_MAX_POSITION_PER_SYMBOL") {
            config.risk_max_position_per_symbol =
                Decimal::from_str(&value).context("RISK_MAX_POSITION_PER_SYMBOL")?;
        }
        if let Ok(value) = std::env::var("RISK_MAX_ORDER_SIZE") {
            config.risk_max_order_size =
                Decimal::from_str(&value).context("RISK_MAX_ORDER_SIZE")?;
        }
        if let Ok(value) = std::env::var("RISK_STOP_LOSS_PCT") {
            config.risk_stop_loss_pct = Some(Decimal::from_str(&value).context("RISK_STOP_LOSS_PCT")?);
        }

        Ok(config)
    }

    pub fn from_toml_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path))
    }

    pub fn decimal_spec(&self) -> DecimalSpec {
        DecimalSpec {
            price_scale: self.decimal_price_scale.max(8),
            size_scale: self.decimal_size_scale.max(8),
            rounding: RoundingMode::from_str(&self.decimal_rounding)
                .unwrap_or(RoundingMode::HalfEven),
        }
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_position_per_symbol: self.risk_max_position_per_symbol,
            max_order_size: self.risk_max_order_size,
            stop_loss_pct: self.risk_stop_loss_pct,
        }
    }

    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            queue_size: self.event_bus_queue_size,
            publish_deadline: Duration::from_millis(self.event_bus_publish_deadline_ms),
            ..Default::default()
        }
    }

    pub fn hyperliquid_config(&self) -> HyperliquidConfig {
        let mut config = HyperliquidConfig::new(self.testnet);
        config.wallet_address = self.wallet_address.clone();
        config.private_key = self.private_key.clone();
        config.rate_limit_per_sec = self.rate_limit_per_sec;
        config.rate_limit_burst = self.rate_limit_burst;
        config
    }

    pub fn backtest_slippage(&self) -> crate::backtest::SlippageModel {
        match self.backtest_slippage_model.as_str() {
            "fixed" => crate::backtest::SlippageModel::Fixed(self.backtest_slippage_value),
            "book" => crate::backtest::SlippageModel::Book(self.backtest_slippage_value),
            _ => crate::backtest::SlippageModel::Proportional(self.backtest_slippage_value),
        }
    }

    /// Whether live trading credentials are configured.
    pub fn live_ready(&self) -> bool {
        self.wallet_address.is_some() && self.private_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.rate_limit_per_sec, 20);
        assert_eq!(config.pending_order_timeout_ms, 10_000);
        assert_eq!(config.event_bus_queue_size, 1024);
        assert_eq!(config.decimal_rounding, "half_even");
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9999\nvenue = \"hyperliquid\"\ntestnet = true\nbacktest_fee_rate = \"0.001\""
        )
        .unwrap();

        let config = Config::from_toml_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 9999);
        assert!(config.testnet);
        assert_eq!(config.backtest_fee_rate, dec!(0.001));
        // Unset keys keep their defaults.
        assert_eq!(config.event_bus_queue_size, 1024);
    }

    #[test]
    fn test_helper_conversions() {
        let config = Config {
            backtest_slippage_model: "fixed".to_string(),
            backtest_slippage_value: dec!(0.5),
            decimal_rounding: "down".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.backtest_slippage(),
            crate::backtest::SlippageModel::Fixed(v) if v == dec!(0.5)
        ));
        assert_eq!(config.decimal_spec().rounding, RoundingMode::Down);
    }
}
