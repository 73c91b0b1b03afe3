//! REST Handlers
//!
//! Strategy and backtest lifecycle endpoints consumed by the CLI and UI.

use crate::api::{ApiError, AppState};
use crate::backtest::{
    load_csv, synthetic_sine, BacktestConfig, SyntheticSeriesGenerator, VecFeed,
};
use crate::engine::{
    BacktestInfo, EngineManager, RunnerConfig, RunnerInfo, RunnerMode, StrategyRunner,
};
use crate::error::CoreError;
use crate::strategy::{build_strategy, StrategyParams};
use crate::types::TradingPair;
use axum::extract::{Path, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tracing::info;

fn parse_pairs(
    symbol: &Option<String>,
    symbols: &Option<Vec<String>>,
) -> Result<Vec<TradingPair>, ApiError> {
    let mut raw: Vec<String> = Vec::new();
    if let Some(symbol) = symbol {
        raw.push(symbol.clone());
    }
    if let Some(symbols) = symbols {
        raw.extend(symbols.iter().cloned());
    }
    if raw.is_empty() {
        return Err(CoreError::Validation("missing symbol".into()).into());
    }
    raw.iter()
        .map(|s| {
            TradingPair::from_str(s).map_err(|e| ApiError(CoreError::Validation(e)))
        })
        .collect()
}

// === Strategy lifecycle ===

#[derive(Debug, Deserialize)]
pub struct StartStrategyRequest {
    pub strategy: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub mode: Option<RunnerMode>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub id: String,
}

pub async fn start_strategy(
    State(state): State<AppState>,
    Json(request): Json<StartStrategyRequest>,
) -> Result<Json<StartedResponse>, ApiError> {
    let pairs = parse_pairs(&request.symbol, &request.symbols)?;
    let mode = request.mode.unwrap_or(RunnerMode::Paper);

    let execution = match mode {
        RunnerMode::Paper => state.paper_execution.clone(),
        RunnerMode::Live => state.live_execution.clone().ok_or_else(|| {
            ApiError(CoreError::Validation(
                "live mode requires wallet credentials".into(),
            ))
        })?,
        RunnerMode::Backtest => {
            return Err(CoreError::Validation(
                "use /backtest/run for backtest mode".into(),
            )
            .into())
        }
    };

    let params = StrategyParams::from_json(&request.params);
    let strategy = build_strategy(&request.strategy, &params)?;

    let config = RunnerConfig {
        id: EngineManager::new_runner_id(),
        strategy: request.strategy.clone(),
        mode,
        venue: state.config.venue.clone(),
        pairs,
        params,
        max_strategy_errors: state.config.max_strategy_errors,
    };

    info!(id = %config.id, strategy = %config.strategy, ?mode, "starting strategy runner");
    let runner = StrategyRunner::new(
        config,
        strategy,
        execution,
        state.cache.clone(),
        state.bus.clone(),
    );
    let id = state.manager.register_runner(runner.spawn());
    Ok(Json(StartedResponse { id }))
}

pub async fn list_strategies(
    State(state): State<AppState>,
) -> Result<Json<Vec<RunnerInfo>>, ApiError> {
    Ok(Json(state.manager.list_runners()))
}

pub async fn get_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunnerInfo>, ApiError> {
    Ok(Json(state.manager.runner(&id)?))
}

pub async fn delete_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.stop_runner(&id).await?;
    state.manager.remove_runner(&id);
    Ok(Json(json!({"stopped": id})))
}

pub async fn pause_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunnerInfo>, ApiError> {
    state.manager.pause_runner(&id).await?;
    Ok(Json(state.manager.runner(&id)?))
}

pub async fn resume_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunnerInfo>, ApiError> {
    state.manager.resume_runner(&id).await?;
    Ok(Json(state.manager.runner(&id)?))
}

// === Backtests ===

/// Bar source for a backtest run.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// `timestamp_ms,open,high,low,close,volume` rows.
    Csv { path: String },
    /// Synthetic series. With a `seed`, a reproducible ChaCha-seeded random
    /// walk of `amplitude` volatility; without one, a closed-form sine wave
    /// whose crossings land on known bars.
    Synthetic {
        bars: usize,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default = "default_base")]
        base: Decimal,
        #[serde(default = "default_amplitude")]
        amplitude: Decimal,
        #[serde(default = "default_period")]
        period: usize,
    },
}

fn default_base() -> Decimal {
    Decimal::from(100u64)
}

fn default_amplitude() -> Decimal {
    Decimal::from(10u64)
}

fn default_period() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct RunBacktestRequest {
    pub strategy: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    pub data: DataSource,
    #[serde(default)]
    pub initial_capital: Option<Decimal>,
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
    #[serde(default)]
    pub slippage_model: Option<String>,
    #[serde(default)]
    pub slippage_value: Option<Decimal>,
    #[serde(default)]
    pub bar_interval_ms: Option<i64>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

pub async fn run_backtest(
    State(state): State<AppState>,
    Json(request): Json<RunBacktestRequest>,
) -> Result<Json<StartedResponse>, ApiError> {
    let pairs = parse_pairs(&request.symbol, &request.symbols)?;
    let interval = request
        .bar_interval_ms
        .unwrap_or(state.config.bar_interval_ms);

    let mut items = Vec::new();
    match &request.data {
        DataSource::Csv { path } => {
            for pair in &pairs {
                items.extend(load_csv(pair, path)?);
            }
        }
        DataSource::Synthetic {
            bars,
            seed,
            base,
            amplitude,
            period,
        } => {
            for pair in &pairs {
                match seed {
                    Some(seed) => {
                        let mut generator = SyntheticSeriesGenerator::new(*seed);
                        items.extend(generator.generate(
                            pair, *bars, 0, interval, *base, *amplitude,
                        ));
                    }
                    None => items.extend(synthetic_sine(
                        pair, *bars, 0, interval, *base, *amplitude, *period,
                    )),
                }
            }
        }
    }
    if items.is_empty() {
        return Err(CoreError::Validation("backtest data source is empty".into()).into());
    }

    let slippage = match request.slippage_model.as_deref() {
        Some("fixed") => crate::backtest::SlippageModel::Fixed(
            request
                .slippage_value
                .unwrap_or(state.config.backtest_slippage_value),
        ),
        Some("book") => crate::backtest::SlippageModel::Book(
            request
                .slippage_value
                .unwrap_or(state.config.backtest_slippage_value),
        ),
        Some("proportional") | None => crate::backtest::SlippageModel::Proportional(
            request
                .slippage_value
                .unwrap_or(state.config.backtest_slippage_value),
        ),
        Some(other) => {
            return Err(CoreError::Validation(format!(
                "unknown slippage model '{}'",
                other
            ))
            .into())
        }
    };

    let config = BacktestConfig {
        strategy: request.strategy.clone(),
        params: StrategyParams::from_json(&request.params),
        pairs,
        initial_capital: request
            .initial_capital
            .unwrap_or(state.config.backtest_initial_capital),
        fee_rate: request.fee_rate.unwrap_or(state.config.backtest_fee_rate),
        slippage,
        bar_interval_ms: interval,
        risk: Some(state.config.risk_limits()),
        max_strategy_errors: state.config.max_strategy_errors,
    };

    // Fail fast on unknown strategies before occupying a worker.
    build_strategy(&config.strategy, &config.params)?;

    let id = state
        .manager
        .start_backtest(config, Box::new(VecFeed::new(items)));
    Ok(Json(StartedResponse { id }))
}

pub async fn backtest_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BacktestInfo>, ApiError> {
    Ok(Json(state.manager.backtest_progress(&id)?))
}

pub async fn backtest_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.manager.backtest_progress(&id)?;
    let result = state.manager.backtest_result(&id)?;
    Ok(Json(json!({
        "progress": info,
        "result": result,
    })))
}

pub async fn cancel_backtest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.cancel_backtest(&id)?;
    Ok(Json(json!({"canceled": id})))
}

// === System ===

#[derive(Debug, Deserialize, Default)]
pub struct KillSwitchRequest {
    /// Engage when true or absent; false clears the switch.
    #[serde(default)]
    pub engage: Option<bool>,
}

pub async fn kill_switch(
    State(state): State<AppState>,
    body: Option<Json<KillSwitchRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engage = body
        .map(|Json(request)| request.engage.unwrap_or(true))
        .unwrap_or(true);
    if engage {
        state.manager.kill_switch().await;
    } else {
        state.manager.clear_kill_switch();
    }
    Ok(Json(json!({"kill_switch": state.manager.kill_switch_engaged()})))
}
