//! Backtest Runner CLI
//!
//! Batch entrypoint for running a backtest without the API server.
//!
//! ```bash
//! cargo run --bin backtest_run -- \
//!   --strategy dual_ma --symbol BTC-USDC \
//!   --csv ./data/btc_1m.csv \
//!   --param fast_period=10 --param slow_period=30 \
//!   --output results.json
//! ```
//!
//! Without `--csv` a deterministic synthetic sine series is used.

use anyhow::{Context, Result};
use clap::Parser;
use quantbot::backtest::{
    load_csv, run_dual_ma, synthetic_sine, BacktestConfig, BacktestEngine, SlippageModel,
    SyntheticSeriesGenerator, VecFeed, VectorizedDualMaConfig,
};
use quantbot::strategy::StrategyParams;
use quantbot::types::{Bar, TradingPair};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Parser)]
#[command(name = "backtest_run", about = "Run a strategy backtest over bar data")]
struct Args {
    /// Strategy name: dual_ma, grid, rsi_reversal.
    #[arg(long, default_value = "dual_ma")]
    strategy: String,

    /// Instrument, base-quote.
    #[arg(long, default_value = "BTC-USDC")]
    symbol: String,

    /// CSV of timestamp_ms,open,high,low,close,volume rows.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Synthetic series length when no CSV is given.
    #[arg(long, default_value_t = 100_000)]
    synthetic_bars: usize,

    /// Seed for the synthetic random walk; omit for the closed-form sine.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "10000")]
    capital: Decimal,

    #[arg(long, default_value = "0.0005")]
    fee_rate: Decimal,

    /// fixed | proportional | book
    #[arg(long, default_value = "proportional")]
    slippage_model: String,

    #[arg(long, default_value = "0.0001")]
    slippage: Decimal,

    #[arg(long, default_value_t = 60_000)]
    interval_ms: i64,

    /// Strategy parameter overrides, key=value. Repeatable.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, Decimal)>,

    /// Use the vectorized dual-MA path instead of the scalar engine.
    #[arg(long)]
    vectorized: bool,

    /// Write the full report (fills + equity curve) as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_param(raw: &str) -> Result<(String, Decimal), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = Decimal::from_str(value).map_err(|e| format!("bad value for {}: {}", key, e))?;
    Ok((key.to_string(), value))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quantbot=info")),
        )
        .init();

    let args = Args::parse();
    let pair = TradingPair::from_str(&args.symbol)
        .map_err(|e| anyhow::anyhow!("bad symbol: {}", e))?;

    let (series, source) = match (&args.csv, args.seed) {
        (Some(path), _) => (load_csv(&pair, path).context("loading CSV")?, "csv"),
        (None, Some(seed)) => (
            SyntheticSeriesGenerator::new(seed).generate(
                &pair,
                args.synthetic_bars,
                0,
                args.interval_ms,
                dec!(100),
                dec!(2),
            ),
            "synthetic walk",
        ),
        (None, None) => (
            synthetic_sine(
                &pair,
                args.synthetic_bars,
                0,
                args.interval_ms,
                dec!(100),
                dec!(10),
                50,
            ),
            "synthetic sine",
        ),
    };
    println!("Loaded {} bars for {} ({})", series.len(), pair, source);

    let mut params = StrategyParams::new()
        .with_value("fast_period", dec!(10))
        .with_value("slow_period", dec!(30))
        .with_value("order_size", dec!(1));
    for (key, value) in &args.params {
        params = params.with_value(key.clone(), *value);
    }

    let slippage = match args.slippage_model.as_str() {
        "fixed" => SlippageModel::Fixed(args.slippage),
        "book" => SlippageModel::Book(args.slippage),
        "proportional" => SlippageModel::Proportional(args.slippage),
        other => anyhow::bail!("unknown slippage model '{}'", other),
    };

    let report = if args.vectorized {
        if args.strategy != "dual_ma" {
            anyhow::bail!("the vectorized path covers dual_ma only");
        }
        let bars: Vec<Bar> = series.iter().map(|(_, b)| *b).collect();
        run_dual_ma(
            &pair,
            &bars,
            &VectorizedDualMaConfig {
                fast_period: params.get_usize("fast_period", 10),
                slow_period: params.get_usize("slow_period", 30),
                order_size: params.get_or("order_size", dec!(1)),
                initial_capital: args.capital,
                fee_rate: args.fee_rate,
                slippage: args.slippage,
                bar_interval_ms: args.interval_ms,
            },
        )
    } else {
        let config = BacktestConfig {
            strategy: args.strategy.clone(),
            params,
            pairs: vec![pair.clone()],
            initial_capital: args.capital,
            fee_rate: args.fee_rate,
            slippage,
            bar_interval_ms: args.interval_ms,
            risk: None,
            max_strategy_errors: 10,
        };
        BacktestEngine::new(config, Box::new(VecFeed::new(series)))
            .run()
            .map_err(|e| anyhow::anyhow!("backtest failed: {}", e))?
    };

    println!();
    println!("=== {} on {} ===", args.strategy, pair);
    println!("Initial capital : {}", report.initial_capital);
    println!("Final equity    : {}", report.final_equity);
    println!("Total return    : {:.4}%", report.total_return_pct);
    println!("CAGR            : {:.4}%", report.cagr_pct);
    println!("Sharpe          : {:.4}", report.sharpe);
    println!("Sortino         : {:.4}", report.sortino);
    println!("Max drawdown    : {:.4}%", report.max_drawdown_pct);
    println!("Win rate        : {:.2}%", report.win_rate * 100.0);
    println!("Profit factor   : {:.4}", report.profit_factor);
    println!("Trades          : {}", report.trade_count);
    println!("Fees            : {}", report.total_fees);
    println!("Fingerprint     : {}", report.fingerprint());

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing {:?}", path))?;
        println!("Full report written to {:?}", path);
    }

    Ok(())
}
