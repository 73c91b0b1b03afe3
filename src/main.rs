//! QuantBot server binary: wires the venue adapter, trading core, and
//! control plane together and serves until interrupted.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use quantbot::api::{self, AppState};
use quantbot::bus::EventBus;
use quantbot::cache::MarketCache;
use quantbot::engine::{
    DataEngine, EngineManager, ExecutionEngine, ExecutionMode, OrderManager, PositionTracker,
    SimulatedExecutor, SimulatedExecutorConfig,
};
use quantbot::error::CoreError;
use quantbot::exchange::hyperliquid::HyperliquidAdapter;
use quantbot::exchange::{Channel, ExchangeAdapter};
use quantbot::models::Config;
use quantbot::persist::DataStore;
use quantbot::risk::RiskEngine;
use quantbot::types::{now_ms, TradingPair};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quantbot=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    info!(
        venue = %config.venue,
        testnet = config.testnet,
        port = config.port,
        "quantbot starting"
    );

    let pairs: Vec<TradingPair> = config
        .symbols
        .iter()
        .map(|s| TradingPair::from_str(s).map_err(CoreError::Validation))
        .collect::<Result<_, _>>()
        .context("parsing SYMBOLS")?;

    // Core collaborators, threaded explicitly - no process-level singletons.
    let bus = EventBus::new(config.bus_config());
    let cache = MarketCache::new();
    let risk = Arc::new(RiskEngine::new(config.risk_limits()));
    if config.risk_kill_switch {
        risk.engage_kill_switch();
    }
    let orders = Arc::new(Mutex::new(OrderManager::new(
        config.venue.clone(),
        config.pending_order_timeout_ms,
    )));
    let positions = Arc::new(Mutex::new(PositionTracker::new(config.venue.clone())));
    let store = Arc::new(DataStore::new(&config.database_path).context("opening data store")?);

    restore_positions(&config, &store, &positions);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Venue adapter; live trading stays disabled unless it connects.
    let adapter: Option<Arc<dyn ExchangeAdapter>> =
        match HyperliquidAdapter::new(config.hyperliquid_config()) {
            Ok(adapter) => {
                let adapter: Arc<dyn ExchangeAdapter> = Arc::new(adapter);
                match adapter.connect().await {
                    Ok(()) => Some(adapter),
                    Err(e) => {
                        warn!(error = %e, "venue connect failed; running without live data");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "adapter construction failed; running without live data");
                None
            }
        };

    if let Some(adapter) = &adapter {
        start_data_engine(
            &config,
            adapter.clone(),
            &pairs,
            bus.clone(),
            cache.clone(),
            orders.clone(),
            positions.clone(),
            shutdown_rx.clone(),
        )
        .await;
        start_maintenance(
            &config,
            adapter.clone(),
            cache.clone(),
            orders.clone(),
            positions.clone(),
            shutdown_rx.clone(),
        );
    }
    start_persistence(
        &config,
        store.clone(),
        orders.clone(),
        positions.clone(),
        shutdown_rx.clone(),
    );

    // Execution paths: paper always, live only with credentials + adapter.
    let simulator = SimulatedExecutor::new(
        config.venue.clone(),
        cache.clone(),
        SimulatedExecutorConfig {
            slippage: config.paper_slippage,
            fee_rate: config.paper_fee_rate,
        },
    );
    let paper_execution = Arc::new(ExecutionEngine::new(
        config.venue.clone(),
        ExecutionMode::Paper,
        None,
        Some(simulator),
        orders.clone(),
        positions.clone(),
        risk.clone(),
        cache.clone(),
        bus.clone(),
        config.decimal_spec(),
    ));
    let live_execution = match (&adapter, config.live_ready()) {
        (Some(adapter), true) => Some(Arc::new(ExecutionEngine::new(
            config.venue.clone(),
            ExecutionMode::Live,
            Some(adapter.clone()),
            None,
            orders.clone(),
            positions.clone(),
            risk.clone(),
            cache.clone(),
            bus.clone(),
            config.decimal_spec(),
        ))),
        _ => None,
    };

    let manager = EngineManager::new(risk.clone());

    let state = AppState {
        config: config.clone(),
        bus,
        cache,
        manager,
        paper_execution,
        live_execution,
    };
    let app = api::router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server error")?;

    Ok(())
}

fn restore_positions(
    config: &Config,
    store: &Arc<DataStore>,
    positions: &Arc<Mutex<PositionTracker>>,
) {
    let restore = std::env::var("RESTORE_ON_START")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
        .unwrap_or(false);
    if !restore {
        return;
    }
    match store.restore_positions(&config.venue) {
        Ok(restored) => {
            let count = restored.len();
            let mut tracker = positions.lock();
            for row in restored {
                let mut position = quantbot::engine::Position::new(row.pair.clone());
                position.size = row.size;
                position.entry_price = row.entry_price;
                position.realized_pnl = row.realized_pnl;
                position.cumulative_fees = row.cumulative_fees;
                position.updated_at = row.ts;
                tracker.seed(position);
            }
            info!(count, "positions restored from snapshot");
        }
        Err(e) => warn!(error = %e, "position restore failed"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_data_engine(
    config: &Arc<Config>,
    adapter: Arc<dyn ExchangeAdapter>,
    pairs: &[TradingPair],
    bus: Arc<EventBus>,
    cache: Arc<MarketCache>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionTracker>>,
    shutdown: watch::Receiver<bool>,
) {
    let mut channels = Vec::new();
    for pair in pairs {
        channels.push(Channel::L2Book(pair.clone()));
        channels.push(Channel::Trades(pair.clone()));
    }
    channels.push(Channel::OrderUpdates);
    channels.push(Channel::UserFills);

    match adapter.subscribe(&channels).await {
        Ok(rx) => {
            let engine = DataEngine::new(
                config.venue.clone(),
                bus,
                cache,
                orders,
                positions,
                Some(adapter),
                config.bar_interval_ms,
            );
            tokio::spawn(engine.run(rx, shutdown));
            info!(channels = channels.len(), "data engine subscribed");
        }
        Err(e) => error!(error = %e, "subscription failed; no market data"),
    }
}

/// Periodic order-lifecycle upkeep: ack timeouts and venue reconciliation.
fn start_maintenance(
    config: &Arc<Config>,
    adapter: Arc<dyn ExchangeAdapter>,
    cache: Arc<MarketCache>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionTracker>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let venue = config.venue.clone();
    let reconcile_every = Duration::from_secs(config.reconcile_interval_secs.max(1));

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut last_reconcile = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }

            let now = now_ms();
            let timed_out = orders.lock().check_pending_timeouts(now);
            if !timed_out.is_empty() {
                warn!(count = timed_out.len(), "orders moved to UNKNOWN");
            }

            let due = last_reconcile.elapsed() >= reconcile_every
                || orders.lock().needs_reconciliation();
            if !due {
                continue;
            }
            last_reconcile = tokio::time::Instant::now();

            match adapter.get_open_orders().await {
                Ok(venue_open) => {
                    let report = orders.lock().reconcile(&venue_open, now_ms());
                    if !report.closed.is_empty() || !report.adopted.is_empty() {
                        info!(
                            closed = report.closed.len(),
                            adopted = report.adopted.len(),
                            updated = report.updated,
                            "order reconciliation applied"
                        );
                    }
                    let open = orders.lock().open_orders();
                    cache.set_open_orders(&venue, open, now_ms());
                }
                Err(e) => warn!(error = %e, "open-orders reconciliation failed"),
            }

            match adapter.get_positions().await {
                Ok(snapshot) => {
                    positions.lock().apply_snapshot(&snapshot, now_ms());
                    for position in positions.lock().all() {
                        cache.set_position(&venue, position);
                    }
                }
                Err(e) => warn!(error = %e, "position snapshot failed"),
            }

            match adapter.get_balances().await {
                Ok(balances) => cache.set_balances(&venue, balances, now_ms()),
                Err(e) => warn!(error = %e, "balance refresh failed"),
            }
        }
    });
}

/// Best-effort periodic flush of positions and closed-order history.
fn start_persistence(
    config: &Arc<Config>,
    store: Arc<DataStore>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionTracker>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let venue = config.venue.clone();
    let every = Duration::from_secs(config.persist_interval_secs.max(5));

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tick.tick() => {}
            }

            let snapshot = positions.lock().all();
            if let Err(e) = store.snapshot_positions(&venue, &snapshot, now_ms()) {
                warn!(error = %e, "position flush failed");
            }
            let history = orders.lock().history();
            if let Err(e) = store.record_closed_orders(&venue, &history) {
                warn!(error = %e, "order history flush failed");
            }
        }
    });
}
