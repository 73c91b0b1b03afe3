//! Strategy Runner
//!
//! One task per hosted strategy. The runner owns the strategy state (single
//! writer), pulls market and account events off its bus subscriptions,
//! drives callbacks with warm-up suppression and error containment, and
//! routes recorded intents into the execution engine. Lifecycle:
//! init -> running <-> paused -> stopping -> stopped.

use crate::bus::{EventBus, Subscription};
use crate::cache::MarketCache;
use crate::engine::execution::ExecutionEngine;
use crate::engine::positions::Position;
use crate::error::CoreError;
use crate::events::{topics, AccountEvent, BusEvent, MarketEvent, StatusEvent};
use crate::strategy::{Intent, Strategy, StrategyContext, StrategyParams};
use crate::types::{now_ms, TradingPair};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Hosting mode for a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Live,
    Paper,
    Backtest,
}

/// Observable lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Init,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerStatus::Init => "init",
            RunnerStatus::Running => "running",
            RunnerStatus::Paused => "paused",
            RunnerStatus::Stopping => "stopping",
            RunnerStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Control-plane commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCommand {
    Pause,
    Resume,
    Stop,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub id: String,
    pub strategy: String,
    pub mode: RunnerMode,
    pub venue: String,
    pub pairs: Vec<TradingPair>,
    pub params: StrategyParams,
    pub max_strategy_errors: u32,
}

/// Handle held by the engine manager.
pub struct RunnerHandle {
    pub id: String,
    pub strategy: String,
    pub mode: RunnerMode,
    status: Arc<RwLock<RunnerStatus>>,
    control: mpsc::Sender<RunnerCommand>,
    join: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RunnerHandle {
    pub fn status(&self) -> RunnerStatus {
        *self.status.read()
    }

    pub async fn pause(&self) {
        let _ = self.control.send(RunnerCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.control.send(RunnerCommand::Resume).await;
    }

    /// Signal stop and wait up to the grace period for a clean exit, then
    /// force-terminate. Stopping a stopped runner succeeds silently.
    pub async fn stop(&self, grace: Duration) {
        let _ = self.control.send(RunnerCommand::Stop).await;
        let join = self.join.lock().take();
        if let Some(join) = join {
            let abort = join.abort_handle();
            if tokio::time::timeout(grace, join).await.is_err() {
                warn!(id = %self.id, "runner did not stop within grace; aborting");
                abort.abort();
            }
        }
        *self.status.write() = RunnerStatus::Stopped;
    }
}

/// The runner itself; constructed by the session wiring, driven on its own
/// task via `spawn`.
pub struct StrategyRunner {
    config: RunnerConfig,
    strategy: Box<dyn Strategy>,
    execution: Arc<ExecutionEngine>,
    cache: Arc<MarketCache>,
    bus: Arc<EventBus>,
    status: Arc<RwLock<RunnerStatus>>,
    marks: HashMap<TradingPair, Decimal>,
    bars_seen: HashMap<TradingPair, usize>,
    client_seq: u64,
    errors: u32,
}

impl StrategyRunner {
    pub fn new(
        config: RunnerConfig,
        strategy: Box<dyn Strategy>,
        execution: Arc<ExecutionEngine>,
        cache: Arc<MarketCache>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            strategy,
            execution,
            cache,
            bus,
            status: Arc::new(RwLock::new(RunnerStatus::Init)),
            marks: HashMap::new(),
            bars_seen: HashMap::new(),
            client_seq: 0,
            errors: 0,
        }
    }

    /// Start the runner task and return its control handle.
    pub fn spawn(self) -> RunnerHandle {
        let (control_tx, control_rx) = mpsc::channel(16);
        let id = self.config.id.clone();
        let strategy = self.config.strategy.clone();
        let mode = self.config.mode;
        let status = self.status.clone();

        let market_sub = self
            .bus
            .subscribe(format!("market.{}.*", self.config.venue));
        let account_sub = self
            .bus
            .subscribe(format!("account.{}.*", self.config.venue));

        let join = tokio::spawn(self.run(control_rx, market_sub, account_sub));

        RunnerHandle {
            id,
            strategy,
            mode,
            status,
            control: control_tx,
            join: parking_lot::Mutex::new(Some(join)),
        }
    }

    async fn run(
        mut self,
        mut control: mpsc::Receiver<RunnerCommand>,
        mut market: Subscription,
        mut account: Subscription,
    ) {
        info!(id = %self.config.id, strategy = %self.config.strategy, "runner initializing");
        self.publish_status(RunnerStatus::Init).await;

        let init_intents = match self.dispatch(|strategy, ctx| strategy.on_init(ctx)) {
            Ok(intents) => intents,
            Err(e) => {
                error!(id = %self.config.id, error = %e, "on_init failed; stopping");
                self.publish_status(RunnerStatus::Stopped).await;
                return;
            }
        };
        self.route(init_intents).await;
        self.publish_status(RunnerStatus::Running).await;

        loop {
            tokio::select! {
                command = control.recv() => {
                    match command {
                        Some(RunnerCommand::Pause) => {
                            if self.status() == RunnerStatus::Running {
                                self.publish_status(RunnerStatus::Paused).await;
                            }
                        }
                        Some(RunnerCommand::Resume) => {
                            if self.status() == RunnerStatus::Paused {
                                self.publish_status(RunnerStatus::Running).await;
                            }
                        }
                        Some(RunnerCommand::Stop) | None => break,
                    }
                }
                event = market.recv() => {
                    match event {
                        Some((_, event)) => self.handle_event(event).await,
                        None => break,
                    }
                }
                event = account.recv() => {
                    match event {
                        Some((_, event)) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }

            if self.errors > self.config.max_strategy_errors {
                error!(
                    id = %self.config.id,
                    errors = self.errors,
                    "strategy error threshold crossed; stopping"
                );
                break;
            }
        }

        self.publish_status(RunnerStatus::Stopping).await;
        if let Err(e) = self
            .dispatch(|strategy, ctx| strategy.on_stop(ctx))
            .map(drop)
        {
            warn!(id = %self.config.id, error = %e, "on_stop failed");
        }
        self.publish_status(RunnerStatus::Stopped).await;
        info!(id = %self.config.id, "runner stopped");
    }

    fn status(&self) -> RunnerStatus {
        *self.status.read()
    }

    async fn handle_event(&mut self, event: BusEvent) {
        // Paused runners keep draining their queues without dispatching.
        let paused = self.status() != RunnerStatus::Running;

        match event {
            BusEvent::Market(MarketEvent::Bar { pair, bar }) => {
                if !self.config.pairs.contains(&pair) {
                    return;
                }
                self.marks.insert(pair.clone(), bar.close);
                let seen = self
                    .bars_seen
                    .entry(pair.clone())
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                let warm = *seen > self.strategy.required_history();
                if paused {
                    return;
                }
                let intents = match self.dispatch(|strategy, ctx| strategy.on_bar(ctx, &pair, &bar))
                {
                    Ok(intents) => intents,
                    Err(_) => return,
                };
                if warm {
                    self.route(intents).await;
                }
            }
            BusEvent::Market(MarketEvent::Ticker(ticker)) => {
                if !self.config.pairs.contains(&ticker.pair) {
                    return;
                }
                self.marks.insert(ticker.pair.clone(), ticker.mark);
                if paused {
                    return;
                }
                if let Ok(intents) =
                    self.dispatch(|strategy, ctx| strategy.on_ticker(ctx, &ticker))
                {
                    self.route(intents).await;
                }
            }
            BusEvent::Market(MarketEvent::BookSnapshot(_))
            | BusEvent::Market(MarketEvent::BookDelta(_)) => {
                if paused || !self.strategy.wants_orderbook() {
                    return;
                }
                // Deliver the current consolidated book, not the raw delta.
                for pair in self.config.pairs.clone() {
                    let handle = self.cache.book(&self.config.venue, &pair);
                    let snapshot = {
                        let book = handle.read();
                        if !book.is_synced() {
                            continue;
                        }
                        let (bids, asks) = book.levels(20);
                        crate::orderbook::BookSnapshot {
                            pair: pair.clone(),
                            bids,
                            asks,
                            seq: book.last_seq(),
                            ts: book.last_update(),
                        }
                    };
                    if let Ok(intents) =
                        self.dispatch(|strategy, ctx| strategy.on_orderbook(ctx, &snapshot))
                    {
                        self.route(intents).await;
                    }
                }
            }
            BusEvent::Market(MarketEvent::Trade(_))
            | BusEvent::Market(MarketEvent::BookResyncNeeded { .. }) => {}
            BusEvent::Account(AccountEvent::OrderUpdate(order)) => {
                if paused || !self.owns_client_id(&order.client_id) {
                    return;
                }
                if let Ok(intents) =
                    self.dispatch(|strategy, ctx| strategy.on_order_update(ctx, &order))
                {
                    self.route(intents).await;
                }
            }
            BusEvent::Account(AccountEvent::Fill(fill)) => {
                if paused || !self.owns_client_id(&fill.client_id) {
                    return;
                }
                if let Ok(intents) = self.dispatch(|strategy, ctx| strategy.on_fill(ctx, &fill)) {
                    self.route(intents).await;
                }
            }
            BusEvent::Account(_) | BusEvent::Status(_) => {}
        }
    }

    fn owns_client_id(&self, client_id: &str) -> bool {
        client_id.starts_with(&self.config.id)
    }

    /// Run one callback with error containment.
    fn dispatch<F>(&mut self, callback: F) -> Result<Vec<Intent>, CoreError>
    where
        F: FnOnce(&mut dyn Strategy, &mut StrategyContext) -> Result<(), CoreError>,
    {
        let positions: HashMap<TradingPair, Position> = self
            .cache
            .positions(&self.config.venue)
            .into_iter()
            .map(|p| (p.pair.clone(), p))
            .collect();

        let mut ctx = StrategyContext::new(
            &self.config.venue,
            now_ms(),
            &self.config.params,
            &positions,
            &self.marks,
            &self.config.id,
            &mut self.client_seq,
        );
        match callback(self.strategy.as_mut(), &mut ctx) {
            Ok(()) => Ok(ctx.take_intents()),
            Err(e) => {
                self.errors += 1;
                warn!(
                    id = %self.config.id,
                    error = %e,
                    errors = self.errors,
                    "strategy callback failed"
                );
                Err(e)
            }
        }
    }

    async fn route(&self, intents: Vec<Intent>) {
        for intent in intents {
            match intent {
                Intent::Submit(request) => {
                    if let Err(e) = self.execution.submit(request).await {
                        warn!(id = %self.config.id, error = %e, "order submission failed");
                    }
                }
                Intent::Cancel { client_id } => {
                    if let Err(e) = self.execution.cancel(&client_id).await {
                        warn!(id = %self.config.id, error = %e, "cancel failed");
                    }
                }
                Intent::CancelAll { pair } => {
                    if let Err(e) = self.execution.cancel_all(pair.as_ref()).await {
                        warn!(id = %self.config.id, error = %e, "cancel-all failed");
                    }
                }
            }
        }
    }

    async fn publish_status(&self, status: RunnerStatus) {
        *self.status.write() = status;
        let _ = self
            .bus
            .publish(
                topics::STRATEGY_STATUS,
                BusEvent::Status(StatusEvent {
                    runner_id: self.config.id.clone(),
                    status: status.to_string(),
                    ts: now_ms(),
                }),
            )
            .await;
    }
}
