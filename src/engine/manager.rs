//! Engine Manager
//!
//! Registry of strategy runners and backtest sessions, keyed by UUID. The
//! single source of truth for the control plane: lifecycle operations are
//! idempotent where meaningful and the global kill switch stops every runner
//! and vetoes new submissions until cleared.

use crate::backtest::{BacktestConfig, BacktestDataFeed, BacktestEngine, BacktestProgress, PerformanceReport};
use crate::engine::runner::{RunnerHandle, RunnerMode, RunnerStatus};
use crate::error::{CoreError, CoreResult};
use crate::risk::RiskEngine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Control-plane view of one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub id: String,
    pub strategy: String,
    pub mode: RunnerMode,
    pub status: RunnerStatus,
}

/// Lifecycle state of a backtest session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum BacktestState {
    Running,
    Completed,
    Canceled,
    Failed { error: String },
}

/// Control-plane view of one backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestInfo {
    pub id: String,
    pub strategy: String,
    pub progress: f64,
    pub bars_processed: u64,
    pub bars_total: u64,
    #[serde(flatten)]
    pub state: BacktestState,
}

struct BacktestSession {
    strategy: String,
    progress: Arc<BacktestProgress>,
    state: Arc<RwLock<BacktestState>>,
    result: Arc<RwLock<Option<PerformanceReport>>>,
}

/// Registry of live/paper runners and backtest sessions.
pub struct EngineManager {
    runners: RwLock<HashMap<String, Arc<RunnerHandle>>>,
    backtests: RwLock<HashMap<String, BacktestSession>>,
    risk: Arc<RiskEngine>,
}

impl EngineManager {
    pub fn new(risk: Arc<RiskEngine>) -> Arc<Self> {
        Arc::new(Self {
            runners: RwLock::new(HashMap::new()),
            backtests: RwLock::new(HashMap::new()),
            risk,
        })
    }

    pub fn new_runner_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a spawned runner under its id.
    pub fn register_runner(&self, handle: RunnerHandle) -> String {
        let id = handle.id.clone();
        info!(id = %id, strategy = %handle.strategy, "runner registered");
        self.runners.write().insert(id.clone(), Arc::new(handle));
        id
    }

    pub fn runner(&self, id: &str) -> CoreResult<RunnerInfo> {
        self.runners
            .read()
            .get(id)
            .map(|handle| RunnerInfo {
                id: handle.id.clone(),
                strategy: handle.strategy.clone(),
                mode: handle.mode,
                status: handle.status(),
            })
            .ok_or_else(|| CoreError::OrderNotFound(format!("runner {}", id)))
    }

    pub fn list_runners(&self) -> Vec<RunnerInfo> {
        let mut infos: Vec<RunnerInfo> = self
            .runners
            .read()
            .values()
            .map(|handle| RunnerInfo {
                id: handle.id.clone(),
                strategy: handle.strategy.clone(),
                mode: handle.mode,
                status: handle.status(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn pause_runner(&self, id: &str) -> CoreResult<()> {
        let handle = self.runner_handle(id)?;
        handle.pause().await;
        Ok(())
    }

    pub async fn resume_runner(&self, id: &str) -> CoreResult<()> {
        let handle = self.runner_handle(id)?;
        handle.resume().await;
        Ok(())
    }

    /// Stop a runner. Stopping an already-stopped runner succeeds silently.
    pub async fn stop_runner(&self, id: &str) -> CoreResult<()> {
        let handle = self.runner_handle(id)?;
        handle.stop(STOP_GRACE).await;
        Ok(())
    }

    /// Remove a terminal runner from the registry.
    pub fn remove_runner(&self, id: &str) -> bool {
        let mut runners = self.runners.write();
        match runners.get(id) {
            Some(handle) if handle.status() == RunnerStatus::Stopped => {
                runners.remove(id);
                true
            }
            _ => false,
        }
    }

    fn runner_handle(&self, id: &str) -> CoreResult<Arc<RunnerHandle>> {
        self.runners
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::OrderNotFound(format!("runner {}", id)))
    }

    /// Launch a backtest on a blocking worker; returns its session id.
    pub fn start_backtest(
        self: &Arc<Self>,
        config: BacktestConfig,
        feed: Box<dyn BacktestDataFeed>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let engine = BacktestEngine::new(config.clone(), feed);
        let progress = engine.progress_handle();
        let state = Arc::new(RwLock::new(BacktestState::Running));
        let result = Arc::new(RwLock::new(None));

        self.backtests.write().insert(
            id.clone(),
            BacktestSession {
                strategy: config.strategy.clone(),
                progress,
                state: state.clone(),
                result: result.clone(),
            },
        );

        info!(id = %id, strategy = %config.strategy, "backtest started");
        tokio::task::spawn_blocking(move || match engine.run() {
            Ok(report) => {
                *result.write() = Some(report);
                *state.write() = BacktestState::Completed;
            }
            Err(CoreError::Canceled) => {
                *state.write() = BacktestState::Canceled;
            }
            Err(e) => {
                warn!(error = %e, "backtest failed");
                *state.write() = BacktestState::Failed {
                    error: e.to_string(),
                };
            }
        });

        id
    }

    pub fn backtest_progress(&self, id: &str) -> CoreResult<BacktestInfo> {
        let backtests = self.backtests.read();
        let session = backtests
            .get(id)
            .ok_or_else(|| CoreError::OrderNotFound(format!("backtest {}", id)))?;
        let info = BacktestInfo {
            id: id.to_string(),
            strategy: session.strategy.clone(),
            progress: session.progress.fraction(),
            bars_processed: session.progress.processed(),
            bars_total: session.progress.total(),
            state: session.state.read().clone(),
        };
        Ok(info)
    }

    /// Completed result, `None` while still running.
    pub fn backtest_result(&self, id: &str) -> CoreResult<Option<PerformanceReport>> {
        let backtests = self.backtests.read();
        let session = backtests
            .get(id)
            .ok_or_else(|| CoreError::OrderNotFound(format!("backtest {}", id)))?;
        let result = match &*session.state.read() {
            BacktestState::Failed { error } => Err(CoreError::Validation(error.clone())),
            _ => Ok(session.result.read().clone()),
        };
        result
    }

    /// Request cancellation; polled between bars. Idempotent.
    pub fn cancel_backtest(&self, id: &str) -> CoreResult<()> {
        let backtests = self.backtests.read();
        let session = backtests
            .get(id)
            .ok_or_else(|| CoreError::OrderNotFound(format!("backtest {}", id)))?;
        session.progress.cancel();
        Ok(())
    }

    /// Stop all runners and disable new submissions until cleared.
    pub async fn kill_switch(&self) {
        warn!("kill switch: stopping all runners");
        self.risk.engage_kill_switch();

        let handles: Vec<Arc<RunnerHandle>> = self.runners.read().values().cloned().collect();
        for handle in handles {
            handle.stop(STOP_GRACE).await;
        }
        let sessions: Vec<Arc<BacktestProgress>> = self
            .backtests
            .read()
            .values()
            .map(|s| s.progress.clone())
            .collect();
        for progress in sessions {
            progress.cancel();
        }
    }

    pub fn clear_kill_switch(&self) {
        self.risk.clear_kill_switch();
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.risk.kill_switch_engaged()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{synthetic_sine, SlippageModel, VecFeed};
    use crate::risk::RiskLimits;
    use crate::strategy::StrategyParams;
    use crate::types::TradingPair;
    use rust_decimal_macros::dec;

    fn manager() -> Arc<EngineManager> {
        EngineManager::new(Arc::new(RiskEngine::new(RiskLimits::default())))
    }

    fn backtest_config() -> BacktestConfig {
        BacktestConfig {
            strategy: "dual_ma".to_string(),
            params: StrategyParams::new()
                .with_value("fast_period", dec!(5))
                .with_value("slow_period", dec!(15))
                .with_value("order_size", dec!(1)),
            pairs: vec![TradingPair::new("BTC", "USDC")],
            initial_capital: dec!(10000),
            fee_rate: dec!(0.0005),
            slippage: SlippageModel::Proportional(dec!(0.0001)),
            bar_interval_ms: 60_000,
            risk: None,
            max_strategy_errors: 10,
        }
    }

    fn feed(count: usize) -> Box<VecFeed> {
        Box::new(VecFeed::new(synthetic_sine(
            &TradingPair::new("BTC", "USDC"),
            count,
            0,
            60_000,
            dec!(100),
            dec!(10),
            40,
        )))
    }

    #[tokio::test]
    async fn test_backtest_session_lifecycle() {
        let manager = manager();
        let id = manager.start_backtest(backtest_config(), feed(300));

        // Poll until the worker finishes.
        for _ in 0..200 {
            let info = manager.backtest_progress(&id).unwrap();
            if matches!(info.state, BacktestState::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let info = manager.backtest_progress(&id).unwrap();
        assert!(matches!(info.state, BacktestState::Completed));
        let report = manager.backtest_result(&id).unwrap().unwrap();
        assert_eq!(report.equity_curve.len(), 300);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.runner("nope"),
            Err(CoreError::OrderNotFound(_))
        ));
        assert!(matches!(
            manager.backtest_progress("nope"),
            Err(CoreError::OrderNotFound(_))
        ));
        assert!(matches!(
            manager.cancel_backtest("nope"),
            Err(CoreError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_switch_engages_risk() {
        let manager = manager();
        assert!(!manager.kill_switch_engaged());
        manager.kill_switch().await;
        assert!(manager.kill_switch_engaged());
        manager.clear_kill_switch();
        assert!(!manager.kill_switch_engaged());
    }
}
