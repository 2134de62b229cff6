//! Pipeline Façade (C13): the public entry point over C7/C8/C9/C10/C11, enforcing the
//! single-run-per-kind invariant and exposing progress/status/result by `run_id`.

use crate::application::lab::batch_orchestrator::{BatchConfig, BatchOrchestrator, BatchResult};
use crate::application::lab::candle_cache::{CandleCache, HistoricalDataSource};
use crate::application::lab::replay_adapter::RiskGate;
use crate::application::lab::runner::{BacktestRunner, RunnerConfig};
use crate::application::lab::strategy::Strategy;
use crate::application::lab::walk_forward::{WalkForwardConfig, WalkForwardController, WalkForwardResult};
use crate::domain::lab::errors::{LabError, LabResult};
use crate::domain::lab::monte_carlo::{self, MonteCarloConfig, MonteCarloResult};
use crate::domain::lab::parameter_space;
use crate::domain::lab::regime::{self, RegimeDetectorConfig, RegimePeriod};
use crate::domain::lab::types::{
    BacktestConfig, ClosedTrade, ParameterAssignment, ParameterDescriptor, RunStatus,
};
use rayon::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    Optimization,
    WalkForward,
    MonteCarlo,
    Regime,
    MultiAsset,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub current_phase: String,
    pub percent_complete: f64,
    pub message: String,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: u64,
}

impl Progress {
    fn starting() -> Self {
        Self {
            current_phase: "STARTING".into(),
            percent_complete: 0.0,
            message: String::new(),
            elapsed_ms: 0,
            estimated_remaining_ms: 0,
        }
    }
}

pub enum JobOutcome {
    Optimization(BatchResult),
    WalkForward(WalkForwardResult),
    MonteCarlo(MonteCarloResult),
    Regime(Vec<RegimePeriod>),
    MultiAsset(MultiAssetResult),
}

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_total_positions: usize,
    pub max_positions_per_symbol: usize,
    pub max_daily_drawdown_percent: f64,
}

/// Single-writer ledger funneling every symbol's orders in multi-asset mode, enforcing
/// `RiskLimits` (SPEC_FULL.md §4.13).
pub struct PortfolioLedger {
    limits: RiskLimits,
    open_by_symbol: Mutex<HashMap<String, usize>>,
    daily_start_equity: Mutex<Decimal>,
    violations: Mutex<Vec<String>>,
}

impl PortfolioLedger {
    pub fn new(limits: RiskLimits, starting_equity: Decimal) -> Self {
        Self {
            limits,
            open_by_symbol: Mutex::new(HashMap::new()),
            daily_start_equity: Mutex::new(starting_equity),
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Called before submitting an order for `symbol`; returns `Err(RiskLimit)` if the
    /// new position would breach any configured portfolio limit.
    pub fn check_and_reserve(&self, symbol: &str, current_equity: Decimal) -> LabResult<()> {
        let mut open = self.open_by_symbol.lock().unwrap();
        let total_open: usize = open.values().sum();
        if total_open + 1 > self.limits.max_total_positions {
            self.violations.lock().unwrap().push(format!("{symbol}: max_total_positions"));
            return Err(LabError::RiskLimit {
                symbol: symbol.to_string(),
                reason: "max_total_positions exceeded".into(),
            });
        }
        let per_symbol = *open.get(symbol).unwrap_or(&0);
        if per_symbol + 1 > self.limits.max_positions_per_symbol {
            self.violations
                .lock()
                .unwrap()
                .push(format!("{symbol}: max_positions_per_symbol"));
            return Err(LabError::RiskLimit {
                symbol: symbol.to_string(),
                reason: "max_positions_per_symbol exceeded".into(),
            });
        }
        let start_equity = *self.daily_start_equity.lock().unwrap();
        if start_equity > Decimal::ZERO {
            use rust_decimal::prelude::ToPrimitive;
            let drawdown_pct = ((start_equity - current_equity) / start_equity * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0);
            if drawdown_pct > self.limits.max_daily_drawdown_percent {
                self.violations
                    .lock()
                    .unwrap()
                    .push(format!("{symbol}: max_daily_drawdown_percent"));
                return Err(LabError::RiskLimit {
                    symbol: symbol.to_string(),
                    reason: "max_daily_drawdown_percent exceeded".into(),
                });
            }
        }
        *open.entry(symbol.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub fn release(&self, symbol: &str) {
        if let Some(count) = self.open_by_symbol.lock().unwrap().get_mut(symbol) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }
}

impl RiskGate for PortfolioLedger {
    fn check_and_reserve(&self, symbol: &str, current_equity: Decimal) -> LabResult<()> {
        PortfolioLedger::check_and_reserve(self, symbol, current_equity)
    }

    fn release(&self, symbol: &str) {
        PortfolioLedger::release(self, symbol)
    }
}

pub struct MultiAssetResult {
    pub per_symbol_trades: HashMap<String, Vec<ClosedTrade>>,
    pub violations: Vec<String>,
}

struct JobHandle {
    status: Arc<Mutex<RunStatus>>,
    progress: Arc<Mutex<Progress>>,
    abort_flag: Arc<AtomicBool>,
    result: Arc<Mutex<Option<LabResult<JobOutcome>>>>,
    _thread: JoinHandle<()>,
}

/// Public entry point over the core. Owns no candle data itself — it drives C8/C9/C10/C11
/// against a shared candle cache, one background thread per job.
pub struct Pipeline<S: HistoricalDataSource> {
    cache: Arc<CandleCache<S>>,
    active_kind: Mutex<HashMap<JobKind, String>>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    job_counter: AtomicU64,
}

impl<S: HistoricalDataSource + 'static> Pipeline<S> {
    pub fn new(cache: Arc<CandleCache<S>>) -> Self {
        Self {
            cache,
            active_kind: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            job_counter: AtomicU64::new(0),
        }
    }

    fn reserve_kind(&self, kind: JobKind) -> LabResult<String> {
        let mut active = self.active_kind.lock().unwrap();
        if let Some(existing) = active.get(&kind) {
            return Err(LabError::Conflict {
                kind: format!("{kind:?}"),
                run_id: existing.clone(),
            });
        }
        let run_id = format!("{}-{}", Uuid::new_v4(), self.job_counter.fetch_add(1, Ordering::SeqCst));
        active.insert(kind, run_id.clone());
        Ok(run_id)
    }

    fn finish_kind(&self, kind: JobKind, run_id: &str) {
        let mut active = self.active_kind.lock().unwrap();
        if active.get(&kind).map(|id| id.as_str()) == Some(run_id) {
            active.remove(&kind);
        }
    }

    pub fn start_optimization<F>(
        &self,
        config: BacktestConfig,
        descriptors: Vec<ParameterDescriptor>,
        combination_limit: u64,
        seed: u64,
        batch_config: BatchConfig,
        make_strategy: F,
    ) -> LabResult<String>
    where
        F: Fn() -> Box<dyn Strategy> + Sync + Send + 'static,
    {
        let run_id = self.reserve_kind(JobKind::Optimization)?;
        let assignments = parameter_space::enumerate(&descriptors, combination_limit)?;

        let cache = self.cache.clone();
        let status = Arc::new(Mutex::new(RunStatus::Starting));
        let progress = Arc::new(Mutex::new(Progress::starting()));
        let abort_flag = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let (status2, progress2, abort2, result2) =
            (status.clone(), progress.clone(), abort_flag.clone(), result.clone());
        let kind_self_run_id = run_id.clone();
        let thread = std::thread::spawn(move || {
            *status2.lock().unwrap() = RunStatus::Running;
            let started = Instant::now();
            let orchestrator = BatchOrchestrator::new(cache);
            let batch = orchestrator.run_batches(&config, &assignments, seed, &batch_config, &make_strategy);
            *status2.lock().unwrap() = if abort2.load(Ordering::SeqCst) {
                RunStatus::Aborted
            } else {
                RunStatus::Completed
            };
            *progress2.lock().unwrap() = Progress {
                current_phase: "DONE".into(),
                percent_complete: 100.0,
                message: format!("{} runs completed", batch.records.len()),
                elapsed_ms: started.elapsed().as_millis() as u64,
                estimated_remaining_ms: 0,
            };
            *result2.lock().unwrap() = Some(Ok(JobOutcome::Optimization(batch)));
            let _ = kind_self_run_id;
        });

        self.jobs.lock().unwrap().insert(
            run_id.clone(),
            JobHandle {
                status,
                progress,
                abort_flag,
                result,
                _thread: thread,
            },
        );
        Ok(run_id)
    }

    pub fn start_walkforward<F>(
        &self,
        config: BacktestConfig,
        descriptors: Vec<ParameterDescriptor>,
        combination_limit: u64,
        seed: u64,
        batch_config: BatchConfig,
        wf_config: WalkForwardConfig,
        make_strategy: F,
    ) -> LabResult<String>
    where
        F: Fn() -> Box<dyn Strategy> + Sync + Send + 'static,
    {
        let run_id = self.reserve_kind(JobKind::WalkForward)?;
        let assignments = parameter_space::enumerate(&descriptors, combination_limit)?;

        let cache = self.cache.clone();
        let status = Arc::new(Mutex::new(RunStatus::Starting));
        let progress = Arc::new(Mutex::new(Progress::starting()));
        let abort_flag = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let (status2, progress2, result2) = (status.clone(), progress.clone(), result.clone());
        let thread = std::thread::spawn(move || {
            *status2.lock().unwrap() = RunStatus::Running;
            let started = Instant::now();
            let controller = WalkForwardController::new(cache);
            let outcome = controller.run(&config, &assignments, seed, &wf_config, &batch_config, &make_strategy);
            *status2.lock().unwrap() = match &outcome {
                Ok(_) => RunStatus::Completed,
                Err(_) => RunStatus::Error,
            };
            *progress2.lock().unwrap() = Progress {
                current_phase: "DONE".into(),
                percent_complete: 100.0,
                message: String::new(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                estimated_remaining_ms: 0,
            };
            *result2.lock().unwrap() = Some(outcome.map(JobOutcome::WalkForward));
        });

        self.jobs.lock().unwrap().insert(
            run_id.clone(),
            JobHandle {
                status,
                progress,
                abort_flag,
                result,
                _thread: thread,
            },
        );
        Ok(run_id)
    }

    pub fn start_monte_carlo(
        &self,
        trades: Vec<ClosedTrade>,
        config: MonteCarloConfig,
    ) -> LabResult<String> {
        let run_id = self.reserve_kind(JobKind::MonteCarlo)?;
        let status = Arc::new(Mutex::new(RunStatus::Starting));
        let progress = Arc::new(Mutex::new(Progress::starting()));
        let abort_flag = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let (status2, progress2, result2) = (status.clone(), progress.clone(), result.clone());
        let thread = std::thread::spawn(move || {
            *status2.lock().unwrap() = RunStatus::Running;
            let started = Instant::now();
            let outcome = monte_carlo::simulate(&trades, &config);
            *status2.lock().unwrap() = RunStatus::Completed;
            *progress2.lock().unwrap() = Progress {
                current_phase: "DONE".into(),
                percent_complete: 100.0,
                message: String::new(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                estimated_remaining_ms: 0,
            };
            *result2.lock().unwrap() = Some(Ok(JobOutcome::MonteCarlo(outcome)));
        });

        self.jobs.lock().unwrap().insert(
            run_id.clone(),
            JobHandle {
                status,
                progress,
                abort_flag,
                result,
                _thread: thread,
            },
        );
        Ok(run_id)
    }

    pub fn start_regime(
        &self,
        candles: Vec<crate::domain::lab::types::Candle>,
        config: RegimeDetectorConfig,
    ) -> LabResult<String> {
        let run_id = self.reserve_kind(JobKind::Regime)?;
        let status = Arc::new(Mutex::new(RunStatus::Starting));
        let progress = Arc::new(Mutex::new(Progress::starting()));
        let abort_flag = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let (status2, progress2, result2) = (status.clone(), progress.clone(), result.clone());
        let thread = std::thread::spawn(move || {
            *status2.lock().unwrap() = RunStatus::Running;
            let started = Instant::now();
            let periods = regime::detect(&candles, &config);
            *status2.lock().unwrap() = RunStatus::Completed;
            *progress2.lock().unwrap() = Progress {
                current_phase: "DONE".into(),
                percent_complete: 100.0,
                message: format!("{} periods", periods.len()),
                elapsed_ms: started.elapsed().as_millis() as u64,
                estimated_remaining_ms: 0,
            };
            *result2.lock().unwrap() = Some(Ok(JobOutcome::Regime(periods)));
        });

        self.jobs.lock().unwrap().insert(
            run_id.clone(),
            JobHandle {
                status,
                progress,
                abort_flag,
                result,
                _thread: thread,
            },
        );
        Ok(run_id)
    }

    /// Fans a fresh C5 runner out per symbol, genuinely concurrently via a dedicated
    /// `rayon` pool, funneling every order through a shared `PortfolioLedger` so
    /// cross-symbol risk limits are enforced per-order against the portfolio's evolving
    /// equity, not once per symbol against a static balance.
    pub fn start_multi_asset<F>(
        &self,
        configs: Vec<BacktestConfig>,
        assignment: ParameterAssignment,
        seed: u64,
        limits: RiskLimits,
        make_strategy: F,
    ) -> LabResult<String>
    where
        F: Fn() -> Box<dyn Strategy> + Sync + Send + 'static,
    {
        let run_id = self.reserve_kind(JobKind::MultiAsset)?;
        let cache = self.cache.clone();
        let status = Arc::new(Mutex::new(RunStatus::Starting));
        let progress = Arc::new(Mutex::new(Progress::starting()));
        let abort_flag = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let (status2, progress2, result2) = (status.clone(), progress.clone(), result.clone());
        let thread = std::thread::spawn(move || {
            *status2.lock().unwrap() = RunStatus::Running;
            let started = Instant::now();
            let starting_equity: Decimal = configs.iter().map(|c| c.initial_balance).sum();
            let ledger: Arc<PortfolioLedger> = Arc::new(PortfolioLedger::new(limits, starting_equity));
            let gate: Arc<dyn RiskGate> = ledger.clone();

            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(configs.len().max(1))
                .build()
                .expect("thread pool construction");

            let per_symbol: Vec<(String, Vec<ClosedTrade>)> = pool.install(|| {
                configs
                    .par_iter()
                    .map(|config| {
                        let runner = BacktestRunner::new(cache.clone());
                        let mut strategy = make_strategy();
                        let trades = runner
                            .run_with_risk_gate(
                                config,
                                &assignment,
                                seed,
                                strategy.as_mut(),
                                &RunnerConfig::default(),
                                Some(gate.clone()),
                            )
                            .map(|record| record.trades)
                            .unwrap_or_default();
                        (config.symbol.clone(), trades)
                    })
                    .collect()
            });
            let per_symbol_trades: HashMap<String, Vec<ClosedTrade>> = per_symbol.into_iter().collect();

            *status2.lock().unwrap() = RunStatus::Completed;
            *progress2.lock().unwrap() = Progress {
                current_phase: "DONE".into(),
                percent_complete: 100.0,
                message: String::new(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                estimated_remaining_ms: 0,
            };
            *result2.lock().unwrap() = Some(Ok(JobOutcome::MultiAsset(MultiAssetResult {
                violations: ledger.violations(),
                per_symbol_trades,
            })));
        });

        self.jobs.lock().unwrap().insert(
            run_id.clone(),
            JobHandle {
                status,
                progress,
                abort_flag,
                result,
                _thread: thread,
            },
        );
        Ok(run_id)
    }

    /// Idempotent. A run not RUNNING is a no-op.
    pub fn abort(&self, run_id: &str) {
        if let Some(handle) = self.jobs.lock().unwrap().get(run_id) {
            handle.abort_flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.jobs.lock().unwrap().get(run_id).map(|h| *h.status.lock().unwrap())
    }

    pub fn progress(&self, run_id: &str) -> Option<Progress> {
        self.jobs
            .lock()
            .unwrap()
            .get(run_id)
            .map(|h| h.progress.lock().unwrap().clone())
    }

    /// `None` while the job is still running or unknown; `Some` once finished. Takes the
    /// outcome, matching the one-shot consume semantics a finished run record has.
    pub fn result(&self, run_id: &str) -> Option<LabResult<JobOutcome>> {
        let jobs = self.jobs.lock().unwrap();
        let handle = jobs.get(run_id)?;
        handle.result.lock().unwrap().take()
    }
}

impl<S: HistoricalDataSource + 'static> Drop for Pipeline<S> {
    fn drop(&mut self) {
        for kind in [
            JobKind::Optimization,
            JobKind::WalkForward,
            JobKind::MonteCarlo,
            JobKind::Regime,
            JobKind::MultiAsset,
        ] {
            if let Some(run_id) = self.active_kind.lock().unwrap().get(&kind).cloned() {
                self.finish_kind(kind, &run_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lab::strategy::NoSignalStrategy;
    use crate::domain::lab::errors::LabResult as Result;
    use crate::domain::lab::types::{Candle, Timeframe};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct FixtureSource;
    impl HistoricalDataSource for FixtureSource {
        fn list_available(&self) -> Vec<(String, Timeframe, usize, i64, i64)> {
            vec![]
        }
        fn load(&self, _s: &str, _t: Timeframe) -> Result<Vec<Candle>> {
            Ok((0..400)
                .map(|i| Candle {
                    ts: 1_700_000_000_000 + i * 300_000,
                    open: dec!(100),
                    high: dec!(101),
                    low: dec!(99),
                    close: dec!(100),
                    volume: dec!(10),
                })
                .collect())
        }
    }

    fn test_config() -> BacktestConfig {
        BacktestConfig {
            symbol: "EURUSD".into(),
            strategy_tag: "donchian_rsi".into(),
            window_start: 0,
            window_end: i64::MAX,
            initial_balance: dec!(10000),
            leverage: dec!(100),
            commission_per_lot: dec!(3),
            slippage_pips: dec!(0.5),
            spread_pips: dec!(1),
            primary_tf: Timeframe::M5,
            aux_tfs: vec![],
            max_spread_pips: dec!(5),
            max_positions: 3,
            risk_percent: dec!(1),
            seed: 42,
        }
    }

    #[test]
    fn second_optimization_while_running_returns_conflict() {
        let cache = Arc::new(CandleCache::new(Arc::new(FixtureSource), 1_000_000));
        let pipeline = Pipeline::new(cache);
        let descriptors = vec![];
        let run_id = pipeline
            .start_optimization(
                test_config(),
                descriptors.clone(),
                1000,
                1,
                BatchConfig {
                    batch_size: 4,
                    top_n_per_category: 3,
                    concurrency: 1,
                },
                || Box::new(NoSignalStrategy) as Box<dyn Strategy>,
            )
            .unwrap();

        let err = pipeline
            .start_optimization(
                test_config(),
                descriptors,
                1000,
                1,
                BatchConfig {
                    batch_size: 4,
                    top_n_per_category: 3,
                    concurrency: 1,
                },
                || Box::new(NoSignalStrategy) as Box<dyn Strategy>,
            )
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        for _ in 0..200 {
            if pipeline.status(&run_id) == Some(RunStatus::Completed) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.status(&run_id), Some(RunStatus::Completed));
    }

    #[test]
    fn multi_asset_fans_out_per_symbol_and_completes() {
        let cache = Arc::new(CandleCache::new(Arc::new(FixtureSource), 1_000_000));
        let pipeline = Pipeline::new(cache);
        let mut eurusd = test_config();
        eurusd.symbol = "EURUSD".into();
        let mut gbpusd = test_config();
        gbpusd.symbol = "GBPUSD".into();

        let run_id = pipeline
            .start_multi_asset(
                vec![eurusd, gbpusd],
                ParameterAssignment::new(),
                1,
                RiskLimits {
                    max_total_positions: 10,
                    max_positions_per_symbol: 10,
                    max_daily_drawdown_percent: 50.0,
                },
                || Box::new(NoSignalStrategy) as Box<dyn Strategy>,
            )
            .unwrap();

        for _ in 0..200 {
            if pipeline.status(&run_id) == Some(RunStatus::Completed) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pipeline.status(&run_id), Some(RunStatus::Completed));

        match pipeline.result(&run_id).unwrap().unwrap() {
            JobOutcome::MultiAsset(outcome) => {
                assert_eq!(outcome.per_symbol_trades.len(), 2);
                assert!(outcome.per_symbol_trades.contains_key("EURUSD"));
                assert!(outcome.per_symbol_trades.contains_key("GBPUSD"));
            }
            _ => panic!("expected MultiAsset outcome"),
        }
    }

    #[test]
    fn portfolio_ledger_rejects_beyond_max_total_positions() {
        let ledger = PortfolioLedger::new(
            RiskLimits {
                max_total_positions: 1,
                max_positions_per_symbol: 5,
                max_daily_drawdown_percent: 50.0,
            },
            dec!(10000),
        );
        ledger.check_and_reserve("EURUSD", dec!(10000)).unwrap();
        let err = ledger.check_and_reserve("GBPUSD", dec!(10000)).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
    }

    #[test]
    fn portfolio_ledger_rejects_beyond_daily_drawdown() {
        let ledger = PortfolioLedger::new(
            RiskLimits {
                max_total_positions: 10,
                max_positions_per_symbol: 10,
                max_daily_drawdown_percent: 5.0,
            },
            dec!(10000),
        );
        let err = ledger.check_and_reserve("EURUSD", dec!(9000)).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
    }
}
