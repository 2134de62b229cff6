//! Backtest Runner (C5): one disposable, isolated instance per `(config, assignment, seed)`.

use crate::application::lab::candle_cache::{CandleCache, HistoricalDataSource};
use crate::application::lab::replay_adapter::ReplayAdapter;
use crate::application::lab::strategy::{MtfView, SignalAction, Strategy};
use crate::domain::lab::errors::{LabError, LabResult};
use crate::domain::lab::metrics::Metrics;
use crate::domain::lab::types::{
    BacktestConfig, ClosedTrade, DatasetKey, OrderRequest, ParameterAssignment, RunRecord,
    RunStatus,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_MAX_CURVE_POINTS: usize = 200;

/// FNV-1a over a canonical string. Chosen over `DefaultHasher` because its algorithm is
/// fixed by definition rather than an unspecified implementation detail of the standard
/// library, so the same input hashes identically across hosts and Rust versions.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn config_hash(config: &BacktestConfig) -> u64 {
    let canonical = format!(
        "commission_per_lot={};initial_balance={};leverage={};max_positions={};max_spread_pips={};primary_tf={};risk_percent={};slippage_pips={};spread_pips={};strategy_tag={};symbol={};window_end={};window_start={}",
        config.commission_per_lot,
        config.initial_balance,
        config.leverage,
        config.max_positions,
        config.max_spread_pips,
        config.primary_tf,
        config.risk_percent,
        config.slippage_pips,
        config.spread_pips,
        config.strategy_tag,
        config.symbol,
        config.window_end,
        config.window_start,
    );
    fnv1a(&canonical)
}

pub fn params_hash(assignment: &ParameterAssignment) -> u64 {
    let canonical = assignment
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";");
    fnv1a(&canonical)
}

pub fn dataset_hash(symbol: &str, bar_counts: &[(String, usize)], window_start: i64, window_end: i64) -> u64 {
    let mut sorted = bar_counts.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let counts = sorted
        .iter()
        .map(|(tf, n)| format!("{tf}:{n}"))
        .collect::<Vec<_>>()
        .join(",");
    fnv1a(&format!("{symbol}|{counts}|{window_start}|{window_end}"))
}

pub struct RunnerConfig {
    pub analysis_interval_ms: i64,
    pub curve_sample_interval: usize,
    pub max_curve_points: usize,
    pub yield_interval: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: 0,
            curve_sample_interval: 1,
            max_curve_points: DEFAULT_MAX_CURVE_POINTS,
            yield_interval: 500,
        }
    }
}

struct CurveSampler {
    points: Vec<(i64, Decimal)>,
    max_points: usize,
}

impl CurveSampler {
    fn new(max_points: usize) -> Self {
        Self {
            points: Vec::new(),
            max_points,
        }
    }

    fn push(&mut self, ts: i64, value: Decimal) {
        self.points.push((ts, value));
        if self.points.len() > self.max_points {
            let mut kept = Vec::with_capacity(self.max_points);
            for (i, p) in self.points.iter().enumerate() {
                if i % 2 == 0 {
                    kept.push(*p);
                }
            }
            self.points = kept;
        }
    }
}

/// Composes C2+C3+C4 and drives the replay loop for exactly one run. Disposable: a fresh
/// instance is created per `(config, parameter_assignment, seed)`, never reused.
pub struct BacktestRunner<S: HistoricalDataSource> {
    cache: Arc<CandleCache<S>>,
    abort_flag: Arc<AtomicBool>,
}

impl<S: HistoricalDataSource> BacktestRunner<S> {
    pub fn new(cache: Arc<CandleCache<S>>) -> Self {
        Self {
            cache,
            abort_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Idempotent: a second call is a no-op.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort_flag.clone()
    }

    pub fn run(
        &self,
        config: &BacktestConfig,
        assignment: &ParameterAssignment,
        seed: u64,
        strategy: &mut dyn Strategy,
        runner_config: &RunnerConfig,
    ) -> LabResult<RunRecord> {
        self.run_with_risk_gate(config, assignment, seed, strategy, runner_config, None)
    }

    /// Same protocol as `run`, but wires `risk_gate` (a shared portfolio ledger in
    /// multi-asset mode) into the replay adapter so every order this run places is vetted
    /// against cross-symbol limits before it fills.
    pub fn run_with_risk_gate(
        &self,
        config: &BacktestConfig,
        assignment: &ParameterAssignment,
        seed: u64,
        strategy: &mut dyn Strategy,
        runner_config: &RunnerConfig,
        risk_gate: Option<Arc<dyn crate::application::lab::replay_adapter::RiskGate>>,
    ) -> LabResult<RunRecord> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let chash = config_hash(config);
        let phash = params_hash(assignment);

        let primary_key = DatasetKey {
            symbol: config.symbol.clone(),
            timeframe: config.primary_tf,
            window_start: config.window_start,
            window_end: config.window_end,
        };
        let primary_view = self.cache.get_or_load(&primary_key)?;

        let mut views = HashMap::new();
        let mut bar_counts = vec![(config.primary_tf.to_string(), primary_view.len())];
        views.insert(config.primary_tf, primary_view.clone());
        for tf in &config.aux_tfs {
            let key = DatasetKey {
                symbol: config.symbol.clone(),
                timeframe: *tf,
                window_start: config.window_start,
                window_end: config.window_end,
            };
            let view = self.cache.get_or_load(&key)?;
            bar_counts.push((tf.to_string(), view.len()));
            views.insert(*tf, view);
        }
        let dhash = dataset_hash(&config.symbol, &bar_counts, config.window_start, config.window_end);

        let warmup = (0.1 * primary_view.len() as f64).max(200.0) as usize;
        if primary_view.len() < warmup {
            return Err(LabError::DataInsufficient {
                symbol: config.symbol.clone(),
                have: primary_view.len(),
                need: warmup,
            });
        }

        strategy.update_parameters(assignment);

        let mut adapter = ReplayAdapter::load(
            &config.symbol,
            config.primary_tf,
            views,
            config.initial_balance,
            config.spread_pips,
            config.slippage_pips,
            config.commission_per_lot,
        )?;
        if let Some(gate) = risk_gate {
            adapter = adapter.with_risk_gate(gate);
        }

        for _ in 0..warmup {
            if !adapter.advance() {
                break;
            }
        }

        let mut last_analysis_ts = i64::MIN;
        let mut bar_index = 0usize;
        let mut equity_curve = CurveSampler::new(runner_config.max_curve_points);
        let mut drawdown_curve = CurveSampler::new(runner_config.max_curve_points);
        let mut aborted = false;

        while adapter.advance() {
            bar_index += 1;

            if self.abort_flag.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            let elapsed = adapter.simulated_ts() - last_analysis_ts;
            if elapsed >= runner_config.analysis_interval_ms {
                let primary_slice = adapter.candle_history(config.primary_tf, 500);
                let mut aux_slices = HashMap::new();
                let mut aux_owned = Vec::new();
                for tf in &config.aux_tfs {
                    aux_owned.push((*tf, adapter.candle_history(*tf, 500)));
                }
                for (tf, slice) in &aux_owned {
                    aux_slices.insert(*tf, slice.as_slice());
                }
                let mut slices = HashMap::new();
                slices.insert(config.primary_tf, primary_slice.as_slice());
                slices.extend(aux_slices);
                let mtf = MtfView {
                    primary_tf: config.primary_tf,
                    slices,
                };
                let tick = adapter.current_tick();
                let signal = strategy.analyze(&mtf, &tick, assignment);
                last_analysis_ts = adapter.simulated_ts();

                if signal.is_actionable()
                    && adapter.open_position_count_for(&config.symbol) < config.max_positions
                {
                    if let Some(order) = self.build_order(config, &adapter, signal) {
                        let _ = adapter.place_order(order, Some(config.max_spread_pips));
                    }
                }
            }

            if bar_index % runner_config.curve_sample_interval == 0 {
                let account = adapter.account_state();
                equity_curve.push(adapter.simulated_ts(), account.equity);
                drawdown_curve.push(adapter.simulated_ts(), account.current_drawdown);
            }

            if bar_index % runner_config.yield_interval == 0 {
                std::thread::yield_now();
                if self.abort_flag.load(Ordering::SeqCst) {
                    aborted = true;
                    break;
                }
            }
        }

        let mut trades: Vec<ClosedTrade> = adapter.closed_trades().to_vec();
        if !aborted {
            trades.extend(adapter.close_all_end_of_data());
            let account = adapter.account_state();
            equity_curve.push(adapter.simulated_ts(), account.equity);
            drawdown_curve.push(adapter.simulated_ts(), account.current_drawdown);
        }

        let metrics = Metrics::calculate(&trades, &equity_curve.points, config.initial_balance);

        Ok(RunRecord {
            run_id,
            config_hash: chash,
            params_hash: phash,
            dataset_hash: dhash,
            seed,
            started_at,
            finished_at: Some(chrono::Utc::now()),
            status: if aborted {
                RunStatus::Aborted
            } else {
                RunStatus::Completed
            },
            metrics: Some(metrics),
            trades,
            equity_curve: equity_curve.points,
            drawdown_curve: drawdown_curve.points,
            error_kind: None,
        })
    }

    fn build_order(
        &self,
        config: &BacktestConfig,
        adapter: &ReplayAdapter,
        signal: crate::application::lab::strategy::Signal,
    ) -> Option<OrderRequest> {
        use crate::domain::lab::types::OrderSide;

        let side = match signal.action {
            SignalAction::Buy => OrderSide::Buy,
            SignalAction::Sell => OrderSide::Sell,
            SignalAction::None => return None,
        };
        let tick = adapter.current_tick();
        let entry = match side {
            OrderSide::Buy => tick.ask,
            OrderSide::Sell => tick.bid,
        };
        let stop_loss = signal.stop_loss?;
        let spec = adapter.symbol_spec();
        let account = adapter.account_state();
        let risk_amount = config.risk_percent / Decimal::from(100) * account.balance;
        let stop_distance_pips = (entry - stop_loss).abs() / spec.pip_size;
        if stop_distance_pips <= Decimal::ZERO {
            return None;
        }
        let raw_lots = risk_amount / (stop_distance_pips * spec.pip_value_per_lot);

        let steps = (raw_lots / spec.step_volume).floor();
        let mut lots = steps * spec.step_volume;
        lots = lots.clamp(spec.min_volume, spec.max_volume);
        if lots <= Decimal::ZERO {
            lots = spec.min_volume;
        }

        Some(OrderRequest {
            symbol: config.symbol.clone(),
            side,
            volume_lots: lots,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            comment: None,
        })
    }
}
