//! Monte-Carlo Resampler (C10): trade-sequence replicate statistics.

use crate::domain::lab::rng::SeededRng;
use crate::domain::lab::stats::{self, SummaryStats};
use crate::domain::lab::types::ClosedTrade;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMethod {
    BlockBootstrap,
    TradeResampling,
    RandomizeOrder,
}

#[derive(Debug, Clone, Copy)]
pub struct MonteCarloConfig {
    pub n_simulations: usize,
    pub seed: u64,
    pub method: ResampleMethod,
    pub initial_balance: Decimal,
    pub ruin_threshold: Decimal,
    pub confidence_level: f64,
}

impl MonteCarloConfig {
    pub fn new(n_simulations: usize, seed: u64, method: ResampleMethod, initial_balance: Decimal) -> Self {
        Self {
            n_simulations,
            seed,
            method,
            initial_balance,
            ruin_threshold: Decimal::ZERO,
            confidence_level: 95.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonteCarloResult {
    pub final_equity: SummaryStats,
    pub max_drawdown: SummaryStats,
    pub ruin_probability: f64,
    pub confidence_interval: (f64, f64),
}

/// Open question 2 (SPEC_FULL.md §9): default block length is `⌊√n⌋`, minimum 1.
fn block_length(n: usize) -> usize {
    ((n as f64).sqrt().floor() as usize).max(1)
}

fn replicate_indices(n: usize, method: ResampleMethod, rng: &mut SeededRng) -> Vec<usize> {
    match method {
        ResampleMethod::TradeResampling => (0..n).map(|_| rng.next_below(n)).collect(),
        ResampleMethod::RandomizeOrder => {
            let mut indices: Vec<usize> = (0..n).collect();
            rng.shuffle(&mut indices);
            indices
        }
        ResampleMethod::BlockBootstrap => {
            let len = block_length(n);
            let num_blocks = n.div_ceil(len);
            let mut out = Vec::with_capacity(n + len);
            while out.len() < n {
                let block_start = rng.next_below(num_blocks) * len;
                for offset in 0..len {
                    let idx = block_start + offset;
                    if idx < n {
                        out.push(idx);
                    }
                }
            }
            out.truncate(n);
            out
        }
    }
}

/// Reconstructs an equity curve for one replicate and returns `(final_equity, max_drawdown,
/// hit_ruin)`.
fn replicate_curve(
    trades: &[ClosedTrade],
    indices: &[usize],
    initial_balance: Decimal,
    ruin_threshold: Decimal,
) -> (Decimal, Decimal, bool) {
    let mut equity = initial_balance;
    let mut peak = initial_balance;
    let mut max_dd = Decimal::ZERO;
    let mut hit_ruin = equity <= ruin_threshold;
    for &idx in indices {
        equity += trades[idx].realized_pnl;
        if equity > peak {
            peak = equity;
        }
        let dd = peak - equity;
        if dd > max_dd {
            max_dd = dd;
        }
        if equity <= ruin_threshold {
            hit_ruin = true;
        }
    }
    (equity, max_dd, hit_ruin)
}

/// Runs `config.n_simulations` replicates from a single RNG sub-stream, so re-running the
/// same `(trades, method, n_simulations, seed)` reproduces byte-identical statistics.
pub fn simulate(trades: &[ClosedTrade], config: &MonteCarloConfig) -> MonteCarloResult {
    let n = trades.len();
    if n == 0 {
        return MonteCarloResult {
            final_equity: stats::summarize(&[]),
            max_drawdown: stats::summarize(&[]),
            ruin_probability: 0.0,
            confidence_interval: (0.0, 0.0),
        };
    }

    let mut rng = SeededRng::new(config.seed).spawn(0);
    let mut final_equities = Vec::with_capacity(config.n_simulations);
    let mut max_drawdowns = Vec::with_capacity(config.n_simulations);
    let mut ruin_count = 0usize;

    for _ in 0..config.n_simulations {
        let indices = replicate_indices(n, config.method, &mut rng);
        let (final_equity, max_dd, hit_ruin) =
            replicate_curve(trades, &indices, config.initial_balance, config.ruin_threshold);
        final_equities.push(final_equity.to_f64().unwrap_or(0.0));
        max_drawdowns.push(max_dd.to_f64().unwrap_or(0.0));
        if hit_ruin {
            ruin_count += 1;
        }
    }

    let final_equity_stats = stats::summarize(&final_equities);
    let max_drawdown_stats = stats::summarize(&max_drawdowns);
    let ruin_probability = ruin_count as f64 / config.n_simulations as f64;

    let alpha = 1.0 - config.confidence_level / 100.0;
    let lower_pct = (alpha / 2.0 * 100.0).round() as i32;
    let upper_pct = ((1.0 - alpha / 2.0) * 100.0).round() as i32;
    let mut sorted = final_equities.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let confidence_interval = (
        percentile_of_sorted(&sorted, lower_pct as f64),
        percentile_of_sorted(&sorted, upper_pct as f64),
    );

    MonteCarloResult {
        final_equity: final_equity_stats,
        max_drawdown: max_drawdown_stats,
        ruin_probability,
        confidence_interval,
    }
}

fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}
