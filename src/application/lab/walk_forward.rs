//! Walk-Forward Controller (C9): rolling in-sample/out-of-sample segmentation.

use crate::application::lab::batch_orchestrator::{BatchConfig, BatchOrchestrator};
use crate::application::lab::candle_cache::HistoricalDataSource;
use crate::application::lab::runner::{BacktestRunner, RunnerConfig};
use crate::application::lab::strategy::Strategy;
use crate::domain::lab::errors::{LabError, LabResult};
use crate::domain::lab::metrics::Metrics;
use crate::domain::lab::types::{BacktestConfig, ParameterAssignment};
use rust_decimal::Decimal;
use std::sync::Arc;

const DAY_MS: i64 = 86_400_000;
const MONTH_MS: i64 = 30 * DAY_MS;

#[derive(Debug, Clone, Copy)]
pub struct WalkForwardConfig {
    pub window_months: i64,
    pub step_months: i64,
    pub in_sample_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct SegmentWindow {
    pub is_start: i64,
    pub is_end: i64,
    pub oos_start: i64,
    pub oos_end: i64,
}

/// Computes `[is_window, oos_window]` pairs per SPEC_FULL.md §4.9. A "month" is exactly
/// 30 days.
pub fn segment_windows(
    window_start: i64,
    window_end: i64,
    config: &WalkForwardConfig,
) -> Vec<SegmentWindow> {
    let segment_length = config.window_months * MONTH_MS;
    let step = config.step_months * MONTH_MS;
    let is_length = (segment_length as f64 * config.in_sample_ratio) as i64;

    let mut segments = Vec::new();
    let mut start = window_start;
    while start + segment_length <= window_end {
        segments.push(SegmentWindow {
            is_start: start,
            is_end: start + is_length,
            oos_start: start + is_length,
            oos_end: start + segment_length,
        });
        start += step;
    }
    segments
}

#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub is_metrics: Metrics,
    pub oos_metrics: Metrics,
    pub degradation_percent: f64,
    pub robust: bool,
}

pub struct WalkForwardResult {
    pub segments: Vec<SegmentRecord>,
    pub stitched_oos_equity: Vec<(i64, Decimal)>,
    pub stability_score: f64,
    pub confidence: f64,
}

pub struct WalkForwardController<S: HistoricalDataSource> {
    cache: Arc<crate::application::lab::candle_cache::CandleCache<S>>,
}

impl<S: HistoricalDataSource + 'static> WalkForwardController<S> {
    pub fn new(cache: Arc<crate::application::lab::candle_cache::CandleCache<S>>) -> Self {
        Self { cache }
    }

    pub fn run<F>(
        &self,
        base_config: &BacktestConfig,
        assignments: &[ParameterAssignment],
        seed: u64,
        wf_config: &WalkForwardConfig,
        batch_config: &BatchConfig,
        make_strategy: F,
    ) -> LabResult<WalkForwardResult>
    where
        F: Fn() -> Box<dyn Strategy> + Sync,
    {
        let windows = segment_windows(base_config.window_start, base_config.window_end, wf_config);
        if windows.is_empty() {
            return Err(LabError::ConfigInvalid {
                reason: "walk-forward window is shorter than one segment".into(),
            });
        }

        let orchestrator = BatchOrchestrator::new(self.cache.clone());
        let mut segments = Vec::with_capacity(windows.len());
        let mut stitched: Vec<(i64, Decimal)> = Vec::new();
        let mut offset = Decimal::ZERO;
        let mut oos_sharpes = Vec::with_capacity(windows.len());

        for window in &windows {
            let is_config = BacktestConfig {
                window_start: window.is_start,
                window_end: window.is_end,
                ..base_config.clone()
            };
            let batch = orchestrator.run_batches(&is_config, assignments, seed, batch_config, &make_strategy);
            if batch.records.is_empty() {
                continue;
            }
            let best = batch
                .records
                .iter()
                .max_by(|a, b| {
                    let sa = a.metrics.as_ref().map(|m| m.composite_score).unwrap_or(f64::MIN);
                    let sb = b.metrics.as_ref().map(|m| m.composite_score).unwrap_or(f64::MIN);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap();
            let best_assignment = assignments
                .iter()
                .find(|a| crate::application::lab::runner::params_hash(a) == best.params_hash)
                .cloned()
                .unwrap_or_default();
            let is_metrics = best.metrics.clone().unwrap();

            let oos_config = BacktestConfig {
                window_start: window.oos_start,
                window_end: window.oos_end,
                ..base_config.clone()
            };
            let fresh_runner = BacktestRunner::new(self.cache.clone());
            let mut strategy = make_strategy();
            let oos_record = fresh_runner.run(
                &oos_config,
                &best_assignment,
                seed,
                strategy.as_mut(),
                &RunnerConfig::default(),
            )?;
            let oos_metrics = oos_record.metrics.clone().unwrap_or_else(|| {
                Metrics::calculate(&[], &[], oos_config.initial_balance)
            });

            let is_score = is_metrics.composite_score;
            let oos_score = oos_metrics.composite_score;
            let degradation_percent = if is_score.abs() > f64::EPSILON {
                100.0 * (is_score - oos_score) / is_score.abs()
            } else {
                0.0
            };
            let robust = degradation_percent <= 40.0;
            oos_sharpes.push(oos_metrics.sharpe);

            for (ts, equity) in &oos_record.equity_curve {
                stitched.push((*ts, *equity + offset));
            }
            if let Some((_, last_equity)) = oos_record.equity_curve.last() {
                offset += *last_equity - oos_config.initial_balance;
            }

            segments.push(SegmentRecord {
                is_metrics,
                oos_metrics,
                degradation_percent,
                robust,
            });
        }

        let total_segments = segments.len().max(1);
        let robust_segments = segments.iter().filter(|s| s.robust).count();
        let stability_score = 100.0 * robust_segments as f64 / total_segments as f64;

        let variance = if oos_sharpes.len() > 1 {
            let mean = oos_sharpes.iter().sum::<f64>() / oos_sharpes.len() as f64;
            oos_sharpes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / oos_sharpes.len() as f64
        } else {
            0.0
        };
        let confidence = 100.0 / (1.0 + variance);

        Ok(WalkForwardResult {
            segments,
            stitched_oos_equity: stitched,
            stability_score,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_windows_cover_whole_range_with_no_step() {
        let config = WalkForwardConfig {
            window_months: 3,
            step_months: 3,
            in_sample_ratio: 0.7,
        };
        let windows = segment_windows(0, 9 * MONTH_MS, &config);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].is_start, 0);
        assert_eq!(windows[0].oos_end, 3 * MONTH_MS);
        assert_eq!(windows[1].is_start, 3 * MONTH_MS);
    }

    #[test]
    fn in_sample_ratio_splits_segment_correctly() {
        let config = WalkForwardConfig {
            window_months: 2,
            step_months: 2,
            in_sample_ratio: 0.5,
        };
        let windows = segment_windows(0, 2 * MONTH_MS, &config);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].is_end, MONTH_MS);
        assert_eq!(windows[0].oos_start, MONTH_MS);
    }

    #[test]
    fn too_short_window_yields_no_segments() {
        let config = WalkForwardConfig {
            window_months: 6,
            step_months: 3,
            in_sample_ratio: 0.7,
        };
        let windows = segment_windows(0, 2 * MONTH_MS, &config);
        assert!(windows.is_empty());
    }
}
