//! Batch Orchestrator (C8): fixed-size batches of runners, bounded top-N tracking, abort.

use crate::application::lab::candle_cache::{CandleCache, HistoricalDataSource};
use crate::application::lab::memory_manager::MemoryManager;
use crate::application::lab::runner::{BacktestRunner, RunnerConfig};
use crate::application::lab::strategy::Strategy;
use crate::domain::lab::errors::LabError;
use crate::domain::lab::types::{BacktestConfig, ParameterAssignment, RunRecord};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Starting,
    Running,
    Completed,
    Aborted,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub top_n_per_category: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RankCategory {
    Profitability,
    RecoveryFactor,
    MinDrawdown,
    WinRate,
}

impl RankCategory {
    pub fn all() -> [RankCategory; 4] {
        [
            RankCategory::Profitability,
            RankCategory::RecoveryFactor,
            RankCategory::MinDrawdown,
            RankCategory::WinRate,
        ]
    }

    fn key(&self, record: &RunRecord) -> f64 {
        let metrics = match &record.metrics {
            Some(m) => m,
            None => return f64::NEG_INFINITY,
        };
        match self {
            RankCategory::Profitability => {
                use rust_decimal::prelude::ToPrimitive;
                metrics.net_profit.to_f64().unwrap_or(0.0)
            }
            RankCategory::RecoveryFactor => metrics.recovery_factor,
            RankCategory::MinDrawdown => -metrics.max_drawdown_percent,
            RankCategory::WinRate => metrics.win_rate,
        }
    }
}

/// A bounded max-by-key collection, evicting the smallest entry once at capacity.
/// `top_n` stays O(log N) per insert via a linear scan-and-replace, acceptable at the
/// small `top_n` sizes this orchestrator is configured with.
struct TopN {
    capacity: usize,
    entries: Vec<(f64, usize)>, // (key, index into the run list)
}

impl TopN {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    fn offer(&mut self, key: f64, index: usize) {
        if self.entries.len() < self.capacity {
            self.entries.push((key, index));
            self.entries
                .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            return;
        }
        if let Some(worst) = self.entries.last().copied() {
            if key > worst.0 {
                self.entries.pop();
                self.entries.push((key, index));
                self.entries
                    .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            }
        }
    }

    fn indices(&self) -> Vec<usize> {
        self.entries.iter().map(|(_, i)| i).copied().collect()
    }
}

pub struct BatchResult {
    pub state: OrchestratorState,
    pub records: Vec<RunRecord>,
    pub top_n: std::collections::BTreeMap<&'static str, Vec<usize>>,
    pub failures: Vec<(u64, LabError)>,
}

fn category_name(c: RankCategory) -> &'static str {
    match c {
        RankCategory::Profitability => "profitability",
        RankCategory::RecoveryFactor => "recovery_factor",
        RankCategory::MinDrawdown => "min_drawdown",
        RankCategory::WinRate => "win_rate",
    }
}

pub struct BatchOrchestrator<S: HistoricalDataSource> {
    cache: Arc<CandleCache<S>>,
    abort_flag: Arc<AtomicBool>,
}

impl<S: HistoricalDataSource + 'static> BatchOrchestrator<S> {
    pub fn new(cache: Arc<CandleCache<S>>) -> Self {
        Self {
            cache,
            abort_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort_flag.clone()
    }

    /// Runs `assignments` against `config` in fixed-size batches, up to `concurrency`
    /// runners in parallel per batch, tracking top-N per category and any failures.
    pub fn run_batches<F>(
        &self,
        config: &BacktestConfig,
        assignments: &[ParameterAssignment],
        seed: u64,
        batch_config: &BatchConfig,
        make_strategy: F,
    ) -> BatchResult
    where
        F: Fn() -> Box<dyn Strategy> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(batch_config.concurrency.max(1))
            .build()
            .expect("thread pool construction");

        let memory_manager = MemoryManager::new(self.cache.clone(), 500_000);

        let mut records: Vec<RunRecord> = Vec::with_capacity(assignments.len());
        let mut failures = Vec::new();
        let mut aborted = false;
        let mut catastrophic: Option<LabError> = None;

        for batch in assignments.chunks(batch_config.batch_size) {
            if self.abort_flag.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }

            let runner = BacktestRunner::new(self.cache.clone());
            let runner_config = RunnerConfig::default();
            let results: Vec<(u64, Result<RunRecord, LabError>)> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|assignment| {
                        let mut strategy = make_strategy();
                        let hash = crate::application::lab::runner::params_hash(assignment);
                        let outcome =
                            runner.run(config, assignment, seed, strategy.as_mut(), &runner_config);
                        (hash, outcome)
                    })
                    .collect()
            });

            for (hash, outcome) in results {
                match outcome {
                    Ok(record) => records.push(record),
                    Err(err) if err.is_catastrophic() => {
                        catastrophic = Some(err);
                    }
                    Err(err) => failures.push((hash, err)),
                }
            }

            if catastrophic.is_some() {
                break;
            }

            memory_manager.try_free_memory();

            if self.abort_flag.load(Ordering::SeqCst) {
                aborted = true;
                break;
            }
        }

        let final_state = if catastrophic.is_some() {
            OrchestratorState::Error
        } else if aborted {
            OrchestratorState::Aborted
        } else {
            OrchestratorState::Completed
        };

        let mut top_n = std::collections::BTreeMap::new();
        for category in RankCategory::all() {
            let mut tracker = TopN::new(batch_config.top_n_per_category);
            for (idx, record) in records.iter().enumerate() {
                tracker.offer(category.key(record), idx);
            }
            top_n.insert(category_name(category), tracker.indices());
        }

        BatchResult {
            state: final_state,
            records,
            top_n,
            failures,
        }
    }
}
