//! Config Surface (C14): a closed, `serde`-deserializable settings record loaded from
//! TOML, mirroring the reference codebase's own TOML-based grid-config loader.

use crate::domain::lab::errors::{LabError, LabResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Every configuration knob from SPEC_FULL.md §6, plus the deployment-level fields
/// (`log_level`, `worker_threads`) that knob table does not cover. Individual
/// `BacktestConfig`/`BatchConfig`/`WalkForwardConfig`/`MonteCarloConfig` records are
/// derived from this or supplied per-job; this struct itself never reaches the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSettings {
    pub combination_limit: u64,
    pub batch_size: usize,
    pub top_n_per_category: usize,
    pub concurrency: usize,
    pub yield_interval: usize,
    pub curve_sample_interval: usize,
    pub max_curve_points: usize,
    pub analysis_interval_ms: i64,
    pub cache_high_water_bars: usize,
    pub memory_pressure_percent: u8,

    pub initial_balance: Decimal,
    pub leverage: Decimal,
    pub commission_per_lot: Decimal,
    pub slippage_pips: Decimal,
    pub spread_pips: Decimal,
    pub max_spread_pips: Decimal,
    pub max_positions: usize,
    pub risk_percent: Decimal,

    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for LabSettings {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            combination_limit: 10_000,
            batch_size: 50,
            top_n_per_category: 10,
            concurrency: default_worker_threads(),
            yield_interval: 500,
            curve_sample_interval: 1,
            max_curve_points: 200,
            analysis_interval_ms: 0,
            cache_high_water_bars: 2_000_000,
            memory_pressure_percent: 85,
            initial_balance: dec!(10000),
            leverage: dec!(100),
            commission_per_lot: dec!(3),
            slippage_pips: dec!(0.5),
            spread_pips: dec!(1),
            max_spread_pips: dec!(5),
            max_positions: 3,
            risk_percent: dec!(1),
            log_level: default_log_level(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl LabSettings {
    pub fn from_toml_str(contents: &str) -> LabResult<Self> {
        toml::from_str(contents).map_err(|e| LabError::ConfigInvalid {
            reason: e.to_string(),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> LabResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| LabError::ConfigInvalid {
            reason: format!("failed to read '{}': {e}", path.as_ref().display()),
        })?;
        Self::from_toml_str(&contents)
    }
}
