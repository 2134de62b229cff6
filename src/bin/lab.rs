//! Backtest Lab CLI (C16): a `clap`-derive front end over the `Pipeline` façade.
//!
//! Candle data is supplied as one JSON file per `(symbol, timeframe)` under
//! `--data-dir`, named `{symbol}_{timeframe}.json` and holding a plain JSON array of
//! candles — the simplest loader that needs no dependency the rest of the crate does
//! not already carry. Anything more elaborate (a broker feed, a columnar store) is the
//! caller's `HistoricalDataSource` to write.

use backtest_lab::application::lab::batch_orchestrator::BatchConfig;
use backtest_lab::application::lab::candle_cache::{CandleCache, HistoricalDataSource};
use backtest_lab::application::lab::pipeline::{JobOutcome, Pipeline};
use backtest_lab::application::lab::strategy::{DonchianRsiStrategy, Strategy};
use backtest_lab::application::lab::walk_forward::WalkForwardConfig;
use backtest_lab::config::LabSettings;
use backtest_lab::domain::lab::errors::{LabError, LabResult};
use backtest_lab::domain::lab::monte_carlo::{MonteCarloConfig, ResampleMethod};
use backtest_lab::domain::lab::regime::RegimeDetectorConfig;
use backtest_lab::domain::lab::types::{BacktestConfig, Candle, ParameterDescriptor, RunStatus, SymbolSpec, Timeframe};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Deterministic multi-timeframe backtest laboratory", long_about = None)]
struct Cli {
    /// Directory of `{symbol}_{timeframe}.json` candle files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// TOML settings file; falls back to defaults for anything not present
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grid search over the shipped reference strategy's parameters
    Optimize {
        #[arg(long, default_value = "XAUUSD")]
        symbol: String,
        #[arg(long, default_value = "M5")]
        primary_tf: String,
        #[arg(long, default_value_t = 0)]
        window_start: i64,
        #[arg(long, default_value_t = i64::MAX)]
        window_end: i64,
        #[arg(long, default_value_t = 12345)]
        seed: u64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Rolling in-sample/out-of-sample walk-forward validation
    WalkForward {
        #[arg(long, default_value = "XAUUSD")]
        symbol: String,
        #[arg(long, default_value = "M5")]
        primary_tf: String,
        #[arg(long, default_value_t = 0)]
        window_start: i64,
        #[arg(long, default_value_t = i64::MAX)]
        window_end: i64,
        #[arg(long, default_value_t = 6)]
        window_months: i64,
        #[arg(long, default_value_t = 1)]
        step_months: i64,
        #[arg(long, default_value_t = 0.7)]
        in_sample_ratio: f64,
        #[arg(long, default_value_t = 12345)]
        seed: u64,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Monte-Carlo resampling over a single run's closed trades
    MonteCarlo {
        #[arg(long, default_value = "XAUUSD")]
        symbol: String,
        #[arg(long, default_value = "M5")]
        primary_tf: String,
        #[arg(long, default_value_t = 0)]
        window_start: i64,
        #[arg(long, default_value_t = i64::MAX)]
        window_end: i64,
        #[arg(long, default_value_t = 12345)]
        seed: u64,
        #[arg(long, default_value_t = 1000)]
        n_simulations: usize,
        #[arg(long, default_value = "trade-resampling")]
        method: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Rolling volatility/trend regime classification over raw candles
    Regime {
        #[arg(long, default_value = "XAUUSD")]
        symbol: String,
        #[arg(long, default_value = "M5")]
        primary_tf: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Loads each `(symbol, timeframe)` lazily from `{data_dir}/{symbol}_{timeframe}.json`,
/// a plain JSON array of candles. Holds no cache of its own — `CandleCache` owns that.
struct JsonFileSource {
    data_dir: PathBuf,
}

impl HistoricalDataSource for JsonFileSource {
    fn list_available(&self) -> Vec<(String, Timeframe, usize, i64, i64)> {
        Vec::new()
    }

    fn load(&self, symbol: &str, timeframe: Timeframe) -> LabResult<Vec<Candle>> {
        let path = self.data_dir.join(format!("{symbol}_{timeframe}.json"));
        let contents = std::fs::read_to_string(&path).map_err(|e| LabError::DataNotFound {
            symbol: format!("{symbol} ({}): {e}", path.display()),
            timeframe: timeframe.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| LabError::DataInvalidFormat {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })
    }
}

fn backtest_config(settings: &LabSettings, symbol: &str, primary_tf: Timeframe, window_start: i64, window_end: i64, seed: u64) -> BacktestConfig {
    BacktestConfig {
        symbol: symbol.to_string(),
        strategy_tag: "donchian_rsi".to_string(),
        window_start,
        window_end,
        initial_balance: settings.initial_balance,
        leverage: settings.leverage,
        commission_per_lot: settings.commission_per_lot,
        slippage_pips: settings.slippage_pips,
        spread_pips: settings.spread_pips,
        primary_tf,
        aux_tfs: Vec::new(),
        max_spread_pips: settings.max_spread_pips,
        max_positions: settings.max_positions,
        risk_percent: settings.risk_percent,
        seed,
    }
}

fn make_donchian_strategy(symbol: &str) -> impl Fn() -> Box<dyn Strategy> + Sync + Send + 'static {
    let pip_size = SymbolSpec::for_symbol(symbol).pip_size;
    move || Box::new(DonchianRsiStrategy::new(pip_size)) as Box<dyn Strategy>
}

fn default_descriptors(symbol: &str) -> Vec<ParameterDescriptor> {
    use rust_decimal_macros::dec;
    let pip_size = SymbolSpec::for_symbol(symbol).pip_size;
    let base = DonchianRsiStrategy::new(pip_size).parameter_descriptors();
    base.into_iter()
        .map(|d| match d.name.as_str() {
            "donchian_period" => d.with_range(dec!(10), dec!(30), dec!(5)).enabled(),
            "rsi_period" => d.with_range(dec!(7), dec!(21), dec!(7)).enabled(),
            _ => d,
        })
        .collect()
}

fn write_output(output: &Option<PathBuf>, json: &serde_json::Value) -> LabResult<()> {
    let text = serde_json::to_string_pretty(json).map_err(|e| LabError::InternalError {
        reason: e.to_string(),
    })?;
    match output {
        Some(path) => std::fs::write(path, text).map_err(|e| LabError::InternalError {
            reason: format!("failed to write '{}': {e}", path.display()),
        }),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn poll_until_done<S: HistoricalDataSource + 'static>(pipeline: &Pipeline<S>, run_id: &str) -> LabResult<JobOutcome> {
    loop {
        match pipeline.status(run_id) {
            Some(RunStatus::Completed) | Some(RunStatus::Aborted) | Some(RunStatus::Error) => break,
            Some(_) => std::thread::sleep(Duration::from_millis(50)),
            None => {
                return Err(LabError::InternalError {
                    reason: format!("unknown run id '{run_id}'"),
                });
            }
        }
    }
    pipeline.result(run_id).unwrap_or_else(|| {
        Err(LabError::InternalError {
            reason: "job finished without a result".into(),
        })
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => LabSettings::from_file(path)?,
        None => LabSettings::default(),
    };

    let source = Arc::new(JsonFileSource {
        data_dir: cli.data_dir.clone(),
    });
    let cache = Arc::new(CandleCache::new(source, settings.cache_high_water_bars));
    let pipeline = Pipeline::new(cache.clone());

    match cli.command {
        Commands::Optimize {
            symbol,
            primary_tf,
            window_start,
            window_end,
            seed,
            output,
        } => {
            let primary_tf = Timeframe::from_str(&primary_tf).map_err(|reason| LabError::ConfigInvalid { reason })?;
            let config = backtest_config(&settings, &symbol, primary_tf, window_start, window_end, seed);
            let descriptors = default_descriptors(&symbol);
            info!(symbol = %symbol, descriptors = descriptors.len(), "starting optimization");
            let run_id = pipeline.start_optimization(
                config,
                descriptors,
                settings.combination_limit,
                seed,
                BatchConfig {
                    batch_size: settings.batch_size,
                    top_n_per_category: settings.top_n_per_category,
                    concurrency: settings.concurrency,
                },
                make_donchian_strategy(&symbol),
            )?;
            let outcome = poll_until_done(&pipeline, &run_id)?;
            if let JobOutcome::Optimization(batch) = outcome {
                let best = batch
                    .records
                    .iter()
                    .filter_map(|r| r.metrics.as_ref().map(|m| m.composite_score))
                    .fold(f64::MIN, f64::max);
                let best = if best == f64::MIN { None } else { Some(best) };
                write_output(
                    &output,
                    &serde_json::json!({
                        "runs": batch.records.len(),
                        "failures": batch.failures.len(),
                        "top_n": batch.top_n,
                        "best_composite_score": best,
                    }),
                )?;
            }
        }
        Commands::WalkForward {
            symbol,
            primary_tf,
            window_start,
            window_end,
            window_months,
            step_months,
            in_sample_ratio,
            seed,
            output,
        } => {
            let primary_tf = Timeframe::from_str(&primary_tf).map_err(|reason| LabError::ConfigInvalid { reason })?;
            let config = backtest_config(&settings, &symbol, primary_tf, window_start, window_end, seed);
            let descriptors = default_descriptors(&symbol);
            let run_id = pipeline.start_walkforward(
                config,
                descriptors,
                settings.combination_limit,
                seed,
                BatchConfig {
                    batch_size: settings.batch_size,
                    top_n_per_category: settings.top_n_per_category,
                    concurrency: settings.concurrency,
                },
                WalkForwardConfig {
                    window_months,
                    step_months,
                    in_sample_ratio,
                },
                make_donchian_strategy(&symbol),
            )?;
            let outcome = poll_until_done(&pipeline, &run_id)?;
            if let JobOutcome::WalkForward(result) = outcome {
                write_output(
                    &output,
                    &serde_json::json!({
                        "segments": result.segments.len(),
                        "stability_score": result.stability_score,
                        "confidence": result.confidence,
                        "stitched_oos_points": result.stitched_oos_equity.len(),
                    }),
                )?;
            }
        }
        Commands::MonteCarlo {
            symbol,
            primary_tf,
            window_start,
            window_end,
            seed,
            n_simulations,
            method,
            output,
        } => {
            let primary_tf = Timeframe::from_str(&primary_tf).map_err(|reason| LabError::ConfigInvalid { reason })?;
            let config = backtest_config(&settings, &symbol, primary_tf, window_start, window_end, seed);
            let mut strategy = DonchianRsiStrategy::new(SymbolSpec::for_symbol(&symbol).pip_size);
            let runner = backtest_lab::application::lab::runner::BacktestRunner::new(cache.clone());
            let assignment = backtest_lab::domain::lab::types::ParameterAssignment::new();
            let record = runner.run(
                &config,
                &assignment,
                seed,
                &mut strategy,
                &backtest_lab::application::lab::runner::RunnerConfig::default(),
            )?;

            let method = match method.as_str() {
                "block-bootstrap" => ResampleMethod::BlockBootstrap,
                "randomize-order" => ResampleMethod::RandomizeOrder,
                _ => ResampleMethod::TradeResampling,
            };
            let mc_config = MonteCarloConfig::new(n_simulations, seed, method, settings.initial_balance);
            let run_id = pipeline.start_monte_carlo(record.trades, mc_config)?;
            let outcome = poll_until_done(&pipeline, &run_id)?;
            if let JobOutcome::MonteCarlo(result) = outcome {
                write_output(
                    &output,
                    &serde_json::json!({
                        "mean_final_equity": result.final_equity.mean,
                        "p5_final_equity": result.final_equity.p5,
                        "p95_final_equity": result.final_equity.p95,
                        "ruin_probability": result.ruin_probability,
                        "confidence_interval": result.confidence_interval,
                    }),
                )?;
            }
        }
        Commands::Regime {
            symbol,
            primary_tf,
            output,
        } => {
            let primary_tf = Timeframe::from_str(&primary_tf).map_err(|reason| LabError::ConfigInvalid { reason })?;
            let key = backtest_lab::domain::lab::types::DatasetKey {
                symbol: symbol.clone(),
                timeframe: primary_tf,
                window_start: 0,
                window_end: i64::MAX,
            };
            let view = cache.get_or_load(&key)?;
            let run_id = pipeline.start_regime((*view).clone(), RegimeDetectorConfig::default())?;
            let outcome = poll_until_done(&pipeline, &run_id)?;
            if let JobOutcome::Regime(periods) = outcome {
                write_output(
                    &output,
                    &serde_json::json!({
                        "periods": periods.iter().map(|p| serde_json::json!({
                            "tag": p.tag.as_str(),
                            "start_ts": p.start_ts,
                            "end_ts": p.end_ts,
                            "confidence": p.confidence,
                        })).collect::<Vec<_>>(),
                    }),
                )?;
            }
        }
    }

    Ok(())
}
