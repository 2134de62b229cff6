//! Deterministic, replayable multi-timeframe backtest laboratory.

pub mod application;
pub mod config;
pub mod domain;
