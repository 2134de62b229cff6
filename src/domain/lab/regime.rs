//! Regime Detector (C11): rolling classification + segment merging.

use crate::domain::lab::metrics::Metrics;
use crate::domain::lab::stats;
use crate::domain::lab::types::{Candle, ClosedTrade};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegimeTag {
    TrendingUp,
    TrendingDown,
    Ranging,
    HighVolatility,
    LowVolatility,
}

impl RegimeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeTag::TrendingUp => "TRENDING_UP",
            RegimeTag::TrendingDown => "TRENDING_DOWN",
            RegimeTag::Ranging => "RANGING",
            RegimeTag::HighVolatility => "HIGH_VOLATILITY",
            RegimeTag::LowVolatility => "LOW_VOLATILITY",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegimePeriod {
    pub tag: RegimeTag,
    pub start_ts: i64,
    pub end_ts: i64,
    pub confidence: f64,
    pub avg_volatility: f64,
    pub trend_strength: f64,
    pub avg_range: f64,
    pub duration_days: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RegimeDetectorConfig {
    pub regime_lookback: usize,
    pub trend_threshold: f64,
}

impl Default for RegimeDetectorConfig {
    fn default() -> Self {
        Self {
            regime_lookback: 20,
            trend_threshold: 0.5,
        }
    }
}

struct BarSample {
    ts: i64,
    volatility: f64,
    trend_strength: f64,
    range_pct: f64,
}

fn atr(window: &[Candle]) -> Decimal {
    if window.len() < 2 {
        return Decimal::ZERO;
    }
    let mut sum = Decimal::ZERO;
    for i in 1..window.len() {
        let high = window[i].high;
        let low = window[i].low;
        let prev_close = window[i - 1].close;
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        sum += tr;
    }
    sum / Decimal::from(window.len() - 1)
}

fn trend_strength(window: &[Candle]) -> f64 {
    let n = window.len();
    if n < 2 {
        return 0.0;
    }
    let prices: Vec<f64> = window.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect();
    let n_f = n as f64;
    let x_sum: f64 = (0..n).map(|i| i as f64).sum();
    let y_sum: f64 = prices.iter().sum();
    let xy_sum: f64 = prices.iter().enumerate().map(|(i, p)| i as f64 * p).sum();
    let x2_sum: f64 = (0..n).map(|i| (i * i) as f64).sum();
    let denom = n_f * x2_sum - x_sum * x_sum;
    if denom == 0.0 {
        return 0.0;
    }
    let slope = (n_f * xy_sum - x_sum * y_sum) / denom;
    let first_price = prices[0].max(0.0001);
    slope / first_price * 1000.0
}

/// Classifies a price series into an ordered list of merged regime periods.
pub fn detect(candles: &[Candle], config: &RegimeDetectorConfig) -> Vec<RegimePeriod> {
    let lookback = config.regime_lookback;
    if candles.len() < lookback {
        return Vec::new();
    }

    let mut samples = Vec::with_capacity(candles.len() - lookback + 1);
    for i in (lookback - 1)..candles.len() {
        let window = &candles[(i + 1 - lookback)..=i];
        let atr_val = atr(window).to_f64().unwrap_or(0.0);
        let price = window.last().unwrap().close.to_f64().unwrap_or(1.0).max(0.0001);
        let volatility = atr_val / price * 100.0;
        let range_pct: f64 = window
            .iter()
            .map(|c| {
                let high = c.high.to_f64().unwrap_or(0.0);
                let low = c.low.to_f64().unwrap_or(0.0);
                let close = c.close.to_f64().unwrap_or(1.0).max(0.0001);
                (high - low) / close * 100.0
            })
            .sum::<f64>()
            / window.len() as f64;
        samples.push(BarSample {
            ts: window.last().unwrap().ts,
            volatility,
            trend_strength: trend_strength(window),
            range_pct,
        });
    }

    let volatilities: Vec<f64> = samples.iter().map(|s| s.volatility).collect();
    let vol_stats = stats::summarize(&volatilities);

    let bar_duration_ms = if candles.len() >= 2 {
        (candles[1].ts - candles[0].ts).max(1)
    } else {
        1
    };

    let mut tagged: Vec<(RegimeTag, &BarSample)> = Vec::with_capacity(samples.len());
    for sample in &samples {
        let tag = if sample.trend_strength.abs() > config.trend_threshold {
            if sample.trend_strength > 0.0 {
                RegimeTag::TrendingUp
            } else {
                RegimeTag::TrendingDown
            }
        } else if sample.volatility > vol_stats.p90 {
            RegimeTag::HighVolatility
        } else if sample.volatility < vol_stats.p10 {
            RegimeTag::LowVolatility
        } else {
            RegimeTag::Ranging
        };
        tagged.push((tag, sample));
    }

    merge_periods(&tagged, bar_duration_ms)
}

fn merge_periods(tagged: &[(RegimeTag, &BarSample)], bar_duration_ms: i64) -> Vec<RegimePeriod> {
    let mut periods = Vec::new();
    let mut idx = 0;
    while idx < tagged.len() {
        let tag = tagged[idx].0;
        let start = idx;
        while idx < tagged.len() && tagged[idx].0 == tag {
            idx += 1;
        }
        let group = &tagged[start..idx];
        let avg_volatility = group.iter().map(|(_, s)| s.volatility).sum::<f64>() / group.len() as f64;
        let avg_trend = group.iter().map(|(_, s)| s.trend_strength).sum::<f64>() / group.len() as f64;
        let avg_range = group.iter().map(|(_, s)| s.range_pct).sum::<f64>() / group.len() as f64;
        let start_ts = group.first().unwrap().1.ts;
        let end_ts = group.last().unwrap().1.ts + bar_duration_ms;
        let duration_days = (end_ts - start_ts) as f64 / 86_400_000.0;
        let confidence = ((group.len() as f64 / tagged.len().max(1) as f64) * 100.0 + 50.0).min(100.0);
        periods.push(RegimePeriod {
            tag,
            start_ts,
            end_ts,
            confidence,
            avg_volatility,
            trend_strength: avg_trend,
            avg_range,
            duration_days,
        });
    }
    periods
}

/// `{tag → percent_of_time, total_days}` summary over an already-merged period list.
pub fn distribution_summary(periods: &[RegimePeriod]) -> (BTreeMap<&'static str, f64>, f64) {
    let total_days: f64 = periods.iter().map(|p| p.duration_days).sum();
    let mut summary = BTreeMap::new();
    if total_days <= 0.0 {
        return (summary, 0.0);
    }
    for period in periods {
        *summary.entry(period.tag.as_str()).or_insert(0.0) +=
            period.duration_days / total_days * 100.0;
    }
    (summary, total_days)
}

fn regime_at(periods: &[RegimePeriod], ts: i64) -> Option<RegimeTag> {
    periods
        .iter()
        .find(|p| ts >= p.start_ts && ts < p.end_ts)
        .map(|p| p.tag)
}

/// Attributes each trade to the regime active at its entry and aggregates per-regime
/// metrics.
pub fn attribute_trades(
    periods: &[RegimePeriod],
    trades: &[ClosedTrade],
    equity_curve: &[(i64, Decimal)],
    initial_balance: Decimal,
) -> BTreeMap<&'static str, Metrics> {
    let mut buckets: BTreeMap<&'static str, Vec<ClosedTrade>> = BTreeMap::new();
    for trade in trades {
        if let Some(tag) = regime_at(periods, trade.entry_ts) {
            buckets.entry(tag.as_str()).or_default().push(trade.clone());
        }
    }
    buckets
        .into_iter()
        .map(|(tag, trades)| (tag, Metrics::calculate(&trades, equity_curve, initial_balance)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            ts: i * 3_600_000,
            open: Decimal::try_from(close).unwrap(),
            high: Decimal::try_from(close + 1.0).unwrap(),
            low: Decimal::try_from(close - 1.0).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: dec!(100),
        }
    }

    #[test]
    fn short_series_yields_no_periods() {
        let candles = vec![candle(0, 100.0); 5];
        let config = RegimeDetectorConfig::default();
        assert!(detect(&candles, &config).is_empty());
    }

    #[test]
    fn uptrend_series_tags_trending_up() {
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0 + i as f64 * 2.0)).collect();
        let config = RegimeDetectorConfig {
            regime_lookback: 20,
            trend_threshold: 0.1,
        };
        let periods = detect(&candles, &config);
        assert!(!periods.is_empty());
        assert!(periods.iter().any(|p| p.tag == RegimeTag::TrendingUp));
    }

    #[test]
    fn distribution_summary_sums_to_100_percent() {
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0 + i as f64 * 2.0)).collect();
        let config = RegimeDetectorConfig {
            regime_lookback: 20,
            trend_threshold: 0.1,
        };
        let periods = detect(&candles, &config);
        let (summary, total_days) = distribution_summary(&periods);
        assert!(total_days > 0.0);
        let sum: f64 = summary.values().sum();
        assert!((sum - 100.0).abs() < 1e-6);
    }
}
