//! Metrics Engine (C6): closed-trade stream + equity curve → composite record.

use crate::domain::lab::types::ClosedTrade;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// The version of the composite-score formula below. Any re-tuning of the weights is a
/// breaking change to ranking outputs and must bump this (SPEC_FULL.md §9).
pub const SCORING_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub total: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub net_profit: Decimal,
    pub profit_factor: f64,
    pub win_rate: f64,
    pub max_drawdown: Decimal,
    pub max_drawdown_percent: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub avg_trade: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub avg_win_loss_ratio: f64,
    pub avg_holding_hours: f64,
    pub trading_days: f64,
    pub trades_per_day: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub expectancy: Decimal,
    pub recovery_factor: f64,
    pub composite_score: f64,
    pub scoring_version: u32,
}

impl Metrics {
    pub fn calculate(
        trades: &[ClosedTrade],
        equity_curve: &[(i64, Decimal)],
        initial_balance: Decimal,
    ) -> Self {
        let total = trades.len();
        if total == 0 {
            return Self::empty(equity_curve, initial_balance);
        }

        let wins_vec: Vec<&ClosedTrade> = trades.iter().filter(|t| t.is_win()).collect();
        let losses_vec: Vec<&ClosedTrade> = trades
            .iter()
            .filter(|t| t.realized_pnl <= Decimal::ZERO)
            .collect();
        let wins = wins_vec.len();
        let losses = losses_vec.len();

        let gross_profit: Decimal = wins_vec.iter().map(|t| t.realized_pnl).sum();
        let gross_loss: Decimal = losses_vec.iter().map(|t| -t.realized_pnl).sum();
        let net_profit: Decimal = trades.iter().map(|t| t.realized_pnl).sum();

        let profit_factor = if gross_loss == Decimal::ZERO {
            if gross_profit > Decimal::ZERO {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        };

        let win_rate = wins as f64 / total as f64 * 100.0;

        let (max_drawdown, max_drawdown_percent) = Self::max_drawdown(equity_curve);

        let (max_consecutive_wins, max_consecutive_losses) = Self::streaks(trades);

        let avg_win = if wins > 0 {
            gross_profit / Decimal::from(wins)
        } else {
            Decimal::ZERO
        };
        let avg_loss = if losses > 0 {
            gross_loss / Decimal::from(losses)
        } else {
            Decimal::ZERO
        };
        let avg_trade = net_profit / Decimal::from(total);
        let largest_win = wins_vec
            .iter()
            .map(|t| t.realized_pnl)
            .fold(Decimal::ZERO, Decimal::max);
        let largest_loss = losses_vec
            .iter()
            .map(|t| t.realized_pnl)
            .fold(Decimal::ZERO, Decimal::min);
        let avg_win_loss_ratio = if avg_loss != Decimal::ZERO {
            (avg_win / avg_loss).to_f64().unwrap_or(0.0).abs()
        } else if avg_win > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        let total_holding_ms: i64 = trades.iter().map(|t| t.holding_duration_ms).sum();
        let avg_holding_hours = (total_holding_ms as f64 / total as f64) / 3_600_000.0;

        let trading_days = if let (Some(first), Some(last)) =
            (trades.first(), trades.last())
        {
            ((last.exit_ts - first.entry_ts) as f64 / 86_400_000.0).max(1.0)
        } else {
            1.0
        };
        let trades_per_day = total as f64 / trading_days;

        let returns: Vec<f64> = trades
            .iter()
            .map(|t| (t.realized_pnl / initial_balance).to_f64().unwrap_or(0.0))
            .collect();
        let sharpe = Self::sharpe_ratio(&returns);
        let sortino = Self::sortino_ratio(&returns);

        let total_return_pct = (net_profit / initial_balance * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0);
        let calmar = if max_drawdown_percent > 0.0 {
            total_return_pct / max_drawdown_percent
        } else if total_return_pct > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let p_win = wins as f64 / total as f64;
        let p_loss = losses as f64 / total as f64;
        let expectancy =
            avg_win * Decimal::try_from(p_win).unwrap_or(Decimal::ZERO)
                - avg_loss * Decimal::try_from(p_loss).unwrap_or(Decimal::ZERO);

        let recovery_factor = if max_drawdown > Decimal::ZERO {
            (net_profit / max_drawdown).to_f64().unwrap_or(0.0)
        } else if net_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        let mut metrics = Self {
            total,
            wins,
            losses,
            gross_profit,
            gross_loss,
            net_profit,
            profit_factor,
            win_rate,
            max_drawdown,
            max_drawdown_percent,
            max_consecutive_wins,
            max_consecutive_losses,
            avg_win,
            avg_loss,
            avg_trade,
            largest_win,
            largest_loss,
            avg_win_loss_ratio,
            avg_holding_hours,
            trading_days,
            trades_per_day,
            sharpe,
            sortino,
            calmar,
            expectancy,
            recovery_factor,
            composite_score: 0.0,
            scoring_version: SCORING_VERSION,
        };
        metrics.composite_score = metrics.composite_score(total_return_pct);
        metrics
    }

    fn empty(equity_curve: &[(i64, Decimal)], _initial_balance: Decimal) -> Self {
        let (max_drawdown, max_drawdown_percent) = Self::max_drawdown(equity_curve);
        let mut metrics = Self {
            total: 0,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            net_profit: Decimal::ZERO,
            profit_factor: 0.0,
            win_rate: 0.0,
            max_drawdown,
            max_drawdown_percent,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
            avg_win: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            avg_trade: Decimal::ZERO,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
            avg_win_loss_ratio: 0.0,
            avg_holding_hours: 0.0,
            trading_days: 0.0,
            trades_per_day: 0.0,
            sharpe: 0.0,
            sortino: 0.0,
            calmar: 0.0,
            expectancy: Decimal::ZERO,
            recovery_factor: 0.0,
            composite_score: 0.0,
            scoring_version: SCORING_VERSION,
        };
        metrics.composite_score = metrics.composite_score(0.0);
        metrics
    }

    /// `0.4·normalized_profit + 0.2·clamp(pf,0,5)·20 + 0.15·win_rate
    ///  + 0.15·(clamp(sharpe,-2,3)·20 + 40) + 0.10·max(0, 100 - 2·max_drawdown_percent)`.
    fn composite_score(&self, total_return_pct: f64) -> f64 {
        let normalized_profit = total_return_pct.clamp(-100.0, 100.0);
        let pf_term = clamp_finite(self.profit_factor, 0.0, 5.0) * 20.0;
        let sharpe_term = clamp_finite(self.sharpe, -2.0, 3.0) * 20.0 + 40.0;
        let dd_term = (100.0 - 2.0 * self.max_drawdown_percent).max(0.0);

        0.4 * normalized_profit
            + 0.2 * pf_term
            + 0.15 * self.win_rate
            + 0.15 * sharpe_term
            + 0.10 * dd_term
    }

    fn max_drawdown(equity_curve: &[(i64, Decimal)]) -> (Decimal, f64) {
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0_f64;
        for (_, equity) in equity_curve {
            if *equity > peak {
                peak = *equity;
            }
            let dd = peak - *equity;
            if dd > max_dd {
                max_dd = dd;
                max_dd_pct = if peak > Decimal::ZERO {
                    (dd / peak * Decimal::from(100)).to_f64().unwrap_or(0.0)
                } else {
                    0.0
                };
            }
        }
        (max_dd, max_dd_pct)
    }

    fn streaks(trades: &[ClosedTrade]) -> (usize, usize) {
        let mut max_wins = 0usize;
        let mut max_losses = 0usize;
        let mut cur_wins = 0usize;
        let mut cur_losses = 0usize;
        for t in trades {
            if t.is_win() {
                cur_wins += 1;
                cur_losses = 0;
            } else {
                cur_losses += 1;
                cur_wins = 0;
            }
            max_wins = max_wins.max(cur_wins);
            max_losses = max_losses.max(cur_losses);
        }
        (max_wins, max_losses)
    }

    /// Annualized by `√252`, per SPEC_FULL.md §4.6.
    fn sharpe_ratio(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return 0.0;
        }
        (mean / std_dev) * 252.0_f64.sqrt()
    }

    fn sortino_ratio(returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        if downside.is_empty() {
            return if mean > 0.0 { f64::INFINITY } else { 0.0 };
        }
        let downside_variance =
            downside.iter().map(|r| r.powi(2)).sum::<f64>() / downside.len() as f64;
        let downside_dev = downside_variance.sqrt();
        if downside_dev == 0.0 {
            return 0.0;
        }
        (mean / downside_dev) * 252.0_f64.sqrt()
    }
}

fn clamp_finite(value: f64, min: f64, max: f64) -> f64 {
    if value.is_infinite() {
        if value.is_sign_positive() { max } else { min }
    } else {
        value.clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lab::types::{ExitReason, OrderSide};
    use rust_decimal_macros::dec;

    fn trade(pnl: Decimal, entry_ts: i64, exit_ts: i64) -> ClosedTrade {
        ClosedTrade {
            id: 1,
            symbol: "XAUUSD".into(),
            side: OrderSide::Buy,
            entry_price: dec!(1900),
            entry_ts,
            volume: dec!(1.0),
            exit_price: dec!(1900) + pnl,
            exit_ts,
            realized_pnl: pnl,
            realized_pips: pnl,
            exit_reason: ExitReason::TakeProfit,
            holding_duration_ms: exit_ts - entry_ts,
            max_drawdown: Decimal::ZERO,
            max_runup: Decimal::ZERO,
        }
    }

    #[test]
    fn no_trades_yields_zeroed_metrics_and_score_16() {
        let metrics = Metrics::calculate(&[], &[], dec!(10000));
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.net_profit, Decimal::ZERO);
        assert_eq!(metrics.max_drawdown_percent, 0.0);
        // 0.4*0 + 0.2*0 + 0.15*0 + 0.15*40 + 0.10*100 = 16.0
        assert!((metrics.composite_score - 16.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_is_infinite_with_no_losses() {
        let trades = vec![trade(dec!(100), 0, 1000), trade(dec!(50), 1000, 2000)];
        let metrics = Metrics::calculate(&trades, &[], dec!(10000));
        assert_eq!(metrics.profit_factor, f64::INFINITY);
        assert_eq!(metrics.win_rate, 100.0);
    }

    #[test]
    fn streak_counting() {
        let trades = vec![
            trade(dec!(10), 0, 1000),
            trade(dec!(10), 1000, 2000),
            trade(dec!(-5), 2000, 3000),
            trade(dec!(10), 3000, 4000),
        ];
        let (wins, losses) = Metrics::streaks(&trades);
        assert_eq!(wins, 2);
        assert_eq!(losses, 1);
    }

    #[test]
    fn max_drawdown_tracks_peak_to_trough() {
        let curve = vec![
            (0, dec!(10000)),
            (1, dec!(11000)),
            (2, dec!(9000)),
            (3, dec!(9500)),
        ];
        let (dd, pct) = Metrics::max_drawdown(&curve);
        assert_eq!(dd, dec!(2000));
        assert!((pct - (2000.0 / 11000.0 * 100.0)).abs() < 1e-6);
    }
}
