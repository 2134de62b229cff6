//! Strategy Evaluator (C4): trait contract plus the shipped reference strategy.

use crate::domain::lab::types::{
    Candle, OrderSide, ParamValue, ParameterAssignment, ParameterDescriptor, Tick, Timeframe,
};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    None,
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub action: SignalAction,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl Signal {
    pub fn none() -> Self {
        Self {
            action: SignalAction::None,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::None
    }
}

/// Synchronized, read-only views of every configured timeframe, aligned to the current
/// simulated tick. The evaluator must not see beyond the aligned bar of any timeframe.
pub struct MtfView<'a> {
    pub primary_tf: Timeframe,
    pub slices: HashMap<Timeframe, &'a [Candle]>,
}

impl<'a> MtfView<'a> {
    pub fn primary(&self) -> &'a [Candle] {
        self.slices.get(&self.primary_tf).copied().unwrap_or(&[])
    }

    pub fn aux(&self, tf: Timeframe) -> &'a [Candle] {
        self.slices.get(&tf).copied().unwrap_or(&[])
    }
}

/// `(multi_timeframe_views, current_tick, parameters) → Signal` (SPEC_FULL.md §4.4).
pub trait Strategy: Send {
    /// Called at most once per primary bar (throttled by the runner).
    fn analyze(&mut self, mtf: &MtfView, tick: &Tick, params: &ParameterAssignment) -> Signal;

    fn compute_sltp(
        &self,
        entry_price: Decimal,
        side: OrderSide,
        params: &ParameterAssignment,
    ) -> (Option<Decimal>, Option<Decimal>);

    /// Only legal before the first `analyze` call of a run.
    fn update_parameters(&mut self, assignment: &ParameterAssignment);

    fn parameter_descriptors(&self) -> Vec<ParameterDescriptor>;
}

fn number_param(params: &ParameterAssignment, name: &str, default: Decimal) -> Decimal {
    match params.get(name) {
        Some(ParamValue::Number(v)) => *v,
        _ => default,
    }
}

/// Donchian-channel breakout confirmed by an RSI momentum filter. Chosen as the shipped
/// reference strategy because it exercises every part of the trait — parameterized
/// breakout detection, an RSI indicator cached across bars, and symmetric `compute_sltp`
/// — with a small, auditable rule set.
pub struct DonchianRsiStrategy {
    pip_size: Decimal,
    donchian_period: usize,
    rsi_period: usize,
    rsi_buy_threshold: Decimal,
    rsi_sell_threshold: Decimal,
    sl_pips: Decimal,
    tp_pips: Decimal,
    last_seen_ts: Option<i64>,
    cached_signal: Signal,
}

impl DonchianRsiStrategy {
    pub fn new(pip_size: Decimal) -> Self {
        use rust_decimal_macros::dec;
        Self {
            pip_size,
            donchian_period: 20,
            rsi_period: 14,
            rsi_buy_threshold: dec!(55),
            rsi_sell_threshold: dec!(45),
            sl_pips: dec!(10),
            tp_pips: dec!(20),
            last_seen_ts: None,
            cached_signal: Signal::none(),
        }
    }

    fn rsi(candles: &[Candle], period: usize) -> Option<Decimal> {
        if candles.len() < period + 1 {
            return None;
        }
        let window = &candles[candles.len() - period - 1..];
        let mut gain_sum = Decimal::ZERO;
        let mut loss_sum = Decimal::ZERO;
        for pair in window.windows(2) {
            let delta = pair[1].close - pair[0].close;
            if delta > Decimal::ZERO {
                gain_sum += delta;
            } else {
                loss_sum += -delta;
            }
        }
        let avg_gain = gain_sum / Decimal::from(period);
        let avg_loss = loss_sum / Decimal::from(period);
        if avg_loss == Decimal::ZERO {
            return Some(Decimal::from(100));
        }
        let rs = avg_gain / avg_loss;
        Some(Decimal::from(100) - (Decimal::from(100) / (Decimal::ONE + rs)))
    }

    fn donchian_breakout(candles: &[Candle], period: usize) -> Option<(Decimal, Decimal)> {
        if candles.len() < period + 1 {
            return None;
        }
        let prior = &candles[candles.len() - period - 1..candles.len() - 1];
        let highest = prior.iter().map(|c| c.high).fold(Decimal::MIN, Decimal::max);
        let lowest = prior.iter().map(|c| c.low).fold(Decimal::MAX, Decimal::min);
        Some((highest, lowest))
    }
}

impl Strategy for DonchianRsiStrategy {
    fn analyze(&mut self, mtf: &MtfView, tick: &Tick, params: &ParameterAssignment) -> Signal {
        let donchian_period = number_param(
            params,
            "donchian_period",
            Decimal::from(self.donchian_period),
        )
        .to_usize()
        .unwrap_or(self.donchian_period);
        let rsi_period =
            number_param(params, "rsi_period", Decimal::from(self.rsi_period))
                .to_usize()
                .unwrap_or(self.rsi_period);
        let rsi_buy = number_param(params, "rsi_buy_threshold", self.rsi_buy_threshold);
        let rsi_sell = number_param(params, "rsi_sell_threshold", self.rsi_sell_threshold);

        let primary = mtf.primary();
        if let Some(last) = self.last_seen_ts {
            if primary.last().map(|c| c.ts) == Some(last) {
                return self.cached_signal;
            }
        }

        let signal = (|| {
            let (highest, lowest) = Self::donchian_breakout(primary, donchian_period)?;
            let rsi = Self::rsi(primary, rsi_period)?;
            let close = primary.last()?.close;

            if close > highest && rsi >= rsi_buy {
                let (sl, tp) = self.compute_sltp(tick.ask, OrderSide::Buy, params);
                return Some(Signal {
                    action: SignalAction::Buy,
                    stop_loss: sl,
                    take_profit: tp,
                });
            }
            if close < lowest && rsi <= rsi_sell {
                let (sl, tp) = self.compute_sltp(tick.bid, OrderSide::Sell, params);
                return Some(Signal {
                    action: SignalAction::Sell,
                    stop_loss: sl,
                    take_profit: tp,
                });
            }
            None
        })()
        .unwrap_or_else(Signal::none);

        self.last_seen_ts = primary.last().map(|c| c.ts);
        self.cached_signal = signal;
        signal
    }

    fn compute_sltp(
        &self,
        entry_price: Decimal,
        side: OrderSide,
        params: &ParameterAssignment,
    ) -> (Option<Decimal>, Option<Decimal>) {
        let sl_pips = number_param(params, "sl_pips", self.sl_pips);
        let tp_pips = number_param(params, "tp_pips", self.tp_pips);
        match side {
            OrderSide::Buy => (
                Some(entry_price - sl_pips * self.pip_size),
                Some(entry_price + tp_pips * self.pip_size),
            ),
            OrderSide::Sell => (
                Some(entry_price + sl_pips * self.pip_size),
                Some(entry_price - tp_pips * self.pip_size),
            ),
        }
    }

    fn update_parameters(&mut self, assignment: &ParameterAssignment) {
        if let Some(ParamValue::Number(v)) = assignment.get("donchian_period") {
            self.donchian_period = v.to_usize().unwrap_or(self.donchian_period);
        }
        if let Some(ParamValue::Number(v)) = assignment.get("rsi_period") {
            self.rsi_period = v.to_usize().unwrap_or(self.rsi_period);
        }
        if let Some(ParamValue::Number(v)) = assignment.get("rsi_buy_threshold") {
            self.rsi_buy_threshold = *v;
        }
        if let Some(ParamValue::Number(v)) = assignment.get("rsi_sell_threshold") {
            self.rsi_sell_threshold = *v;
        }
        if let Some(ParamValue::Number(v)) = assignment.get("sl_pips") {
            self.sl_pips = *v;
        }
        if let Some(ParamValue::Number(v)) = assignment.get("tp_pips") {
            self.tp_pips = *v;
        }
    }

    fn parameter_descriptors(&self) -> Vec<ParameterDescriptor> {
        vec![
            ParameterDescriptor::number(
                "donchian_period",
                "structure",
                Decimal::from(self.donchian_period),
            ),
            ParameterDescriptor::number("rsi_period", "momentum", Decimal::from(self.rsi_period)),
            ParameterDescriptor::number("rsi_buy_threshold", "momentum", self.rsi_buy_threshold),
            ParameterDescriptor::number("rsi_sell_threshold", "momentum", self.rsi_sell_threshold),
            ParameterDescriptor::number("sl_pips", "risk", self.sl_pips),
            ParameterDescriptor::number("tp_pips", "risk", self.tp_pips),
        ]
    }
}

/// Always returns `NONE`. Used by conformance fixtures (e.g. S1) and anywhere a neutral
/// evaluator is needed.
pub struct NoSignalStrategy;

impl Strategy for NoSignalStrategy {
    fn analyze(&mut self, _mtf: &MtfView, _tick: &Tick, _params: &ParameterAssignment) -> Signal {
        Signal::none()
    }

    fn compute_sltp(
        &self,
        _entry_price: Decimal,
        _side: OrderSide,
        _params: &ParameterAssignment,
    ) -> (Option<Decimal>, Option<Decimal>) {
        (None, None)
    }

    fn update_parameters(&mut self, _assignment: &ParameterAssignment) {}

    fn parameter_descriptors(&self) -> Vec<ParameterDescriptor> {
        vec![]
    }
}
