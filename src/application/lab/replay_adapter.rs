//! Replay Adapter (C3): per-symbol multi-timeframe time cursor with simulated execution.

use crate::domain::lab::errors::{LabError, LabResult};
use crate::domain::lab::types::{
    AccountState, Candle, ClosedTrade, ExitReason, OrderRequest, OrderSide, SimulatedPosition,
    SymbolSpec, Tick, Timeframe,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

pub type OrderId = u64;

/// Seam through which a multi-asset run's shared portfolio ledger vets every order this
/// adapter places, and is told when a position it reserved capacity for closes. `None`
/// when the adapter is running single-symbol (no portfolio-level limits apply).
pub trait RiskGate: Send + Sync {
    fn check_and_reserve(&self, symbol: &str, current_equity: Decimal) -> LabResult<()>;
    fn release(&self, symbol: &str);
}

struct TimeframeCursor {
    view: Arc<Vec<Candle>>,
    index: usize,
}

impl TimeframeCursor {
    fn aligned(&self) -> &Candle {
        &self.view[self.index]
    }

    fn history(&self, n: usize) -> Vec<Candle> {
        let end = self.index + 1;
        let start = end.saturating_sub(n);
        self.view[start..end].to_vec()
    }
}

/// Owns the time cursor for one symbol across its primary and auxiliary timeframes, plus
/// the simulated positions opened against it. One instance belongs to exactly one C5 run.
pub struct ReplayAdapter {
    symbol: String,
    symbol_spec: SymbolSpec,
    spread_pips: Decimal,
    slippage_pips: Decimal,
    commission_per_lot: Decimal,
    cursors: HashMap<Timeframe, TimeframeCursor>,
    primary_tf: Timeframe,
    simulated_ts: i64,
    positions: HashMap<OrderId, SimulatedPosition>,
    closed_trades: Vec<ClosedTrade>,
    next_order_id: OrderId,
    balance: Decimal,
    peak_equity: Decimal,
    risk_gate: Option<Arc<dyn RiskGate>>,
}

impl ReplayAdapter {
    pub fn load(
        symbol: &str,
        primary_tf: Timeframe,
        views: HashMap<Timeframe, Arc<Vec<Candle>>>,
        initial_balance: Decimal,
        spread_pips: Decimal,
        slippage_pips: Decimal,
        commission_per_lot: Decimal,
    ) -> LabResult<Self> {
        if !views.contains_key(&primary_tf) {
            return Err(LabError::DataNotFound {
                symbol: symbol.to_string(),
                timeframe: primary_tf.to_string(),
            });
        }
        let mut cursors = HashMap::new();
        for (tf, view) in views {
            if view.is_empty() {
                return Err(LabError::DataNotFound {
                    symbol: symbol.to_string(),
                    timeframe: tf.to_string(),
                });
            }
            cursors.insert(tf, TimeframeCursor { view, index: 0 });
        }
        let simulated_ts = cursors[&primary_tf].aligned().ts;
        Ok(Self {
            symbol: symbol.to_string(),
            symbol_spec: SymbolSpec::for_symbol(symbol),
            spread_pips,
            slippage_pips,
            commission_per_lot,
            cursors,
            primary_tf,
            simulated_ts,
            positions: HashMap::new(),
            closed_trades: Vec::new(),
            next_order_id: 1,
            balance: initial_balance,
            peak_equity: initial_balance,
            risk_gate: None,
        })
    }

    /// Wires a shared portfolio ledger into this adapter so every subsequent
    /// `place_order` is vetted against cross-symbol risk limits (multi-asset mode only).
    pub fn with_risk_gate(mut self, gate: Arc<dyn RiskGate>) -> Self {
        self.risk_gate = Some(gate);
        self
    }

    /// Advances the primary cursor by one bar and synchronizes every aux cursor so that,
    /// on return, each timeframe's cursor points at the bar whose interval contains
    /// `simulated_ts` and whose successor strictly exceeds it. Returns `false` at
    /// end-of-data.
    pub fn advance(&mut self) -> bool {
        let primary = self.cursors.get_mut(&self.primary_tf).unwrap();
        if primary.index + 1 >= primary.view.len() {
            return false;
        }
        primary.index += 1;
        self.simulated_ts = primary.aligned().ts;

        let simulated_ts = self.simulated_ts;
        for (tf, cursor) in self.cursors.iter_mut() {
            if *tf == self.primary_tf {
                continue;
            }
            while cursor.index + 1 < cursor.view.len()
                && cursor.view[cursor.index + 1].ts <= simulated_ts
            {
                cursor.index += 1;
            }
        }

        self.mark_to_market();
        self.check_sl_tp();
        true
    }

    pub fn candle_history(&self, tf: Timeframe, n: usize) -> Vec<Candle> {
        self.cursors.get(&tf).map(|c| c.history(n)).unwrap_or_default()
    }

    pub fn current_tick(&self) -> Tick {
        let close = self.cursors[&self.primary_tf].aligned().close;
        Tick {
            bid: close,
            ask: close + self.spread_pips * self.symbol_spec.pip_size,
            ts: self.simulated_ts,
            spread_pips: self.spread_pips,
        }
    }

    pub fn place_order(
        &mut self,
        request: OrderRequest,
        max_spread_pips: Option<Decimal>,
    ) -> LabResult<OrderId> {
        let tick = self.current_tick();
        if let Some(max) = max_spread_pips {
            if self.spread_pips > max {
                use rust_decimal::prelude::ToPrimitive;
                return Err(LabError::SpreadTooHigh {
                    symbol: self.symbol.clone(),
                    current_pips: self.spread_pips.to_f64().unwrap_or(0.0),
                    max_pips: max.to_f64().unwrap_or(0.0),
                });
            }
        }
        if let Some(gate) = &self.risk_gate {
            let equity = self.account_state().equity;
            gate.check_and_reserve(&self.symbol, equity)?;
        }
        let slippage = self.slippage_pips * self.symbol_spec.pip_size;
        let entry_price = match request.side {
            OrderSide::Buy => tick.ask + slippage,
            OrderSide::Sell => tick.bid - slippage,
        };
        let commission = self.commission_per_lot * request.volume_lots;
        let id = self.next_order_id;
        self.next_order_id += 1;
        self.positions.insert(
            id,
            SimulatedPosition {
                id,
                symbol: request.symbol,
                side: request.side,
                entry_price,
                entry_ts: self.simulated_ts,
                volume: request.volume_lots,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                commission,
                peak_profit: Decimal::ZERO,
                trough_loss: Decimal::ZERO,
                current_price: entry_price,
                unrealized_pnl: -commission,
            },
        );
        Ok(id)
    }

    pub fn modify_position(
        &mut self,
        id: OrderId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> LabResult<()> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or_else(|| LabError::ExecutionFailed {
                run_id: self.symbol.clone(),
                reason: format!("no open position {id}"),
            })?;
        if stop_loss.is_some() {
            position.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            position.take_profit = take_profit;
        }
        Ok(())
    }

    pub fn close_position(&mut self, id: OrderId) -> LabResult<ClosedTrade> {
        let position = self
            .positions
            .remove(&id)
            .ok_or_else(|| LabError::ExecutionFailed {
                run_id: self.symbol.clone(),
                reason: format!("no open position {id}"),
            })?;
        let tick = self.current_tick();
        let exit_price = match position.side {
            OrderSide::Buy => tick.bid,
            OrderSide::Sell => tick.ask,
        };
        Ok(self.finalize_close(position, exit_price, ExitReason::Manual))
    }

    pub fn close_all_end_of_data(&mut self) -> Vec<ClosedTrade> {
        let tick = self.current_tick();
        let ids: Vec<OrderId> = self.positions.keys().copied().collect();
        let mut closed = Vec::with_capacity(ids.len());
        for id in ids {
            let position = self.positions.remove(&id).unwrap();
            let exit_price = match position.side {
                OrderSide::Buy => tick.bid,
                OrderSide::Sell => tick.ask,
            };
            closed.push(self.finalize_close(position, exit_price, ExitReason::EndOfData));
        }
        closed
    }

    pub fn account_state(&self) -> AccountState {
        let unrealized: Decimal = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let equity = self.balance + unrealized;
        let current_drawdown = if self.peak_equity > Decimal::ZERO {
            (self.peak_equity - equity).max(Decimal::ZERO)
        } else {
            Decimal::ZERO
        };
        AccountState {
            balance: self.balance,
            equity,
            margin: Decimal::ZERO,
            free_margin: equity,
            peak_equity: self.peak_equity,
            current_drawdown,
            open_position_count: self.positions.len(),
            closed_trade_count: self.closed_trades.len(),
        }
    }

    pub fn open_position_count_for(&self, symbol: &str) -> usize {
        self.positions.values().filter(|p| p.symbol == symbol).count()
    }

    pub fn symbol_spec(&self) -> SymbolSpec {
        self.symbol_spec
    }

    pub fn simulated_ts(&self) -> i64 {
        self.simulated_ts
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    fn pnl(&self, side: OrderSide, entry_price: Decimal, price: Decimal, volume: Decimal) -> Decimal {
        let diff = match side {
            OrderSide::Buy => price - entry_price,
            OrderSide::Sell => entry_price - price,
        };
        (diff / self.symbol_spec.pip_size) * self.symbol_spec.pip_value_per_lot * volume
    }

    fn mark_to_market(&mut self) {
        let tick = self.current_tick();
        for position in self.positions.values_mut() {
            let price = match position.side {
                OrderSide::Buy => tick.bid,
                OrderSide::Sell => tick.ask,
            };
            position.current_price = price;
            let gross = match position.side {
                OrderSide::Buy => price - position.entry_price,
                OrderSide::Sell => position.entry_price - price,
            };
            let pip_pnl = (gross / self.symbol_spec.pip_size)
                * self.symbol_spec.pip_value_per_lot
                * position.volume;
            position.unrealized_pnl = pip_pnl - position.commission;
            position.peak_profit = position.peak_profit.max(position.unrealized_pnl);
            position.trough_loss = position.trough_loss.min(position.unrealized_pnl);
        }
        let unrealized: Decimal = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let equity = self.balance + unrealized;
        self.peak_equity = self.peak_equity.max(equity);
    }

    /// Checks the just-advanced primary bar against every open position's SL/TP.
    /// `STOP_LOSS` wins ties within the same bar (pessimistic assumption).
    fn check_sl_tp(&mut self) {
        let bar = self.cursors[&self.primary_tf].aligned().clone();
        let ids: Vec<OrderId> = self.positions.keys().copied().collect();
        for id in ids {
            let position = match self.positions.get(&id) {
                Some(p) => p.clone(),
                None => continue,
            };
            let hit = match position.side {
                OrderSide::Buy => {
                    if position.stop_loss.is_some_and(|sl| bar.low <= sl) {
                        Some((position.stop_loss.unwrap(), ExitReason::StopLoss))
                    } else if position.take_profit.is_some_and(|tp| bar.high >= tp) {
                        Some((position.take_profit.unwrap(), ExitReason::TakeProfit))
                    } else {
                        None
                    }
                }
                OrderSide::Sell => {
                    if position.stop_loss.is_some_and(|sl| bar.high >= sl) {
                        Some((position.stop_loss.unwrap(), ExitReason::StopLoss))
                    } else if position.take_profit.is_some_and(|tp| bar.low <= tp) {
                        Some((position.take_profit.unwrap(), ExitReason::TakeProfit))
                    } else {
                        None
                    }
                }
            };
            if let Some((price, reason)) = hit {
                let position = self.positions.remove(&id).unwrap();
                self.finalize_close(position, price, reason);
            }
        }
    }

    fn finalize_close(
        &mut self,
        position: SimulatedPosition,
        exit_price: Decimal,
        reason: ExitReason,
    ) -> ClosedTrade {
        let pip_pnl = self.pnl(position.side, position.entry_price, exit_price, position.volume);
        let realized_pnl = pip_pnl - position.commission;
        let realized_pips = match position.side {
            OrderSide::Buy => exit_price - position.entry_price,
            OrderSide::Sell => position.entry_price - exit_price,
        } / self.symbol_spec.pip_size;
        self.balance += realized_pnl;
        self.peak_equity = self.peak_equity.max(self.balance);
        if let Some(gate) = &self.risk_gate {
            gate.release(&position.symbol);
        }
        let trade = ClosedTrade {
            id: position.id,
            symbol: position.symbol,
            side: position.side,
            entry_price: position.entry_price,
            entry_ts: position.entry_ts,
            volume: position.volume,
            exit_price,
            exit_ts: self.simulated_ts,
            realized_pnl,
            realized_pips,
            exit_reason: reason,
            holding_duration_ms: self.simulated_ts - position.entry_ts,
            max_drawdown: -position.trough_loss.min(Decimal::ZERO),
            max_runup: position.peak_profit.max(Decimal::ZERO),
        };
        self.closed_trades.push(trade.clone());
        trade
    }
}
