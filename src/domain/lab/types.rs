//! Core data model shared by every lab component (SPEC_FULL.md §3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Bar duration tag. Extends the reference codebase's six-variant enum with `M30`,
/// which SPEC_FULL.md §3 requires and the original did not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn bar_duration_ms(&self) -> i64 {
        self.to_minutes() * 60_000
    }

    pub fn all() -> [Timeframe; 7] {
        [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ]
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "M1" | "1M" => Ok(Timeframe::M1),
            "M5" | "5M" => Ok(Timeframe::M5),
            "M15" | "15M" => Ok(Timeframe::M15),
            "M30" | "30M" => Ok(Timeframe::M30),
            "H1" | "1H" => Ok(Timeframe::H1),
            "H4" | "4H" => Ok(Timeframe::H4),
            "D1" | "1D" => Ok(Timeframe::D1),
            other => Err(format!("invalid timeframe: '{other}'")),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        };
        write!(f, "{s}")
    }
}

/// One OHLCV bar. `ts` is a UTC millisecond instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// `low ≤ open, close ≤ high` and `low ≤ high`, per SPEC_FULL.md §3.
    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.low <= self.high
    }
}

/// Uniquely identifies a candle slice cached in C2.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub window_start: i64,
    pub window_end: i64,
}

/// Synthesized, never observed independently of C3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub ts: i64,
    pub spread_pips: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub volume_lots: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    EndOfData,
}

/// A position still open inside the replay (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPosition {
    pub id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub entry_ts: i64,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub commission: Decimal,
    pub peak_profit: Decimal,
    pub trough_loss: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Immutable record of a position after it closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub entry_price: Decimal,
    pub entry_ts: i64,
    pub volume: Decimal,
    pub exit_price: Decimal,
    pub exit_ts: i64,
    pub realized_pnl: Decimal,
    pub realized_pips: Decimal,
    pub exit_reason: ExitReason,
    pub holding_duration_ms: i64,
    pub max_drawdown: Decimal,
    pub max_runup: Decimal,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

/// Point-in-time snapshot of the account (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct AccountState {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    pub peak_equity: Decimal,
    pub current_drawdown: Decimal,
    pub open_position_count: usize,
    pub closed_trade_count: usize,
}

/// Which kind of value a parameter descriptor contributes to the enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    Number,
    Boolean,
    Enum,
}

/// A concrete scalar bound to a parameter name inside an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Number(Decimal),
    Boolean(bool),
    Enum(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(d) => write!(f, "{d}"),
            ParamValue::Boolean(b) => write!(f, "{b}"),
            ParamValue::Enum(s) => write!(f, "{s}"),
        }
    }
}

/// `(name, kind, category, default, min?, max?, step?, enum_values?, enabled, locked)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParameterKind,
    pub category: String,
    pub default: ParamValue,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
    pub step: Option<Decimal>,
    pub enum_values: Option<Vec<String>>,
    pub enabled: bool,
    pub locked: bool,
}

impl ParameterDescriptor {
    pub fn number(name: &str, category: &str, default: Decimal) -> Self {
        Self {
            name: name.to_string(),
            kind: ParameterKind::Number,
            category: category.to_string(),
            default: ParamValue::Number(default),
            min: None,
            max: None,
            step: None,
            enum_values: None,
            enabled: false,
            locked: false,
        }
    }

    pub fn with_range(mut self, min: Decimal, max: Decimal, step: Decimal) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self.step = Some(step);
        self
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }
}

/// Map `name → scalar`, covering every descriptor exactly once.
pub type ParameterAssignment = BTreeMap<String, ParamValue>;

/// Immutable for the duration of one run (SPEC_FULL.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub symbol: String,
    pub strategy_tag: String,
    pub window_start: i64,
    pub window_end: i64,
    pub initial_balance: Decimal,
    pub leverage: Decimal,
    pub commission_per_lot: Decimal,
    pub slippage_pips: Decimal,
    pub spread_pips: Decimal,
    pub primary_tf: Timeframe,
    pub aux_tfs: Vec<Timeframe>,
    pub max_spread_pips: Decimal,
    pub max_positions: usize,
    pub risk_percent: Decimal,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Idle,
    Starting,
    Running,
    Completed,
    Aborted,
    Error,
}

/// `(run_id, config_hash, params_hash, dataset_hash, seed, ..., status, metrics?, ...)`.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub config_hash: u64,
    pub params_hash: u64,
    pub dataset_hash: u64,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub metrics: Option<crate::domain::lab::metrics::Metrics>,
    pub trades: Vec<ClosedTrade>,
    pub equity_curve: Vec<(i64, Decimal)>,
    pub drawdown_curve: Vec<(i64, Decimal)>,
    pub error_kind: Option<&'static str>,
}

/// Per-symbol fixed constants used by the replay adapter's pricing model.
///
/// Open question 1 (SPEC_FULL.md §9): `pip_value_per_lot` is kept as a flat `$10/lot`
/// regardless of symbol, matching the reference semantics this laboratory was distilled
/// from. Isolated here as the single place a symbol-aware model would replace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolSpec {
    pub pip_size: Decimal,
    pub pip_value_per_lot: Decimal,
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    pub step_volume: Decimal,
}

impl SymbolSpec {
    pub fn for_symbol(symbol: &str) -> Self {
        use rust_decimal_macros::dec;
        let pip_size = if symbol.to_uppercase().ends_with("JPY") || symbol == "XAUUSD" {
            dec!(0.01)
        } else {
            dec!(0.0001)
        };
        Self {
            pip_size,
            pip_value_per_lot: dec!(10.0),
            min_volume: dec!(0.01),
            max_volume: dec!(100.0),
            step_volume: dec!(0.01),
        }
    }
}
