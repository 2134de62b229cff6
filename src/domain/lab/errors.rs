//! Structured error taxonomy with stable `LAB_*` codes (C7.1 in SPEC_FULL.md).

use std::collections::BTreeMap;
use thiserror::Error;

/// Every fallible core operation returns `Result<T, LabError>`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LabError {
    #[error("combination count {count} exceeds combination_limit {limit}")]
    TooManyCombinations { count: u64, limit: u64 },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("missing required configuration field: {field}")]
    ConfigMissingRequired { field: String },

    #[error("data not found for {symbol} {timeframe}")]
    DataNotFound { symbol: String, timeframe: String },

    #[error("invalid data format for {symbol}: {reason}")]
    DataInvalidFormat { symbol: String, reason: String },

    #[error("insufficient data for {symbol}: have {have} bars, need {need}")]
    DataInsufficient {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("execution failed for run {run_id}: {reason}")]
    ExecutionFailed { run_id: String, reason: String },

    #[error("execution timed out for run {run_id} after {elapsed_ms}ms")]
    ExecutionTimeout { run_id: String, elapsed_ms: u64 },

    #[error("run {run_id} aborted")]
    ExecutionAborted { run_id: String },

    #[error("post-run invariant violated: {reason}")]
    ValidationFailed { reason: String },

    #[error("isolation violation: {reason}")]
    IsolationViolation { reason: String },

    #[error("invalid metrics computation: {reason}")]
    MetricsInvalid { reason: String },

    #[error("internal error: {reason}")]
    InternalError { reason: String },

    #[error("risk limit breached for {symbol}: {reason}")]
    RiskLimit { symbol: String, reason: String },

    #[error("spread too high for {symbol}: {current_pips} > {max_pips}")]
    SpreadTooHigh {
        symbol: String,
        current_pips: f64,
        max_pips: f64,
    },

    #[error("no price available for {symbol}")]
    NoPrice { symbol: String },

    #[error("pipeline of kind {kind} already running as {run_id}")]
    Conflict { kind: String, run_id: String },
}

impl LabError {
    /// The stable identifier from SPEC_FULL.md §7, independent of the Rust type name.
    pub fn code(&self) -> &'static str {
        match self {
            LabError::TooManyCombinations { .. } => "LAB_TOO_MANY_COMBINATIONS",
            LabError::ConfigInvalid { .. } => "LAB_CONFIG_INVALID",
            LabError::ConfigMissingRequired { .. } => "LAB_CONFIG_MISSING_REQUIRED",
            LabError::DataNotFound { .. } => "LAB_DATA_NOT_FOUND",
            LabError::DataInvalidFormat { .. } => "LAB_DATA_INVALID_FORMAT",
            LabError::DataInsufficient { .. } => "LAB_DATA_INSUFFICIENT",
            LabError::ExecutionFailed { .. } => "LAB_EXECUTION_FAILED",
            LabError::ExecutionTimeout { .. } => "LAB_EXECUTION_TIMEOUT",
            LabError::ExecutionAborted { .. } => "LAB_EXECUTION_ABORTED",
            LabError::ValidationFailed { .. } => "LAB_VALIDATION_FAILED",
            LabError::IsolationViolation { .. } => "LAB_ISOLATION_VIOLATION",
            LabError::MetricsInvalid { .. } => "LAB_METRICS_INVALID",
            LabError::InternalError { .. } => "LAB_INTERNAL_ERROR",
            LabError::RiskLimit { .. } => "RISK_LIMIT",
            LabError::SpreadTooHigh { .. } => "SPREAD_TOO_HIGH",
            LabError::NoPrice { .. } => "NO_PRICE",
            LabError::Conflict { .. } => "CONFLICT",
        }
    }

    /// True for errors that abort an entire batch orchestration rather than being
    /// recorded against a single run (spec §4.8 failure policy).
    pub fn is_catastrophic(&self) -> bool {
        matches!(
            self,
            LabError::ConfigInvalid { .. }
                | LabError::ConfigMissingRequired { .. }
                | LabError::TooManyCombinations { .. }
                | LabError::DataNotFound { .. }
        )
    }
}

/// Façade-level error with an attached context map, per SPEC_FULL.md §7.1.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextualError {
    pub error: LabError,
    pub context: BTreeMap<String, String>,
}

impl ContextualError {
    pub fn new(error: LabError) -> Self {
        Self {
            error,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for ContextualError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error.code(), self.error)
    }
}

impl std::error::Error for ContextualError {}

pub type LabResult<T> = Result<T, LabError>;
