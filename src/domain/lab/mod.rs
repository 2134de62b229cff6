//! Pure data types and algorithms for the backtest laboratory: the parts of the core
//! that do not own a collaborator or mutable shared state.

pub mod errors;
pub mod metrics;
pub mod monte_carlo;
pub mod parameter_space;
pub mod regime;
pub mod rng;
pub mod stats;
pub mod types;
