use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exchange::Exchange;
use super::order::Side;
use super::symbol::Symbol;

/// A live position as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue: Exchange,
    pub symbol: Symbol,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
}

/// Cost-basis record created when a position opens, destroyed when it closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEntry {
    pub symbol: Symbol,
    pub venue: Exchange,
    pub entry_cost: f64,
    pub position_value_usd: f64,
    pub opened_at: DateTime<Utc>,
}

/// Record appended to history when a position closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionExit {
    pub symbol: Symbol,
    pub venue: Exchange,
    pub exit_cost: f64,
    pub realized_pnl: f64,
    pub hours_held: f64,
    pub closed_at: DateTime<Utc>,
}

/// The key `entries`/`exits`/`currentPositions` are keyed by in the reference:
/// `symbol_venue`.
pub fn position_key(symbol: &Symbol, venue: Exchange) -> String {
    format!("{symbol}_{venue}")
}
