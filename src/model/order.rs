use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::exchange::Exchange;
use super::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    GoodTilCancelled,
    ImmediateOrCancel,
    FillOrKill,
}

/// A request to place an order on a venue. `size` is always positive; `side`
/// carries direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub size: f64,
    pub limit_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn limit(symbol: Symbol, side: Side, size: f64, limit_price: f64) -> Self {
        OrderRequest {
            symbol,
            side,
            order_type: OrderType::Limit,
            size,
            limit_price: Some(limit_price),
            time_in_force: TimeInForce::ImmediateOrCancel,
            reduce_only: false,
        }
    }

    pub fn reduce_only_market(symbol: Symbol, side: Side, size: f64) -> Self {
        OrderRequest {
            symbol,
            side,
            order_type: OrderType::Market,
            size,
            limit_price: None,
            time_in_force: TimeInForce::ImmediateOrCancel,
            reduce_only: true,
        }
    }
}

/// `placing -> placed -> waitingFill -> filled | failed | cancelled`.
/// `Filled`, `Failed`, `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Placing,
    Placed,
    WaitingFill,
    PartiallyFilled,
    Filled,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }
}

/// Exchange-reported status of a previously placed order.
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub filled_size: Option<f64>,
    pub avg_fill_price: Option<f64>,
}

/// The key under which the registry tracks in-flight orders: at most one
/// non-terminal order per `(venue, normalized symbol, side)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub venue: Exchange,
    pub symbol: Symbol,
    pub side: Side,
}

impl OrderKey {
    pub fn new(venue: Exchange, symbol: Symbol, side: Side) -> Self {
        OrderKey { venue, symbol, side }
    }
}

/// An order tracked by the Lock & Order Registry while it is non-terminal.
#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub order_id: String,
    pub symbol: Symbol,
    pub venue: Exchange,
    pub side: Side,
    /// The task/caller that placed this order — see §3's "thread id" clarification.
    pub owner: LockHolder,
    pub placed_at: Instant,
    pub status: OrderStatus,
    pub size: Option<f64>,
    pub price: Option<f64>,
    pub reduce_only: bool,
    /// The venue-reported position size just before placement, captured so fill
    /// detection never mistakes a pre-existing position for evidence of a fill.
    pub initial_position_size: Option<f64>,
}

impl ActiveOrder {
    pub fn key(&self) -> OrderKey {
        OrderKey::new(self.venue, self.symbol.clone(), self.side)
    }
}

/// Identifies the exclusive owner of a symbol or global lock.
///
/// The spec's "thread id" is realized as this opaque token: in single-process
/// async Rust there's no stable OS thread per logical execution, so callers
/// mint one explicitly (e.g. per execution attempt) rather than relying on
/// whichever tokio worker thread happens to poll the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHolder(pub u64);

impl LockHolder {
    pub fn new(id: u64) -> Self {
        LockHolder(id)
    }
}
