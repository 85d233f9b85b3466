//! Venue-facing seams the rest of the core programs against (§6). Real
//! venues implement these against exchange REST/WS APIs; tests and the demo
//! binary use [`mock::MockExchangeAdapter`] / [`mock::MockHistoricalService`].

pub mod mock;

use async_trait::async_trait;

use crate::error::KeeperError;
use crate::evaluator::{HistoricalMetrics, HistoricalRatePoint, SpreadVolatilityMetrics};
use crate::model::{Exchange, OrderRequest, OrderStatusReport, Position, Side, Symbol};

/// One venue's trading surface: prices, positions, and order lifecycle.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Exchange;

    /// Current mark price for `symbol`. Callers fall back to a previously
    /// known price if this errors (§4.7 step 1).
    async fn mark_price(&self, symbol: &Symbol) -> Result<f64, KeeperError>;

    /// Venue-reported position size (unsigned) held in `side`'s direction.
    async fn position_size(&self, symbol: &Symbol, side: Side) -> Result<f64, KeeperError>;

    /// All open positions this venue currently reports.
    async fn get_positions(&self) -> Result<Vec<Position>, KeeperError>;

    /// Account equity, in the venue's quote currency.
    async fn get_equity(&self) -> Result<f64, KeeperError>;

    async fn place_order(&self, request: OrderRequest) -> Result<String, KeeperError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, KeeperError>;

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<(), KeeperError>;
}

/// Supplies the historical rate statistics the Opportunity Evaluator scores
/// candidates against (§4.6).
#[async_trait]
pub trait HistoricalFundingService: Send + Sync {
    async fn historical_metrics(
        &self,
        symbol: &Symbol,
        long: Exchange,
        short: Exchange,
    ) -> Result<HistoricalMetrics, KeeperError>;

    /// Raw funding-rate observations backing `historical_metrics`.
    async fn get_historical_data(
        &self,
        symbol: &Symbol,
        venue: Exchange,
    ) -> Result<Vec<HistoricalRatePoint>, KeeperError>;

    /// Average spread between a long and short leg across their recent
    /// history, folding in each leg's current live rate.
    #[allow(clippy::too_many_arguments)]
    async fn get_average_spread(
        &self,
        long_symbol: &Symbol,
        long_venue: Exchange,
        short_symbol: &Symbol,
        short_venue: Exchange,
        current_long_rate: f64,
        current_short_rate: f64,
    ) -> Result<f64, KeeperError>;

    /// Spread volatility between a long and short leg, or `None` when there
    /// isn't enough history to compute it.
    async fn get_spread_volatility_metrics(
        &self,
        long_symbol: &Symbol,
        long_venue: Exchange,
        short_symbol: &Symbol,
        short_venue: Exchange,
    ) -> Result<Option<SpreadVolatilityMetrics>, KeeperError>;
}
