//! In-memory, fully scriptable venue and historical-data adapters used by the
//! test suite and the demo binary, grounded on the teacher's
//! `venues/perps/simulator.rs` and `tests/test_perf_and_valuer.rs`'s
//! `MockPerpVenue`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{KeeperError, VenueErrorKind};
use crate::evaluator::{HistoricalMetrics, HistoricalRatePoint, SpreadVolatilityMetrics};
use crate::model::{Exchange, OrderRequest, OrderStatus, OrderStatusReport, Position, Side, Symbol};

use super::{ExchangeAdapter, HistoricalFundingService};

#[derive(Debug, Clone)]
struct MockOrder {
    #[allow(dead_code)]
    request: OrderRequest,
    status: OrderStatus,
}

enum PlaceOutcome {
    Ok(String),
    Err(KeeperError),
}

#[derive(Default)]
struct Inner {
    marks: HashMap<String, f64>,
    positions: HashMap<(String, Side), f64>,
    position_list: Vec<Position>,
    equity: f64,
    orders: HashMap<String, MockOrder>,
    next_order_ids: VecDeque<String>,
    place_order_outcomes: VecDeque<PlaceOutcome>,
    status_sequences: HashMap<String, VecDeque<OrderStatusReport>>,
    status_errors: HashMap<String, VecDeque<KeeperError>>,
    next_auto_id: u64,
}

/// A fully scriptable in-memory venue. Every externally observable behaviour
/// (mark price, position, order placement outcome, status sequence) is set
/// explicitly by the test before exercising the engine against it.
pub struct MockExchangeAdapter {
    venue: Exchange,
    inner: Mutex<Inner>,
}

impl MockExchangeAdapter {
    pub fn new(venue: Exchange) -> Self {
        MockExchangeAdapter {
            venue,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn set_mark(&self, symbol: &Symbol, price: f64) {
        self.inner
            .lock()
            .await
            .marks
            .insert(symbol.as_str().to_string(), price);
    }

    pub async fn set_position(&self, symbol: &Symbol, side: Side, size: f64) {
        self.inner
            .lock()
            .await
            .positions
            .insert((symbol.as_str().to_string(), side), size);
    }

    /// Scripts the venue-reported full position list returned by
    /// `get_positions` (independent of `set_position`'s per-side ledger).
    pub async fn set_positions(&self, positions: Vec<Position>) {
        self.inner.lock().await.position_list = positions;
    }

    /// Scripts the account equity returned by `get_equity`.
    pub async fn set_equity(&self, equity: f64) {
        self.inner.lock().await.equity = equity;
    }

    /// The next call to `place_order` returns this id instead of an
    /// auto-generated one, letting tests script `order_status` in advance.
    pub async fn queue_next_order_id(&self, id: impl Into<String>) {
        self.inner.lock().await.next_order_ids.push_back(id.into());
    }

    /// The next call to `place_order` fails with `err` instead of succeeding.
    pub async fn queue_place_error(&self, err: KeeperError) {
        self.inner
            .lock()
            .await
            .place_order_outcomes
            .push_back(PlaceOutcome::Err(err));
    }

    /// Scripts the sequence of responses `order_status(order_id)` returns;
    /// the last entry repeats once the sequence is exhausted.
    pub async fn queue_status_sequence(
        &self,
        order_id: impl Into<String>,
        statuses: Vec<OrderStatusReport>,
    ) {
        self.inner
            .lock()
            .await
            .status_sequences
            .insert(order_id.into(), statuses.into());
    }

    /// Scripts `order_status(order_id)` to error on its next N calls (used to
    /// exercise the position-check fallback, fill rule (d)).
    pub async fn queue_status_errors(&self, order_id: impl Into<String>, errors: Vec<KeeperError>) {
        self.inner
            .lock()
            .await
            .status_errors
            .insert(order_id.into(), errors.into());
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchangeAdapter {
    fn venue(&self) -> Exchange {
        self.venue
    }

    async fn mark_price(&self, symbol: &Symbol) -> Result<f64, KeeperError> {
        let inner = self.inner.lock().await;
        inner.marks.get(symbol.as_str()).copied().ok_or_else(|| {
            KeeperError::venue(
                self.venue.to_string(),
                VenueErrorKind::Rejected(format!("no mark price set for {symbol}")),
            )
        })
    }

    async fn position_size(&self, symbol: &Symbol, side: Side) -> Result<f64, KeeperError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .positions
            .get(&(symbol.as_str().to_string(), side))
            .copied()
            .unwrap_or(0.0))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, KeeperError> {
        Ok(self.inner.lock().await.position_list.clone())
    }

    async fn get_equity(&self) -> Result<f64, KeeperError> {
        Ok(self.inner.lock().await.equity)
    }

    async fn place_order(&self, request: OrderRequest) -> Result<String, KeeperError> {
        let mut inner = self.inner.lock().await;
        if let Some(outcome) = inner.place_order_outcomes.pop_front() {
            match outcome {
                PlaceOutcome::Err(e) => return Err(e),
                PlaceOutcome::Ok(id) => {
                    inner.orders.insert(
                        id.clone(),
                        MockOrder {
                            request,
                            status: OrderStatus::Placed,
                        },
                    );
                    return Ok(id);
                }
            }
        }
        let id = inner.next_order_ids.pop_front().unwrap_or_else(|| {
            let n = inner.next_auto_id;
            inner.next_auto_id += 1;
            format!("mock-order-{n}")
        });
        inner.orders.insert(
            id.clone(),
            MockOrder {
                request,
                status: OrderStatus::Placed,
            },
        );
        Ok(id)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, KeeperError> {
        let mut inner = self.inner.lock().await;
        if let Some(errors) = inner.status_errors.get_mut(order_id) {
            if let Some(err) = errors.pop_front() {
                return Err(err);
            }
        }
        if let Some(seq) = inner.status_sequences.get_mut(order_id) {
            if seq.len() > 1 {
                return Ok(seq.pop_front().unwrap());
            }
            if let Some(last) = seq.front() {
                return Ok(last.clone());
            }
        }
        inner
            .orders
            .get(order_id)
            .map(|o| OrderStatusReport {
                status: o.status,
                filled_size: None,
                avg_fill_price: None,
            })
            .ok_or_else(|| {
                KeeperError::venue(
                    self.venue.to_string(),
                    VenueErrorKind::Rejected(format!("unknown order {order_id}")),
                )
            })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<(), KeeperError> {
        let mut inner = self.inner.lock().await;
        if let Some(order) = inner.orders.get_mut(order_id) {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }
}

/// Scriptable historical-metrics source, one entry per `(symbol, long, short)`.
#[derive(Default)]
pub struct MockHistoricalService {
    metrics: Mutex<HashMap<(String, Exchange, Exchange), HistoricalMetrics>>,
    rate_history: Mutex<HashMap<(String, Exchange), Vec<HistoricalRatePoint>>>,
    average_spread: Mutex<HashMap<(String, Exchange, String, Exchange), f64>>,
    spread_volatility: Mutex<HashMap<(String, Exchange, String, Exchange), SpreadVolatilityMetrics>>,
}

impl MockHistoricalService {
    pub fn new() -> Self {
        MockHistoricalService::default()
    }

    pub async fn set_metrics(
        &self,
        symbol: &Symbol,
        long: Exchange,
        short: Exchange,
        metrics: HistoricalMetrics,
    ) {
        self.metrics
            .lock()
            .await
            .insert((symbol.as_str().to_string(), long, short), metrics);
    }

    /// Scripts the raw rate history returned by `get_historical_data`.
    pub async fn set_historical_data(
        &self,
        symbol: &Symbol,
        venue: Exchange,
        points: Vec<HistoricalRatePoint>,
    ) {
        self.rate_history
            .lock()
            .await
            .insert((symbol.as_str().to_string(), venue), points);
    }

    /// Scripts the value returned by `get_average_spread` for a given leg
    /// pair, overriding the default (the absolute spread of the live rates
    /// passed to the call).
    pub async fn set_average_spread(
        &self,
        long_symbol: &Symbol,
        long_venue: Exchange,
        short_symbol: &Symbol,
        short_venue: Exchange,
        spread: f64,
    ) {
        self.average_spread.lock().await.insert(
            (
                long_symbol.as_str().to_string(),
                long_venue,
                short_symbol.as_str().to_string(),
                short_venue,
            ),
            spread,
        );
    }

    /// Scripts the value returned by `get_spread_volatility_metrics`; absent
    /// entries resolve to `None`.
    pub async fn set_spread_volatility(
        &self,
        long_symbol: &Symbol,
        long_venue: Exchange,
        short_symbol: &Symbol,
        short_venue: Exchange,
        metrics: SpreadVolatilityMetrics,
    ) {
        self.spread_volatility.lock().await.insert(
            (
                long_symbol.as_str().to_string(),
                long_venue,
                short_symbol.as_str().to_string(),
                short_venue,
            ),
            metrics,
        );
    }
}

#[async_trait]
impl HistoricalFundingService for MockHistoricalService {
    async fn historical_metrics(
        &self,
        symbol: &Symbol,
        long: Exchange,
        short: Exchange,
    ) -> Result<HistoricalMetrics, KeeperError> {
        self.metrics
            .lock()
            .await
            .get(&(symbol.as_str().to_string(), long, short))
            .copied()
            .ok_or_else(|| {
                KeeperError::Validation(format!("no historical metrics set for {symbol}"))
            })
    }

    async fn get_historical_data(
        &self,
        symbol: &Symbol,
        venue: Exchange,
    ) -> Result<Vec<HistoricalRatePoint>, KeeperError> {
        Ok(self
            .rate_history
            .lock()
            .await
            .get(&(symbol.as_str().to_string(), venue))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_average_spread(
        &self,
        long_symbol: &Symbol,
        long_venue: Exchange,
        short_symbol: &Symbol,
        short_venue: Exchange,
        current_long_rate: f64,
        current_short_rate: f64,
    ) -> Result<f64, KeeperError> {
        let key = (
            long_symbol.as_str().to_string(),
            long_venue,
            short_symbol.as_str().to_string(),
            short_venue,
        );
        Ok(self
            .average_spread
            .lock()
            .await
            .get(&key)
            .copied()
            .unwrap_or_else(|| (current_long_rate - current_short_rate).abs()))
    }

    async fn get_spread_volatility_metrics(
        &self,
        long_symbol: &Symbol,
        long_venue: Exchange,
        short_symbol: &Symbol,
        short_venue: Exchange,
    ) -> Result<Option<SpreadVolatilityMetrics>, KeeperError> {
        let key = (
            long_symbol.as_str().to_string(),
            long_venue,
            short_symbol.as_str().to_string(),
            short_venue,
        );
        Ok(self.spread_volatility.lock().await.get(&key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_reports_mark_price() {
        let adapter = MockExchangeAdapter::new(Exchange::Alpha);
        let symbol = Symbol::normalize("BTC-PERP");
        adapter.set_mark(&symbol, 65_000.0).await;
        assert_eq!(adapter.mark_price(&symbol).await.unwrap(), 65_000.0);
    }

    #[tokio::test]
    async fn scripted_place_error_is_returned_once() {
        let adapter = MockExchangeAdapter::new(Exchange::Alpha);
        adapter
            .queue_place_error(KeeperError::venue(
                "alpha",
                VenueErrorKind::Rejected("insufficient margin".into()),
            ))
            .await;
        let symbol = Symbol::normalize("BTC-PERP");
        let req = OrderRequest::limit(symbol.clone(), Side::Long, 1.0, 100.0);
        assert!(adapter.place_order(req.clone()).await.is_err());
        assert!(adapter.place_order(req).await.is_ok());
    }

    #[tokio::test]
    async fn status_sequence_repeats_last_entry() {
        let adapter = MockExchangeAdapter::new(Exchange::Alpha);
        adapter.queue_next_order_id("o1").await;
        adapter
            .queue_status_sequence(
                "o1",
                vec![
                    OrderStatusReport {
                        status: OrderStatus::Placed,
                        filled_size: None,
                        avg_fill_price: None,
                    },
                    OrderStatusReport {
                        status: OrderStatus::Filled,
                        filled_size: Some(1.0),
                        avg_fill_price: Some(100.0),
                    },
                ],
            )
            .await;
        let symbol = Symbol::normalize("BTC-PERP");
        let req = OrderRequest::limit(symbol, Side::Long, 1.0, 100.0);
        let id = adapter.place_order(req).await.unwrap();
        assert_eq!(id, "o1");
        assert_eq!(adapter.order_status("o1").await.unwrap().status, OrderStatus::Placed);
        assert_eq!(adapter.order_status("o1").await.unwrap().status, OrderStatus::Filled);
        assert_eq!(adapter.order_status("o1").await.unwrap().status, OrderStatus::Filled);
    }
}
