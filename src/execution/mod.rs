//! Sliced Execution Engine (§4.7): splits a hedged order into N sequential
//! slices, fills the constrained leg first on each, and keeps the pair
//! delta-neutral with rollback on partial failure.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tokio::time::{Duration, Instant};

use crate::adapters::ExchangeAdapter;
use crate::config::KeeperConfig;
use crate::error::KeeperError;
use crate::events::{DomainEvent, EventBus, event_types};
use crate::model::{
    ActiveOrder, Exchange, LegResult, LockHolder, OrderKey, OrderRequest, OrderStatus,
    OrderStatusReport, Side, SliceResult, SlicedExecutionResult, Symbol, TimeToFundingInfo,
};
use crate::rate_limiter::{Priority, RateLimiter};
use crate::registry::{LockRegistry, OrderRegistry};
use crate::retry::RetryPolicy;

const BETWEEN_SLICE_SLEEP: Duration = Duration::from_millis(500);
const TIME_PRESSURE_THRESHOLD_SECS: u64 = 5 * 60;
const TIME_PRESSURE_TIMEOUT_CAP_MS: u64 = 15_000;
const SLICE_TIME_OVERHEAD_MS: u64 = 500;
const SYMBOL_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Portfolio/safety-bound slice count, ignoring any dynamic-slicing
/// adjustment (§4.7 "Slice-count determination").
pub fn safety_slice_count(
    requested_size: f64,
    mark_price: f64,
    total_portfolio_usd: f64,
    config: &KeeperConfig,
) -> u32 {
    let position_value_usd = requested_size * mark_price;
    let max_slice_usd = (config.max_portfolio_pct_per_slice * total_portfolio_usd)
        .min(config.max_usd_per_slice)
        .max(f64::MIN_POSITIVE);
    let safety_min_slices = (position_value_usd / max_slice_usd).ceil().max(1.0) as u32;
    safety_min_slices.max(config.min_slices)
}

/// Result of the optional dynamic-slicing time-pressure calculation.
#[derive(Debug, Clone, Copy)]
pub struct DynamicSlicePlan {
    pub time_to_funding_secs: u64,
    pub max_slices_by_time: u32,
    pub effective_slice_fill_timeout_ms: u64,
}

fn seconds_since_midnight(now: DateTime<Utc>) -> u64 {
    now.num_seconds_from_midnight() as u64
}

fn seconds_to_next_offset(now_secs: u64, offsets: &[u64]) -> u64 {
    let day = 24 * 3600;
    offsets
        .iter()
        .map(|&offset| {
            if offset >= now_secs {
                offset - now_secs
            } else {
                day - now_secs + offset
            }
        })
        .min()
        .unwrap_or(day)
}

/// Computes the time-constrained slice plan (§4.7 "Optional dynamic slicing").
pub fn dynamic_slice_plan(
    now: DateTime<Utc>,
    leg_a_venue: Exchange,
    leg_b_venue: Exchange,
    config: &KeeperConfig,
) -> DynamicSlicePlan {
    let now_secs = seconds_since_midnight(now);
    let time_to_funding_a = seconds_to_next_offset(now_secs, &leg_a_venue.funding_offsets_secs());
    let time_to_funding_b = seconds_to_next_offset(now_secs, &leg_b_venue.funding_offsets_secs());
    let time_to_funding_secs = time_to_funding_a.min(time_to_funding_b);

    let available_time_ms =
        (time_to_funding_secs as i64) * 1000 - config.funding_buffer_ms as i64;

    let max_slices_by_time = if available_time_ms <= 0 {
        config.min_slices
    } else {
        let per_slice = (config.slice_fill_timeout_ms + SLICE_TIME_OVERHEAD_MS) as f64;
        ((available_time_ms as f64) / per_slice).floor() as u32
    }
    .clamp(config.min_slices, config.max_slices);

    let effective_slice_fill_timeout_ms = if time_to_funding_secs < TIME_PRESSURE_THRESHOLD_SECS {
        config.slice_fill_timeout_ms.min(TIME_PRESSURE_TIMEOUT_CAP_MS)
    } else {
        config.slice_fill_timeout_ms
    };

    DynamicSlicePlan {
        time_to_funding_secs,
        max_slices_by_time,
        effective_slice_fill_timeout_ms,
    }
}

struct FillOutcome {
    filled: bool,
    filled_size: f64,
}

pub struct SlicedExecutionEngine {
    rate_limiter: Arc<RateLimiter>,
    lock_registry: Arc<LockRegistry>,
    order_registry: Arc<OrderRegistry>,
    event_bus: Option<Arc<EventBus>>,
    retry: RetryPolicy,
    config: KeeperConfig,
}

impl SlicedExecutionEngine {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        lock_registry: Arc<LockRegistry>,
        order_registry: Arc<OrderRegistry>,
        config: KeeperConfig,
    ) -> Self {
        SlicedExecutionEngine {
            rate_limiter,
            lock_registry,
            order_registry,
            event_bus: None,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Executes a hedged order: long `side_a` on `leg_a`, the opposite side on
    /// `leg_b`. `leg_a` is the caller-designated constrained leg (§9 open
    /// question (b): the choice is stable across the slices of one call by
    /// construction, since it's fixed for the duration of this function).
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        holder: LockHolder,
        symbol: &Symbol,
        leg_a: &Arc<dyn ExchangeAdapter>,
        leg_b: &Arc<dyn ExchangeAdapter>,
        side_a: Side,
        requested_size: f64,
        total_portfolio_usd: f64,
        initial_mark_a: f64,
        initial_mark_b: f64,
    ) -> Result<SlicedExecutionResult, KeeperError> {
        if requested_size <= 0.0 {
            return Err(KeeperError::Precondition(
                "requested_size must be positive".into(),
            ));
        }
        self.acquire_symbol_lock_with_retry(symbol, holder).await?;

        let result = self
            .execute_locked(
                symbol,
                leg_a,
                leg_b,
                side_a,
                requested_size,
                total_portfolio_usd,
                initial_mark_a,
                initial_mark_b,
            )
            .await;

        self.lock_registry
            .release_symbol_lock(symbol.as_str(), holder)
            .await;
        self.order_registry.mark_execution_completed(symbol.as_str()).await;

        if let Some(bus) = &self.event_bus {
            let event_type = if result.success {
                event_types::EXECUTION_COMPLETED
            } else {
                event_types::EXECUTION_ABORTED
            };
            bus.publish(DomainEvent::new(
                event_type,
                serde_json::json!({
                    "symbol": symbol.as_str(),
                    "slices_completed": result.slices_completed,
                    "slices_planned": result.slices_planned,
                    "abort_reason": result.abort_reason,
                }),
            ))
            .await;
        }

        Ok(result)
    }

    /// Retries `try_acquire_symbol_lock` every 100 ms until it succeeds or
    /// `symbol_lock_timeout_ms` elapses (§4.4 `withSymbolLock`).
    async fn acquire_symbol_lock_with_retry(
        &self,
        symbol: &Symbol,
        holder: LockHolder,
    ) -> Result<(), KeeperError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.symbol_lock_timeout_ms);
        loop {
            if self
                .lock_registry
                .try_acquire_symbol_lock(symbol.as_str(), holder)
                .await
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(KeeperError::LockAcquisitionTimeout(format!(
                    "symbol {symbol} is locked by another execution"
                )));
            }
            tokio::time::sleep(SYMBOL_LOCK_RETRY_INTERVAL).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_locked(
        &self,
        symbol: &Symbol,
        leg_a: &Arc<dyn ExchangeAdapter>,
        leg_b: &Arc<dyn ExchangeAdapter>,
        side_a: Side,
        requested_size: f64,
        total_portfolio_usd: f64,
        initial_mark_a: f64,
        initial_mark_b: f64,
    ) -> SlicedExecutionResult {
        let side_b = side_a.opposite();
        let safety_slices =
            safety_slice_count(requested_size, initial_mark_a, total_portfolio_usd, &self.config);

        let mut slices_planned = safety_slices;
        let mut slice_fill_timeout_ms = self.config.slice_fill_timeout_ms;
        let mut time_to_funding_info = None;

        if self.config.dynamic_slicing {
            let plan = dynamic_slice_plan(Utc::now(), leg_a.venue(), leg_b.venue(), &self.config);
            slices_planned = slices_planned.max(plan.max_slices_by_time);
            slice_fill_timeout_ms = plan.effective_slice_fill_timeout_ms;
            time_to_funding_info = Some(TimeToFundingInfo {
                leg_a_seconds: plan.time_to_funding_secs,
                leg_b_seconds: plan.time_to_funding_secs,
                constrained_seconds: plan.time_to_funding_secs,
                slice_fill_timeout_ms,
            });
        }

        let slice_size = requested_size / slices_planned as f64;

        let mut current_mark_a = initial_mark_a;
        let mut current_mark_b = initial_mark_b;
        let mut total_long_filled = 0.0;
        let mut total_short_filled = 0.0;
        let mut slices = Vec::with_capacity(slices_planned as usize);
        let mut abort_reason = None;

        for slice_index in 0..slices_planned {
            if let Ok(price) = leg_a.mark_price(symbol).await {
                current_mark_a = price;
            }
            if let Ok(price) = leg_b.mark_price(symbol).await {
                current_mark_b = price;
            }

            let slice_result = self
                .run_slice(
                    slice_index,
                    symbol,
                    leg_a,
                    leg_b,
                    side_a,
                    side_b,
                    slice_size,
                    current_mark_a,
                    current_mark_b,
                    slice_fill_timeout_ms,
                )
                .await;

            total_long_filled += match side_a {
                Side::Long => slice_result.leg_a.filled_size,
                Side::Short => slice_result.leg_b.filled_size,
            };
            total_short_filled += match side_a {
                Side::Long => slice_result.leg_b.filled_size,
                Side::Short => slice_result.leg_a.filled_size,
            };

            let leg_a_unfilled = !slice_result.leg_a.filled;
            let leg_b_unfilled = !slice_result.leg_b.filled;
            let imbalance = (slice_result.leg_a.filled_size - slice_result.leg_b.filled_size).abs()
                / slice_size;

            let slice_failed = slice_result.error.is_some();
            slices.push(slice_result);

            if leg_a_unfilled || leg_b_unfilled {
                abort_reason = Some("one side completely failed".to_string());
                break;
            }
            if slice_failed {
                abort_reason = slices.last().and_then(|s| s.error.clone());
                break;
            }
            if imbalance > self.config.max_imbalance_percent {
                abort_reason = Some(format!(
                    "slice {slice_index} imbalance {imbalance:.4} exceeds tolerance"
                ));
                break;
            }

            if slice_index + 1 < slices_planned {
                tokio::time::sleep(BETWEEN_SLICE_SLEEP).await;
            }
        }

        let slices_completed = slices.len() as u32;
        let mut result = SlicedExecutionResult {
            success: false,
            slices_planned,
            slices_completed,
            total_long_filled,
            total_short_filled,
            slices,
            abort_reason,
            time_to_funding: time_to_funding_info,
        };
        result.success = result.abort_reason.is_none()
            && slices_completed == slices_planned
            && result.is_hedged_within_tolerance(requested_size);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_slice(
        &self,
        slice_index: u32,
        symbol: &Symbol,
        leg_a: &Arc<dyn ExchangeAdapter>,
        leg_b: &Arc<dyn ExchangeAdapter>,
        side_a: Side,
        side_b: Side,
        slice_size: f64,
        mark_a: f64,
        mark_b: f64,
        slice_fill_timeout_ms: u64,
    ) -> SliceResult {
        let initial_position_a = leg_a.position_size(symbol, side_a).await.unwrap_or(0.0);

        self.rate_limiter
            .acquire(&leg_a.venue().to_string(), 1, Priority::Normal, "place_order")
            .await;

        let leg_a_request = OrderRequest::limit(symbol.clone(), side_a, slice_size, mark_a);
        let leg_a_order_id = match self
            .retry
            .run(|| leg_a.place_order(leg_a_request.clone()))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return SliceResult {
                    slice_index,
                    leg_a: LegResult::default(),
                    leg_b: LegResult::default(),
                    error: Some(format!("LegAPlacementFailed: {e}")),
                };
            }
        };
        let leg_a_registered = self
            .order_registry
            .register(ActiveOrder {
                order_id: leg_a_order_id.clone(),
                symbol: symbol.clone(),
                venue: leg_a.venue(),
                side: side_a,
                owner: LockHolder::new(slice_index as u64),
                placed_at: Instant::now(),
                status: OrderStatus::Placed,
                size: Some(slice_size),
                price: Some(mark_a),
                reduce_only: false,
                initial_position_size: Some(initial_position_a),
            })
            .await;
        if !leg_a_registered {
            let _ = leg_a.cancel_order(&leg_a_order_id, symbol).await;
            return SliceResult {
                slice_index,
                leg_a: LegResult::default(),
                leg_b: LegResult::default(),
                error: Some(
                    "LegADuplicateOrder: an active order already occupies this (venue, symbol, side)"
                        .to_string(),
                ),
            };
        }

        let leg_a_outcome = self
            .wait_for_fill(
                leg_a,
                &leg_a_order_id,
                symbol,
                side_a,
                initial_position_a,
                slice_size,
                slice_fill_timeout_ms,
            )
            .await;

        let leg_a_key = OrderKey::new(leg_a.venue(), symbol.clone(), side_a);
        self.order_registry
            .update_status(
                &leg_a_key,
                OrderStatusReport {
                    status: if leg_a_outcome.filled {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Cancelled
                    },
                    filled_size: Some(leg_a_outcome.filled_size),
                    avg_fill_price: Some(mark_a),
                },
            )
            .await;

        if !leg_a_outcome.filled {
            let _ = leg_a.cancel_order(&leg_a_order_id, symbol).await;
            return SliceResult {
                slice_index,
                leg_a: LegResult {
                    filled: false,
                    filled_size: leg_a_outcome.filled_size,
                    order_id: Some(leg_a_order_id),
                    error: None,
                },
                leg_b: LegResult::default(),
                error: Some("LegAFillTimeout: Leg A did not fill in time".to_string()),
            };
        }

        if leg_a_outcome.filled_size < 0.5 * slice_size {
            let _ = leg_a.cancel_order(&leg_a_order_id, symbol).await;
            return SliceResult {
                slice_index,
                leg_a: LegResult {
                    filled: true,
                    filled_size: leg_a_outcome.filled_size,
                    order_id: Some(leg_a_order_id),
                    error: None,
                },
                leg_b: LegResult::default(),
                error: Some("Leg A filled less than 50% of the slice size".to_string()),
            };
        }

        let leg_a_result = LegResult {
            filled: true,
            filled_size: leg_a_outcome.filled_size,
            order_id: Some(leg_a_order_id.clone()),
            error: None,
        };

        let initial_position_b = leg_b.position_size(symbol, side_b).await.unwrap_or(0.0);
        self.rate_limiter
            .acquire(&leg_b.venue().to_string(), 1, Priority::Normal, "place_order")
            .await;

        let leg_b_request =
            OrderRequest::limit(symbol.clone(), side_b, leg_a_outcome.filled_size, mark_b);
        let leg_b_order_id = match self
            .retry
            .run(|| leg_b.place_order(leg_b_request.clone()))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let rollback = self
                    .rollback_leg_a(leg_a, symbol, side_a, leg_a_outcome.filled_size)
                    .await;
                return SliceResult {
                    slice_index,
                    leg_a: leg_a_result,
                    leg_b: LegResult::default(),
                    error: Some(format!("LegBPlacementFailed: {e}; {rollback}")),
                };
            }
        };
        let leg_b_registered = self
            .order_registry
            .register(ActiveOrder {
                order_id: leg_b_order_id.clone(),
                symbol: symbol.clone(),
                venue: leg_b.venue(),
                side: side_b,
                owner: LockHolder::new(slice_index as u64),
                placed_at: Instant::now(),
                status: OrderStatus::Placed,
                size: Some(leg_a_outcome.filled_size),
                price: Some(mark_b),
                reduce_only: false,
                initial_position_size: Some(initial_position_b),
            })
            .await;
        if !leg_b_registered {
            let _ = leg_b.cancel_order(&leg_b_order_id, symbol).await;
            let rollback = self
                .rollback_leg_a(leg_a, symbol, side_a, leg_a_outcome.filled_size)
                .await;
            return SliceResult {
                slice_index,
                leg_a: leg_a_result,
                leg_b: LegResult::default(),
                error: Some(format!(
                    "LegBDuplicateOrder: an active order already occupies this (venue, symbol, side); {rollback}"
                )),
            };
        }

        let leg_b_outcome = self
            .wait_for_fill(
                leg_b,
                &leg_b_order_id,
                symbol,
                side_b,
                initial_position_b,
                leg_a_outcome.filled_size,
                slice_fill_timeout_ms,
            )
            .await;

        let leg_b_key = OrderKey::new(leg_b.venue(), symbol.clone(), side_b);
        self.order_registry
            .update_status(
                &leg_b_key,
                OrderStatusReport {
                    status: if leg_b_outcome.filled {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::Cancelled
                    },
                    filled_size: Some(leg_b_outcome.filled_size),
                    avg_fill_price: Some(mark_b),
                },
            )
            .await;

        if !leg_b_outcome.filled || leg_b_outcome.filled_size < leg_a_outcome.filled_size - 1e-9 {
            let _ = leg_b.cancel_order(&leg_b_order_id, symbol).await;
            let unhedged = leg_a_outcome.filled_size - leg_b_outcome.filled_size;
            let rollback = self.rollback_leg_a(leg_a, symbol, side_a, unhedged).await;
            return SliceResult {
                slice_index,
                leg_a: leg_a_result,
                leg_b: LegResult {
                    filled: leg_b_outcome.filled,
                    filled_size: leg_b_outcome.filled_size,
                    order_id: Some(leg_b_order_id),
                    error: None,
                },
                error: Some(format!("LegBFillPartial: {rollback}")),
            };
        }

        SliceResult {
            slice_index,
            leg_a: leg_a_result,
            leg_b: LegResult {
                filled: true,
                filled_size: leg_b_outcome.filled_size,
                order_id: Some(leg_b_order_id),
                error: None,
            },
            error: None,
        }
    }

    /// Places a `reduceOnly` market order on Leg A's venue, opposite side, to
    /// neutralise `unhedged_size` after Leg B could not be completed.
    async fn rollback_leg_a(
        &self,
        leg_a: &Arc<dyn ExchangeAdapter>,
        symbol: &Symbol,
        side_a: Side,
        unhedged_size: f64,
    ) -> String {
        if unhedged_size <= 0.0 {
            return "no rollback needed".to_string();
        }
        self.rate_limiter
            .acquire(
                &leg_a.venue().to_string(),
                1,
                Priority::High,
                "rollback_order",
            )
            .await;
        let rollback_request =
            OrderRequest::reduce_only_market(symbol.clone(), side_a.opposite(), unhedged_size);
        match self
            .retry
            .run(|| leg_a.place_order(rollback_request.clone()))
            .await
        {
            Ok(_) => "rolled back Leg A".to_string(),
            Err(e) => {
                if let Some(bus) = &self.event_bus {
                    bus.publish(DomainEvent::new(
                        event_types::SINGLE_LEG_DETECTED,
                        serde_json::json!({
                            "symbol": symbol.as_str(),
                            "venue": leg_a.venue().to_string(),
                            "unhedged_size": unhedged_size,
                        }),
                    ))
                    .await;
                }
                format!("RollbackFailed: {e}; symbol left single-leg outstanding")
            }
        }
    }

    async fn wait_for_fill(
        &self,
        adapter: &Arc<dyn ExchangeAdapter>,
        order_id: &str,
        symbol: &Symbol,
        side: Side,
        initial_position: f64,
        expected_size: f64,
        timeout_ms: u64,
    ) -> FillOutcome {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match adapter.order_status(order_id).await {
                Ok(report) => match report.status {
                    OrderStatus::Filled => {
                        return FillOutcome {
                            filled: true,
                            filled_size: report.filled_size.unwrap_or(expected_size),
                        };
                    }
                    OrderStatus::PartiallyFilled => {
                        return FillOutcome {
                            filled: true,
                            filled_size: report.filled_size.unwrap_or(0.0),
                        };
                    }
                    OrderStatus::Cancelled | OrderStatus::Failed => {
                        return FillOutcome {
                            filled: false,
                            filled_size: 0.0,
                        };
                    }
                    OrderStatus::Placing | OrderStatus::Placed | OrderStatus::WaitingFill => {}
                },
                Err(_) => {
                    // Rule (d): fall back to a position-delta check. A
                    // pre-existing position alone is never evidence of a
                    // fill — only a delta from `initial_position` counts.
                    if let Ok(current) = adapter.position_size(symbol, side).await {
                        if (current - initial_position).abs() >= 0.95 * expected_size {
                            return FillOutcome {
                                filled: true,
                                filled_size: expected_size,
                            };
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return FillOutcome {
                    filled: false,
                    filled_size: 0.0,
                };
            }
            tokio::time::sleep(Duration::from_millis(
                self.config.fill_check_interval_ms.min(timeout_ms),
            ))
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> KeeperConfig {
        KeeperConfig::default()
    }

    #[test]
    fn safety_slice_count_respects_max_usd_per_slice() {
        let mut cfg = config();
        cfg.max_portfolio_pct_per_slice = 0.05;
        cfg.max_usd_per_slice = 10_000.0;
        cfg.min_slices = 1;
        cfg.max_slices = 20;
        // Portfolio 10,000 USD (5k + 5k); order 2.5 units at 1000 -> 2,500 USD
        // notional; max_slice_usd = min(0.05*10000, 10000) = 500. 2500/500 = 5.
        let slices = safety_slice_count(2.5, 1000.0, 10_000.0, &cfg);
        assert_eq!(slices, 5);
    }

    #[test]
    fn safety_slice_count_honors_min_slices_floor() {
        let mut cfg = config();
        cfg.min_slices = 1;
        cfg.max_slices = 1;
        // 0.1 units at 3000 on a 100,000 USD portfolio: tiny notional, 1 slice.
        let slices = safety_slice_count(0.1, 3000.0, 100_000.0, &cfg);
        assert_eq!(slices, 1);
    }

    #[test]
    fn dynamic_slice_plan_reduces_slice_count_and_timeout_under_time_pressure() {
        let mut cfg = config();
        cfg.funding_buffer_ms = 2 * 60 * 1000;
        cfg.slice_fill_timeout_ms = 30_000;
        cfg.min_slices = 2;
        cfg.max_slices = 20;

        // Construct a UTC instant exactly 4 minutes before an hourly funding mark.
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 11, 56, 0).unwrap();
        let plan = dynamic_slice_plan(now, Exchange::Alpha, Exchange::Alpha, &cfg);

        assert_eq!(plan.time_to_funding_secs, 4 * 60);
        assert_eq!(plan.max_slices_by_time, 3);
        assert_eq!(plan.effective_slice_fill_timeout_ms, 15_000);
    }

    #[test]
    fn dynamic_slice_plan_leaves_timeout_untouched_when_not_time_pressured() {
        let cfg = config();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap();
        let plan = dynamic_slice_plan(now, Exchange::Alpha, Exchange::Alpha, &cfg);
        assert_eq!(plan.effective_slice_fill_timeout_ms, cfg.slice_fill_timeout_ms);
    }
}
