use serde::{Deserialize, Serialize};

/// Per-leg outcome of a single slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegResult {
    pub filled: bool,
    pub filled_size: f64,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// Result of executing a single slice of a hedged order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceResult {
    pub slice_index: u32,
    pub leg_a: LegResult,
    pub leg_b: LegResult,
    pub error: Option<String>,
}

impl SliceResult {
    /// Hedge parity per slice (§8): the two legs' filled sizes must agree to
    /// within floating-point noise.
    pub fn is_balanced(&self) -> bool {
        (self.leg_a.filled_size - self.leg_b.filled_size).abs() < 1e-9
    }
}

/// Time-to-funding context attached to a result when dynamic slicing ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeToFundingInfo {
    pub leg_a_seconds: u64,
    pub leg_b_seconds: u64,
    pub constrained_seconds: u64,
    pub slice_fill_timeout_ms: u64,
}

/// Outcome of a full sliced hedged execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlicedExecutionResult {
    pub success: bool,
    pub slices_planned: u32,
    pub slices_completed: u32,
    pub total_long_filled: f64,
    pub total_short_filled: f64,
    pub slices: Vec<SliceResult>,
    pub abort_reason: Option<String>,
    pub time_to_funding: Option<TimeToFundingInfo>,
}

impl SlicedExecutionResult {
    /// Overall hedge parity (§8): within 2% of requested size.
    pub fn is_hedged_within_tolerance(&self, requested_size: f64) -> bool {
        if requested_size <= 0.0 {
            return true;
        }
        (self.total_long_filled - self.total_short_filled).abs() / requested_size < 0.02
    }
}
