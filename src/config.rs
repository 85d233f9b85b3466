use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::KeeperError;

/// Per-venue rate-limit override (§6: "Rate-limit overrides per venue").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOverride {
    pub per_second: u32,
    pub per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 5,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// All recognised configuration options (§6), grounded on the teacher's plain
/// `RuntimeConfig` struct (`run/config.rs`) — no config-framework dependency,
/// just a serde-deserializable struct with a constructor that validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    // Leverage
    pub min_leverage: f64,
    pub max_leverage: f64,
    pub leverage_lookback_hours: u32,
    #[serde(default)]
    pub leverage_overrides: HashMap<String, f64>,

    // Slicing bounds
    pub max_portfolio_pct_per_slice: f64,
    pub max_usd_per_slice: f64,
    pub min_slices: u32,
    pub max_slices: u32,

    // Per-slice timing and tolerance
    pub slice_fill_timeout_ms: u64,
    pub fill_check_interval_ms: u64,
    pub max_imbalance_percent: f64,

    // Time-to-funding behaviour
    pub dynamic_slicing: bool,
    pub funding_buffer_ms: u64,

    // Rate-limit overrides per venue name
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitOverride>,

    // Evaluator rejection threshold
    pub max_worst_case_break_even_days: f64,

    pub retry: RetryConfig,

    // Registry staleness thresholds
    pub lock_timeout_ms: u64,
    pub symbol_lock_timeout_ms: u64,
    pub order_timeout_ms: u64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        KeeperConfig {
            min_leverage: 1.0,
            max_leverage: 5.0,
            leverage_lookback_hours: 24,
            leverage_overrides: HashMap::new(),
            max_portfolio_pct_per_slice: 0.05,
            max_usd_per_slice: 10_000.0,
            min_slices: 1,
            max_slices: 20,
            slice_fill_timeout_ms: 30_000,
            fill_check_interval_ms: 1_000,
            max_imbalance_percent: 0.10,
            dynamic_slicing: true,
            funding_buffer_ms: 2 * 60 * 1000,
            rate_limits: HashMap::new(),
            max_worst_case_break_even_days: 30.0,
            retry: RetryConfig::default(),
            lock_timeout_ms: 120_000,
            symbol_lock_timeout_ms: 30_000,
            order_timeout_ms: 10 * 60 * 1000,
        }
    }
}

impl KeeperConfig {
    /// Parse from JSON, matching the teacher's serde-first configuration style
    /// (workflow files are JSON throughout `defi-flow`).
    pub fn from_json(raw: &str) -> Result<Self, KeeperError> {
        let config: KeeperConfig =
            serde_json::from_str(raw).map_err(|e| KeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), KeeperError> {
        if self.min_slices == 0 {
            return Err(KeeperError::Config("min_slices must be >= 1".into()));
        }
        if self.max_slices < self.min_slices {
            return Err(KeeperError::Config(
                "max_slices must be >= min_slices".into(),
            ));
        }
        if self.min_leverage <= 0.0 || self.max_leverage < self.min_leverage {
            return Err(KeeperError::Config("invalid leverage bounds".into()));
        }
        if self.max_imbalance_percent <= 0.0 || self.max_imbalance_percent >= 1.0 {
            return Err(KeeperError::Config(
                "max_imbalance_percent must be in (0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Leverage recommendation clamp, honoring per-symbol overrides (§6).
    pub fn clamp_leverage(&self, symbol: &str, recommended: f64) -> f64 {
        let (lo, hi) = match self.leverage_overrides.get(symbol) {
            Some(&over) => (self.min_leverage, over.max(self.min_leverage)),
            None => (self.min_leverage, self.max_leverage),
        };
        recommended.clamp(lo, hi)
    }
}
