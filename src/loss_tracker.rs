//! Cost basis and break-even arithmetic for live positions (§4.5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::model::{Exchange, PositionEntry, PositionExit, Side, Symbol, position_key};

/// Outcome of a break-even query for a single live position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakEvenResult {
    pub hourly_return: f64,
    pub fees_earned_so_far: f64,
    pub estimated_exit_cost: f64,
    pub remaining_cost: f64,
    /// `None` means break-even is unreachable (non-positive hourly return).
    pub remaining_break_even_hours: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: HashMap<String, PositionEntry>,
    exits: Vec<PositionExit>,
    total_entry_cost: f64,
    total_exit_cost: f64,
    total_realized_pnl: f64,
}

/// Keeps `entries`/`exits`/`currentPositions` and serves break-even and
/// switching-cost arithmetic. Persistence is best-effort JSON, per §9's design
/// note that restart-time loading is not a core invariant.
pub struct LossTracker {
    inner: Mutex<Snapshot>,
}

impl Default for LossTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LossTracker {
    pub fn new() -> Self {
        LossTracker {
            inner: Mutex::new(Snapshot::default()),
        }
    }

    pub async fn record_position_entry(
        &self,
        symbol: &Symbol,
        venue: Exchange,
        entry_cost: f64,
        position_value_usd: f64,
        opened_at: DateTime<Utc>,
    ) {
        let mut snap = self.inner.lock().await;
        snap.total_entry_cost += entry_cost;
        snap.entries.insert(
            position_key(symbol, venue),
            PositionEntry {
                symbol: symbol.clone(),
                venue,
                entry_cost,
                position_value_usd,
                opened_at,
            },
        );
    }

    /// Removes the current position (if any) and appends an exit record.
    /// `hoursHeld = now - entry.startTime`.
    pub async fn record_position_exit(
        &self,
        symbol: &Symbol,
        venue: Exchange,
        exit_cost: f64,
        realized_pnl: f64,
        now: DateTime<Utc>,
    ) -> Option<PositionExit> {
        let mut snap = self.inner.lock().await;
        let key = position_key(symbol, venue);
        let entry = snap.entries.remove(&key)?;
        let hours_held = (now - entry.opened_at).num_milliseconds() as f64 / 3_600_000.0;
        let exit = PositionExit {
            symbol: symbol.clone(),
            venue,
            exit_cost,
            realized_pnl,
            hours_held,
            closed_at: now,
        };
        snap.total_exit_cost += exit_cost;
        snap.total_realized_pnl += realized_pnl;
        snap.exits.push(exit.clone());
        Some(exit)
    }

    pub async fn current_position(&self, symbol: &Symbol, venue: Exchange) -> Option<PositionEntry> {
        self.inner
            .lock()
            .await
            .entries
            .get(&position_key(symbol, venue))
            .cloned()
    }

    /// Σ entry costs + Σ exit costs + Σ realized P&L (signed). Negative means
    /// net loss.
    pub async fn cumulative_loss(&self) -> f64 {
        let snap = self.inner.lock().await;
        snap.total_entry_cost + snap.total_exit_cost + snap.total_realized_pnl
    }

    /// Break-even query for a live position (§4.5).
    pub fn break_even(
        side: Side,
        funding_rate: f64,
        value_usd: f64,
        entry_cost: f64,
        hours_held: f64,
    ) -> BreakEvenResult {
        let sign = match side {
            Side::Short => 1.0,
            Side::Long => -1.0,
        };
        let hourly_return = sign * funding_rate * value_usd;
        if hourly_return <= 0.0 {
            return BreakEvenResult {
                hourly_return,
                fees_earned_so_far: hours_held * hourly_return,
                estimated_exit_cost: entry_cost,
                remaining_cost: entry_cost + entry_cost - hours_held * hourly_return,
                remaining_break_even_hours: None,
            };
        }
        let fees_earned_so_far = hours_held * hourly_return;
        let estimated_exit_cost = entry_cost;
        let remaining_cost = entry_cost + estimated_exit_cost - fees_earned_so_far;
        let remaining_break_even_hours = if remaining_cost <= 0.0 {
            Some(0.0)
        } else {
            Some(remaining_cost / hourly_return)
        };
        BreakEvenResult {
            hourly_return,
            fees_earned_so_far,
            estimated_exit_cost,
            remaining_cost,
            remaining_break_even_hours,
        }
    }

    /// `totalSwitchingCost = P1.exitCost + P2.entryCost + P2.exitCost +
    /// feesEarnedSoFar_on_P1` (§4.5) — the last term is progress forfeited by
    /// closing P1 rather than letting it run.
    pub fn switching_cost(
        p1_exit_cost: f64,
        p2_entry_cost: f64,
        p2_exit_cost: f64,
        p1_fees_earned_so_far: f64,
    ) -> f64 {
        p1_exit_cost + p2_entry_cost + p2_exit_cost + p1_fees_earned_so_far
    }

    /// Best-effort JSON dump. Failure is logged and swallowed — persistence
    /// is an optimisation, not a correctness requirement (§9).
    pub async fn save_to(&self, path: impl AsRef<Path>) {
        let snap = self.inner.lock().await;
        match serde_json::to_vec_pretty(&*snap) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(path.as_ref(), bytes).await {
                    eprintln!("loss_tracker: failed to persist to {:?}: {e}", path.as_ref());
                }
            }
            Err(e) => eprintln!("loss_tracker: failed to serialize snapshot: {e}"),
        }
    }

    pub async fn load_from(&self, path: impl AsRef<Path>) {
        let path: PathBuf = path.as_ref().to_path_buf();
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snap) => *self.inner.lock().await = snap,
                Err(e) => eprintln!("loss_tracker: failed to parse {path:?}: {e}"),
            },
            Err(e) => eprintln!("loss_tracker: failed to read {path:?}: {e}"),
        }
    }
}
