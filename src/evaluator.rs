//! Scores candidate arbitrages and decides whether to open or rebalance into
//! one (§4.6).

use chrono::{DateTime, Utc};

use crate::model::{Exchange, Symbol};

/// A candidate funding-rate arbitrage: long on one venue, short on another.
#[derive(Debug, Clone)]
pub struct CandidateOpportunity {
    pub symbol: Symbol,
    pub long_venue: Exchange,
    pub short_venue: Exchange,
    pub expected_spread: f64,
    pub long_mark: f64,
    pub short_mark: f64,
    pub long_open_interest: Option<f64>,
    pub short_open_interest: Option<f64>,
}

/// A proposed execution for a candidate: size and estimated costs.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPlan {
    pub position_size_usd: f64,
    pub entry_fees: f64,
    pub exit_fees: f64,
    pub slippage: f64,
    pub expected_net_return: f64,
}

/// Historical rate statistics for the candidate's spread.
#[derive(Debug, Clone, Copy)]
pub struct HistoricalMetrics {
    pub avg_rate: f64,
    pub std_dev: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub consistency_score: f64,
}

/// A single historical funding-rate observation, as returned by
/// `HistoricalFundingService::get_historical_data`.
#[derive(Debug, Clone, Copy)]
pub struct HistoricalRatePoint {
    pub rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Spread volatility between a long and short leg's historical rates.
#[derive(Debug, Clone, Copy)]
pub struct SpreadVolatilityMetrics {
    pub avg_spread: f64,
    pub std_dev: f64,
    pub min_spread: f64,
    pub max_spread: f64,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub opportunity: CandidateOpportunity,
    pub plan: ExecutionPlan,
    pub liquidity: f64,
    /// `None` means worst-case break-even is infinite.
    pub worst_case_break_even_hours: Option<f64>,
    pub score: f64,
}

const HOURS_PER_DAY: f64 = 24.0;

/// `clamp(0..1) of log10(min(longOI, shortOI) / 1000) / 10`; fallback `0.1` if
/// open interest is missing on either leg (§4.6).
pub fn liquidity_proxy(long_oi: Option<f64>, short_oi: Option<f64>) -> f64 {
    match (long_oi, short_oi) {
        (Some(l), Some(s)) if l > 0.0 && s > 0.0 => {
            let min_oi = l.min(s);
            (min_oi / 1000.0).log10() / 10.0
        }
        _ => return 0.1,
    }
    .clamp(0.0, 1.0)
}

/// Scores a single candidate against its execution plan and historical
/// metrics. Worst-case break-even uses the historical minimum rate to
/// construct a worst-case spread; the hourly worst-case return collapses to
/// `worstSpread * positionSizeUsd` per §4.6.
pub fn score_candidate(
    opportunity: CandidateOpportunity,
    plan: ExecutionPlan,
    metrics: HistoricalMetrics,
) -> ScoredCandidate {
    let liquidity = liquidity_proxy(opportunity.long_open_interest, opportunity.short_open_interest);

    let worst_case_hourly_return = metrics.min_rate * plan.position_size_usd;
    let total_costs = plan.entry_fees + plan.exit_fees + plan.slippage;
    let worst_case_break_even_hours = if worst_case_hourly_return > 0.0 {
        Some(total_costs / worst_case_hourly_return)
    } else {
        None
    };

    let score = match worst_case_break_even_hours {
        Some(hours) if hours > 0.0 => {
            metrics.consistency_score * metrics.avg_rate.abs() * liquidity / hours
        }
        _ => 0.0,
    };

    ScoredCandidate {
        opportunity,
        plan,
        liquidity,
        worst_case_break_even_hours,
        score,
    }
}

/// Picks the top-scored candidate, rejecting it if its worst-case break-even
/// exceeds `max_worst_case_break_even_days`.
pub fn select_top_candidate(
    candidates: Vec<ScoredCandidate>,
    max_worst_case_break_even_days: f64,
) -> Option<ScoredCandidate> {
    let best = candidates
        .into_iter()
        .max_by(|a, b| a.score.total_cmp(&b.score))?;

    let worst_case_days = match best.worst_case_break_even_hours {
        Some(hours) => hours / HOURS_PER_DAY,
        None => f64::INFINITY,
    };
    if worst_case_days > max_worst_case_break_even_days {
        return None;
    }
    Some(best)
}

/// Outcome of the rebalance decision (§4.6): whether to abandon the current
/// position P1 for candidate P2.
#[derive(Debug, Clone)]
pub struct RebalanceDecision {
    pub should_rebalance: bool,
    pub p1_remaining_ttbe_hours: Option<f64>,
    pub p2_ttbe_hours: Option<f64>,
    pub reason: String,
}

/// Decides whether to rebalance from P1 into P2, per the six-branch ordering
/// in §4.6 (first match wins).
///
/// `p1_remaining_cost` and `p1_remaining_ttbe_hours` come from
/// [`crate::loss_tracker::LossTracker::break_even`] for P1; `p1_fees_outstanding`
/// is P1's fees earned so far (zero if P1 is already closed).
pub fn decide_rebalance(
    p1_remaining_cost: f64,
    p1_remaining_ttbe_hours: Option<f64>,
    p1_fees_outstanding: f64,
    p2_plan: &ExecutionPlan,
    p2_hourly_return: f64,
) -> RebalanceDecision {
    let total_p2_costs =
        p1_fees_outstanding + p2_plan.entry_fees + p2_plan.exit_fees + p2_plan.slippage;
    let p2_ttbe_hours = if p2_hourly_return > 0.0 {
        Some(total_p2_costs / p2_hourly_return)
    } else {
        None
    };

    let decision = |should_rebalance: bool, reason: &str| RebalanceDecision {
        should_rebalance,
        p1_remaining_ttbe_hours,
        p2_ttbe_hours,
        reason: reason.to_string(),
    };

    if p2_plan.expected_net_return > 0.0 {
        return decision(true, "P2 is instantly net-profitable");
    }
    if p1_remaining_cost <= 0.0 {
        return decision(false, "P1 is already profitable");
    }
    match (p1_remaining_ttbe_hours, p2_ttbe_hours) {
        (None, Some(_)) => decision(
            true,
            "P1's remaining break-even is unreachable but P2's is finite",
        ),
        (None, None) => decision(false, "both P1 and P2 break-even are unreachable"),
        (Some(_), None) => decision(false, "P2's break-even is unreachable"),
        (Some(p1), Some(p2)) => {
            if p2 < p1 {
                decision(
                    true,
                    &format!("P2 breaks even {:.2}h sooner than P1", p1 - p2),
                )
            } else {
                decision(false, "P2 does not break even sooner than P1")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(entry: f64, exit: f64, slippage: f64, net: f64) -> ExecutionPlan {
        ExecutionPlan {
            position_size_usd: 10_000.0,
            entry_fees: entry,
            exit_fees: exit,
            slippage,
            expected_net_return: net,
        }
    }

    #[test]
    fn liquidity_proxy_falls_back_when_oi_missing() {
        assert_eq!(liquidity_proxy(None, Some(1_000_000.0)), 0.1);
    }

    #[test]
    fn liquidity_proxy_is_monotonic_in_min_open_interest() {
        let low = liquidity_proxy(Some(2_000.0), Some(2_000.0));
        let high = liquidity_proxy(Some(2_000_000.0), Some(2_000_000.0));
        assert!(high > low);
    }

    #[test]
    fn negative_worst_case_return_yields_infinite_break_even_and_zero_score() {
        let opp = CandidateOpportunity {
            symbol: Symbol::normalize("BTC"),
            long_venue: Exchange::Alpha,
            short_venue: Exchange::Beta,
            expected_spread: 0.001,
            long_mark: 100.0,
            short_mark: 100.0,
            long_open_interest: Some(5_000_000.0),
            short_open_interest: Some(5_000_000.0),
        };
        let metrics = HistoricalMetrics {
            avg_rate: 0.0005,
            std_dev: 0.0001,
            min_rate: -0.0001,
            max_rate: 0.001,
            consistency_score: 0.8,
        };
        let scored = score_candidate(opp, plan(5.0, 5.0, 1.0, 0.0), metrics);
        assert!(scored.worst_case_break_even_hours.is_none());
        assert_eq!(scored.score, 0.0);
    }

    #[test]
    fn select_top_candidate_rejects_beyond_day_budget() {
        let opp = CandidateOpportunity {
            symbol: Symbol::normalize("BTC"),
            long_venue: Exchange::Alpha,
            short_venue: Exchange::Beta,
            expected_spread: 0.001,
            long_mark: 100.0,
            short_mark: 100.0,
            long_open_interest: Some(5_000_000.0),
            short_open_interest: Some(5_000_000.0),
        };
        let metrics = HistoricalMetrics {
            avg_rate: 0.00001,
            std_dev: 0.000001,
            min_rate: 0.00001,
            max_rate: 0.00002,
            consistency_score: 0.9,
        };
        let scored = score_candidate(opp, plan(100.0, 100.0, 10.0, 0.0), metrics);
        assert!(scored.worst_case_break_even_hours.unwrap() / 24.0 > 30.0);
        assert!(select_top_candidate(vec![scored], 30.0).is_none());
    }

    #[test]
    fn rebalance_prefers_instantly_profitable_p2() {
        let decision = decide_rebalance(100.0, Some(50.0), 5.0, &plan(1.0, 1.0, 0.0, 10.0), 0.5);
        assert!(decision.should_rebalance);
        assert_eq!(decision.reason, "P2 is instantly net-profitable");
    }

    #[test]
    fn rebalance_skips_when_p1_already_profitable() {
        let decision = decide_rebalance(-1.0, Some(50.0), 0.0, &plan(1.0, 1.0, 0.0, 0.0), 0.5);
        assert!(!decision.should_rebalance);
        assert_eq!(decision.reason, "P1 is already profitable");
    }

    #[test]
    fn rebalance_skips_when_both_unreachable() {
        let decision = decide_rebalance(100.0, None, 5.0, &plan(1.0, 1.0, 0.0, 0.0), 0.0);
        assert!(!decision.should_rebalance);
        assert_eq!(decision.reason, "both P1 and P2 break-even are unreachable");
    }

    #[test]
    fn rebalance_moves_when_p1_unreachable_and_p2_reachable() {
        let decision = decide_rebalance(100.0, None, 5.0, &plan(1.0, 1.0, 0.0, 0.0), 0.5);
        assert!(decision.should_rebalance);
    }

    #[test]
    fn rebalance_skips_when_p2_slower_than_p1() {
        let decision = decide_rebalance(100.0, Some(10.0), 5.0, &plan(5.0, 5.0, 0.0, 0.0), 0.1);
        // total_p2_costs = 5 + 5 + 5 + 0 = 15, hourly 0.1 -> ttbe = 150 > 10
        assert!(!decision.should_rebalance);
    }

    #[test]
    fn rebalance_moves_when_p2_faster_than_p1() {
        let decision = decide_rebalance(100.0, Some(200.0), 5.0, &plan(1.0, 1.0, 0.0, 0.0), 1.0);
        // total_p2_costs = 5 + 1 + 1 + 0 = 7, hourly 1.0 -> ttbe = 7 < 200
        assert!(decision.should_rebalance);
    }
}
