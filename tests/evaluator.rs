use perp_arb_keeper::evaluator::{
    decide_rebalance, score_candidate, select_top_candidate, CandidateOpportunity, ExecutionPlan,
    HistoricalMetrics,
};
use perp_arb_keeper::loss_tracker::LossTracker;
use perp_arb_keeper::model::{Exchange, Side, Symbol};

fn opportunity(symbol: &str, long_oi: f64, short_oi: f64) -> CandidateOpportunity {
    CandidateOpportunity {
        symbol: Symbol::normalize(symbol),
        long_venue: Exchange::Alpha,
        short_venue: Exchange::Beta,
        expected_spread: 0.0003,
        long_mark: 2_000.0,
        short_mark: 2_000.0,
        long_open_interest: Some(long_oi),
        short_open_interest: Some(short_oi),
    }
}

fn plan() -> ExecutionPlan {
    ExecutionPlan {
        position_size_usd: 20_000.0,
        entry_fees: 4.0,
        exit_fees: 4.0,
        slippage: 2.0,
        expected_net_return: 0.0,
    }
}

#[test]
fn deep_liquidity_candidate_outranks_a_thinner_one_with_the_same_rate_profile() {
    let metrics = HistoricalMetrics {
        avg_rate: 0.0003,
        std_dev: 0.00005,
        min_rate: 0.0002,
        max_rate: 0.0004,
        consistency_score: 0.85,
    };

    let deep = score_candidate(opportunity("BTC-PERP", 8_000_000.0, 8_000_000.0), plan(), metrics);
    let thin = score_candidate(opportunity("ETH-PERP", 3_000.0, 3_000.0), plan(), metrics);

    let best = select_top_candidate(vec![deep.clone(), thin.clone()], 30.0).unwrap();
    assert_eq!(best.opportunity.symbol, deep.opportunity.symbol);
    assert!(deep.liquidity > thin.liquidity);
}

#[test]
fn candidate_whose_worst_case_break_even_exceeds_the_day_budget_is_rejected() {
    let metrics = HistoricalMetrics {
        avg_rate: 0.00002,
        std_dev: 0.000005,
        min_rate: 0.00001,
        max_rate: 0.00003,
        consistency_score: 0.7,
    };
    let scored = score_candidate(opportunity("BTC-PERP", 5_000_000.0, 5_000_000.0), plan(), metrics);
    assert!(select_top_candidate(vec![scored], 1.0).is_none());
}

#[test]
fn empty_candidate_list_selects_nothing() {
    assert!(select_top_candidate(Vec::new(), 30.0).is_none());
}

#[test]
fn rebalance_decision_chains_off_a_real_break_even_query() {
    // P1: a short position that is far from break-even (lots of remaining cost).
    let p1 = LossTracker::break_even(Side::Short, 0.00005, 20_000.0, 80.0, 1.0);
    assert!(p1.remaining_break_even_hours.is_some());

    // P2: a much richer candidate that would break even far sooner.
    let p2_plan = ExecutionPlan {
        position_size_usd: 20_000.0,
        entry_fees: 4.0,
        exit_fees: 4.0,
        slippage: 2.0,
        expected_net_return: 0.0,
    };
    let p2_hourly_return = 0.001 * p2_plan.position_size_usd;

    let decision = decide_rebalance(
        p1.remaining_cost,
        p1.remaining_break_even_hours,
        p1.fees_earned_so_far,
        &p2_plan,
        p2_hourly_return,
    );

    assert!(decision.should_rebalance);
    assert!(decision.p2_ttbe_hours.unwrap() < decision.p1_remaining_ttbe_hours.unwrap());
}

#[test]
fn rebalance_decision_skips_when_current_position_already_cleared_its_cost() {
    let p1 = LossTracker::break_even(Side::Short, 0.01, 20_000.0, 1.0, 1_000.0);
    // Plenty of hours held at a healthy rate means remaining_cost has gone negative.
    assert!(p1.remaining_cost <= 0.0);

    let decision = decide_rebalance(
        p1.remaining_cost,
        p1.remaining_break_even_hours,
        p1.fees_earned_so_far,
        &plan(),
        5.0,
    );
    assert!(!decision.should_rebalance);
    assert_eq!(decision.reason, "P1 is already profitable");
}
