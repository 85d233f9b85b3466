use std::sync::Arc;
use std::time::Duration;

use perp_arb_keeper::config::KeeperConfig;
use perp_arb_keeper::model::{ActiveOrder, Exchange, LockHolder, OrderKey, OrderStatus, OrderStatusReport, Side, Symbol};
use perp_arb_keeper::registry::{LockPriority, LockRegistry, OrderRegistry};

fn cfg() -> KeeperConfig {
    KeeperConfig::default()
}

fn order(symbol: &str, venue: Exchange, holder: u64) -> ActiveOrder {
    ActiveOrder {
        order_id: format!("order-{holder}"),
        symbol: Symbol::normalize(symbol),
        venue,
        side: Side::Long,
        owner: LockHolder::new(holder),
        placed_at: tokio::time::Instant::now(),
        status: OrderStatus::Placed,
        size: Some(1.0),
        price: Some(100.0),
        reduce_only: false,
        initial_position_size: Some(0.0),
    }
}

#[tokio::test]
async fn symbol_locks_are_independent_per_symbol() {
    let reg = LockRegistry::new(&cfg());
    assert!(reg.try_acquire_symbol_lock("BTC", LockHolder::new(1)).await);
    assert!(reg.try_acquire_symbol_lock("ETH", LockHolder::new(2)).await);
    assert!(!reg.try_acquire_symbol_lock("BTC", LockHolder::new(3)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_lock_admits_high_priority_waiter_before_an_earlier_normal_waiter() {
    let reg = Arc::new(LockRegistry::new(&cfg()));

    // Holder 1 takes the lock first so holders 2 (normal) and 3 (high) queue behind it.
    reg.acquire_global_lock(LockHolder::new(1), LockPriority::Normal)
        .await;

    let order_seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let reg_normal = reg.clone();
    let order_normal = order_seen.clone();
    let normal_waiter = tokio::spawn(async move {
        reg_normal
            .acquire_global_lock(LockHolder::new(2), LockPriority::Normal)
            .await;
        order_normal.lock().await.push(2u64);
        reg_normal.release_global_lock(LockHolder::new(2)).await;
    });

    // Give the normal waiter a head start in the queue.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reg_high = reg.clone();
    let order_high = order_seen.clone();
    let high_waiter = tokio::spawn(async move {
        reg_high
            .acquire_global_lock(LockHolder::new(3), LockPriority::High)
            .await;
        order_high.lock().await.push(3u64);
        reg_high.release_global_lock(LockHolder::new(3)).await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    reg.release_global_lock(LockHolder::new(1)).await;

    normal_waiter.await.unwrap();
    high_waiter.await.unwrap();

    let seen = order_seen.lock().await.clone();
    assert_eq!(seen, vec![3, 2]);
}

#[tokio::test]
async fn order_registry_round_trips_through_active_and_history() {
    let reg = OrderRegistry::new(&cfg());
    let placed = order("BTC-PERP", Exchange::Alpha, 1);
    let key = placed.key();
    reg.register(placed).await;

    assert!(reg.get(&key).await.is_some());

    let updated = reg
        .update_status(
            &key,
            OrderStatusReport {
                status: OrderStatus::PartiallyFilled,
                filled_size: Some(0.5),
                avg_fill_price: Some(101.0),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, OrderStatus::PartiallyFilled);
    assert!(reg.get(&key).await.is_some());

    reg.update_status(
        &key,
        OrderStatusReport {
            status: OrderStatus::Filled,
            filled_size: Some(1.0),
            avg_fill_price: Some(101.0),
        },
    )
    .await;
    assert!(reg.get(&key).await.is_none());
    assert_eq!(reg.history().await.len(), 1);
}

#[tokio::test]
async fn updating_an_already_terminal_order_is_a_no_op() {
    let reg = OrderRegistry::new(&cfg());
    let placed = order("ETH-PERP", Exchange::Alpha, 1);
    let key = placed.key();
    reg.register(placed).await;

    let first = reg
        .update_status(
            &key,
            OrderStatusReport {
                status: OrderStatus::Filled,
                filled_size: Some(1.0),
                avg_fill_price: Some(100.0),
            },
        )
        .await;
    assert!(first.is_some());
    assert_eq!(reg.history().await.len(), 1);

    // The order already moved to history; a second terminal update for the
    // same key finds nothing active to mutate and is a safe no-op.
    let second = reg
        .update_status(
            &key,
            OrderStatusReport {
                status: OrderStatus::Cancelled,
                filled_size: Some(1.0),
                avg_fill_price: Some(100.0),
            },
        )
        .await;
    assert!(second.is_none());
    assert_eq!(reg.history().await.len(), 1);
}

#[tokio::test]
async fn registering_an_order_at_an_occupied_key_is_refused() {
    let reg = OrderRegistry::new(&cfg());
    let first = order("BTC-PERP", Exchange::Alpha, 1);
    assert!(reg.register(first).await);

    let second = order("BTC-PERP", Exchange::Alpha, 2);
    assert!(!reg.register(second).await);

    // The first holder's order is still the one on record.
    let key = OrderKey::new(Exchange::Alpha, Symbol::normalize("BTC-PERP"), Side::Long);
    assert_eq!(reg.get(&key).await.unwrap().owner, LockHolder::new(1));
}

#[tokio::test]
async fn unknown_order_key_status_update_returns_none() {
    let reg = OrderRegistry::new(&cfg());
    let key = OrderKey::new(Exchange::Alpha, Symbol::normalize("BTC-PERP"), Side::Long);
    let result = reg
        .update_status(
            &key,
            OrderStatusReport {
                status: OrderStatus::Filled,
                filled_size: Some(1.0),
                avg_fill_price: Some(1.0),
            },
        )
        .await;
    assert!(result.is_none());
}
