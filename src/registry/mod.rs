//! Symbol/global locking and the in-flight order registry (§4.4).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::KeeperConfig;
use crate::model::{ActiveOrder, LockHolder, OrderKey, OrderStatus, OrderStatusReport};

const ORDER_HISTORY_CAPACITY: usize = 100;
const COOLDOWN_TTL: Duration = Duration::from_secs(60 * 60);
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockPriority {
    Normal,
    High,
}

struct SymbolLockEntry {
    holder: LockHolder,
    acquired_at: Instant,
}

struct GlobalLockEntry {
    holder: LockHolder,
    acquired_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct GlobalTicket {
    priority: LockPriority,
    seq: u64,
}

/// Symbol-level and whole-book locks, with staleness-based auto-release so a
/// crashed holder can never wedge the keeper forever. Staleness windows come
/// from `KeeperConfig` (§6's `symbolLockTimeoutMs`/`lockTimeoutMs`) rather
/// than being fixed, so an operator can tune them without a rebuild.
pub struct LockRegistry {
    symbol_locks: Mutex<HashMap<String, SymbolLockEntry>>,
    global_lock: Mutex<Option<GlobalLockEntry>>,
    global_queue: Mutex<Vec<GlobalTicket>>,
    next_seq: std::sync::atomic::AtomicU64,
    symbol_lock_staleness: Duration,
    global_lock_staleness: Duration,
}

impl LockRegistry {
    pub fn new(config: &KeeperConfig) -> Self {
        LockRegistry {
            symbol_locks: Mutex::new(HashMap::new()),
            global_lock: Mutex::new(None),
            global_queue: Mutex::new(Vec::new()),
            next_seq: std::sync::atomic::AtomicU64::new(0),
            symbol_lock_staleness: Duration::from_millis(config.symbol_lock_timeout_ms),
            global_lock_staleness: Duration::from_millis(config.lock_timeout_ms),
        }
    }

    /// Attempts to take the per-symbol lock immediately, evicting a stale
    /// holder first. Returns `false` if a live holder already owns it.
    pub async fn try_acquire_symbol_lock(&self, symbol: &str, holder: LockHolder) -> bool {
        let now = Instant::now();
        let mut locks = self.symbol_locks.lock().await;
        if let Some(entry) = locks.get(symbol) {
            if now.saturating_duration_since(entry.acquired_at) < self.symbol_lock_staleness {
                return false;
            }
        }
        locks.insert(
            symbol.to_string(),
            SymbolLockEntry {
                holder,
                acquired_at: now,
            },
        );
        true
    }

    pub async fn release_symbol_lock(&self, symbol: &str, holder: LockHolder) {
        let mut locks = self.symbol_locks.lock().await;
        if let Some(entry) = locks.get(symbol) {
            if entry.holder.0 == holder.0 {
                locks.remove(symbol);
            }
        }
    }

    pub async fn is_symbol_locked(&self, symbol: &str) -> bool {
        let now = Instant::now();
        let locks = self.symbol_locks.lock().await;
        locks
            .get(symbol)
            .is_some_and(|e| now.saturating_duration_since(e.acquired_at) < self.symbol_lock_staleness)
    }

    /// Blocks until the global (whole-book) lock is acquired, honoring a
    /// priority queue and a staleness cap on the current holder.
    pub async fn acquire_global_lock(&self, holder: LockHolder, priority: LockPriority) {
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let ticket = GlobalTicket { priority, seq };
        self.global_queue.lock().await.push(ticket);

        loop {
            let now = Instant::now();
            {
                let mut global = self.global_lock.lock().await;
                if let Some(entry) = &*global {
                    if now.saturating_duration_since(entry.acquired_at) >= self.global_lock_staleness {
                        *global = None;
                    }
                }
                let mut queue = self.global_queue.lock().await;
                let is_head = queue
                    .iter()
                    .min_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)))
                    .map(|head| head.seq == ticket.seq)
                    .unwrap_or(true);
                if global.is_none() && is_head {
                    *global = Some(GlobalLockEntry {
                        holder,
                        acquired_at: now,
                    });
                    queue.retain(|t| t.seq != seq);
                    return;
                }
            }
            tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
        }
    }

    pub async fn release_global_lock(&self, holder: LockHolder) {
        let mut global = self.global_lock.lock().await;
        if global.as_ref().is_some_and(|e| e.holder.0 == holder.0) {
            *global = None;
        }
    }

    /// Administrative override: drops the global lock regardless of holder.
    pub async fn force_release_global_lock(&self) {
        *self.global_lock.lock().await = None;
    }

    pub async fn global_lock_holder(&self) -> Option<LockHolder> {
        self.global_lock.lock().await.as_ref().map(|e| e.holder)
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    key: OrderKey,
    order: ActiveOrder,
}

/// Tracks in-flight orders keyed by `(venue, symbol, side)`, evicts orders
/// that have gone stale without a terminal status, and retains a bounded
/// history of terminal orders for post-mortems.
pub struct OrderRegistry {
    active: Mutex<HashMap<String, ActiveOrder>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    order_staleness: Duration,
}

fn order_map_key(key: &OrderKey) -> String {
    format!("{}_{}_{:?}", key.venue, key.symbol, key.side)
}

impl OrderRegistry {
    pub fn new(config: &KeeperConfig) -> Self {
        OrderRegistry {
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            cooldowns: Mutex::new(HashMap::new()),
            order_staleness: Duration::from_millis(config.order_timeout_ms),
        }
    }

    /// Registers a newly placed order, refusing to overwrite a live entry at
    /// the same `(venue, symbol, side)` key. Returns `false` without
    /// mutating state if an entry already occupies the key and it isn't
    /// stale yet — the primary defence against duplicate-order races from a
    /// retried or re-entrant placement. A stale prior entry is evicted (with
    /// a warning) and replaced.
    pub async fn register(&self, order: ActiveOrder) -> bool {
        let key = order_map_key(&order.key());
        let now = Instant::now();
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(&key) {
            if now.saturating_duration_since(existing.placed_at) < self.order_staleness {
                return false;
            }
            eprintln!(
                "registry: evicting stale active order {} at key {key} to register {}",
                existing.order_id, order.order_id
            );
        }
        active.insert(key, order);
        true
    }

    pub async fn get(&self, key: &OrderKey) -> Option<ActiveOrder> {
        self.active.lock().await.get(&order_map_key(key)).cloned()
    }

    /// Applies a fill/status update. Terminal statuses move the order out of
    /// the active map and into the bounded history ring.
    pub async fn update_status(
        &self,
        key: &OrderKey,
        report: OrderStatusReport,
    ) -> Option<ActiveOrder> {
        let map_key = order_map_key(key);
        let mut active = self.active.lock().await;
        let Some(order) = active.get_mut(&map_key) else {
            return None;
        };
        order.status = report.status;
        if let Some(size) = report.filled_size {
            order.size = Some(size);
        }
        if let Some(price) = report.avg_fill_price {
            order.price = Some(price);
        }
        let updated = order.clone();
        if updated.status.is_terminal() {
            active.remove(&map_key);
            drop(active);
            self.push_history(key.clone(), updated.clone()).await;
        }
        Some(updated)
    }

    async fn push_history(&self, key: OrderKey, order: ActiveOrder) {
        let mut history = self.history.lock().await;
        history.push_back(HistoryEntry { key, order });
        if history.len() > ORDER_HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    /// Evicts orders whose `placed_at` predates the configured staleness
    /// threshold without reaching a terminal status, returning the evicted
    /// keys so callers can alert/reconcile.
    pub async fn evict_stale(&self) -> Vec<OrderKey> {
        let now = Instant::now();
        let mut active = self.active.lock().await;
        let stale_keys: Vec<String> = active
            .iter()
            .filter(|(_, o)| now.saturating_duration_since(o.placed_at) >= self.order_staleness)
            .map(|(k, _)| k.clone())
            .collect();
        let mut evicted = Vec::new();
        for map_key in stale_keys {
            if let Some(order) = active.remove(&map_key) {
                evicted.push(order.key());
            }
        }
        evicted
    }

    pub async fn history(&self) -> Vec<ActiveOrder> {
        self.history
            .lock()
            .await
            .iter()
            .map(|e| e.order.clone())
            .collect()
    }

    /// Marks a symbol's last execution as just-completed, starting a
    /// one-hour cooldown before the evaluator may pick it again.
    pub async fn mark_execution_completed(&self, symbol: &str) {
        self.cooldowns
            .lock()
            .await
            .insert(symbol.to_string(), Instant::now());
    }

    pub async fn is_on_cooldown(&self, symbol: &str) -> bool {
        let now = Instant::now();
        self.cooldowns
            .lock()
            .await
            .get(symbol)
            .is_some_and(|at| now.saturating_duration_since(*at) < COOLDOWN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Exchange, Side, Symbol};

    fn cfg() -> KeeperConfig {
        KeeperConfig::default()
    }

    const SYMBOL_LOCK_STALENESS: Duration = Duration::from_millis(30_000);
    const GLOBAL_LOCK_STALENESS: Duration = Duration::from_millis(120_000);
    const ORDER_STALENESS: Duration = Duration::from_millis(600_000);

    fn sample_order(symbol: &str, venue: Exchange, holder: u64) -> ActiveOrder {
        ActiveOrder {
            order_id: "o1".into(),
            symbol: Symbol::normalize(symbol),
            venue,
            side: Side::Long,
            owner: LockHolder::new(holder),
            placed_at: Instant::now(),
            status: OrderStatus::Placed,
            size: Some(1.0),
            price: Some(100.0),
            reduce_only: false,
            initial_position_size: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn symbol_lock_excludes_second_holder_until_stale() {
        let reg = LockRegistry::new(&cfg());
        assert!(reg.try_acquire_symbol_lock("BTC", LockHolder::new(1)).await);
        assert!(!reg.try_acquire_symbol_lock("BTC", LockHolder::new(2)).await);
        tokio::time::advance(SYMBOL_LOCK_STALENESS + Duration::from_millis(1)).await;
        assert!(reg.try_acquire_symbol_lock("BTC", LockHolder::new(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_symbol_lock_allows_reacquire() {
        let reg = LockRegistry::new(&cfg());
        reg.try_acquire_symbol_lock("BTC", LockHolder::new(1)).await;
        reg.release_symbol_lock("BTC", LockHolder::new(1)).await;
        assert!(reg.try_acquire_symbol_lock("BTC", LockHolder::new(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn global_lock_serializes_holders() {
        let reg = LockRegistry::new(&cfg());
        reg.acquire_global_lock(LockHolder::new(1), LockPriority::Normal)
            .await;
        assert_eq!(reg.global_lock_holder().await, Some(LockHolder::new(1)));
        reg.release_global_lock(LockHolder::new(1)).await;
        reg.acquire_global_lock(LockHolder::new(2), LockPriority::Normal)
            .await;
        assert_eq!(reg.global_lock_holder().await, Some(LockHolder::new(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn global_lock_auto_releases_after_staleness() {
        let reg = LockRegistry::new(&cfg());
        reg.acquire_global_lock(LockHolder::new(1), LockPriority::Normal)
            .await;
        tokio::time::advance(GLOBAL_LOCK_STALENESS + Duration::from_millis(1)).await;
        reg.acquire_global_lock(LockHolder::new(2), LockPriority::Normal)
            .await;
        assert_eq!(reg.global_lock_holder().await, Some(LockHolder::new(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn force_release_clears_the_global_lock_regardless_of_holder() {
        let reg = LockRegistry::new(&cfg());
        reg.acquire_global_lock(LockHolder::new(1), LockPriority::Normal)
            .await;
        reg.force_release_global_lock().await;
        assert_eq!(reg.global_lock_holder().await, None);
        reg.acquire_global_lock(LockHolder::new(2), LockPriority::Normal)
            .await;
        assert_eq!(reg.global_lock_holder().await, Some(LockHolder::new(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_update_moves_order_to_history() {
        let reg = OrderRegistry::new(&cfg());
        let order = sample_order("BTC-PERP", Exchange::Alpha, 1);
        let key = order.key();
        reg.register(order).await;
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
        let history = reg.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, OrderStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn registering_twice_at_the_same_key_within_staleness_returns_false() {
        let reg = OrderRegistry::new(&cfg());
        let first = sample_order("BTC-PERP", Exchange::Alpha, 1);
        let key = first.key();
        assert!(reg.register(first).await);

        let second = sample_order("BTC-PERP", Exchange::Alpha, 2);
        assert!(!reg.register(second).await);
        // The original entry survives untouched.
        assert_eq!(reg.get(&key).await.unwrap().owner, LockHolder::new(1));

        tokio::time::advance(ORDER_STALENESS + Duration::from_millis(1)).await;
        let third = sample_order("BTC-PERP", Exchange::Alpha, 3);
        assert!(reg.register(third).await);
        assert_eq!(reg.get(&key).await.unwrap().owner, LockHolder::new(3));
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_stale_non_terminal_orders() {
        let reg = OrderRegistry::new(&cfg());
        let order = sample_order("ETH-PERP", Exchange::Alpha, 1);
        let key = order.key();
        reg.register(order).await;
        tokio::time::advance(ORDER_STALENESS + Duration::from_millis(1)).await;
        let evicted = reg.evict_stale().await;
        assert_eq!(evicted.len(), 1);
        assert!(reg.get(&key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_expires_after_one_hour() {
        let reg = OrderRegistry::new(&cfg());
        reg.mark_execution_completed("BTC").await;
        assert!(reg.is_on_cooldown("BTC").await);
        tokio::time::advance(COOLDOWN_TTL + Duration::from_millis(1)).await;
        assert!(!reg.is_on_cooldown("BTC").await);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let reg = OrderRegistry::new(&cfg());
        for i in 0..(ORDER_HISTORY_CAPACITY as u64 + 10) {
            let order = sample_order(&format!("SYM{i}"), Exchange::Mock((i % 255) as u8), i);
            let key = order.key();
            reg.register(order).await;
            reg.update_status(
                &key,
                OrderStatusReport {
                    status: OrderStatus::Filled,
                    filled_size: Some(1.0),
                    avg_fill_price: Some(1.0),
                },
            )
            .await;
        }
        assert_eq!(reg.history().await.len(), ORDER_HISTORY_CAPACITY);
    }
}
