use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Call priority. Ordering matters: `Emergency > High > Normal`, used both for
/// wait-queue ordering and for the wait-time multiplier in §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal,
    High,
    Emergency,
}

impl Priority {
    fn wait_multiplier(self) -> f64 {
        match self {
            Priority::Normal => 1.0,
            Priority::High => 0.8,
            Priority::Emergency => 0.5,
        }
    }
}

/// Per-venue weighted budgets, in request weight, not raw count.
#[derive(Debug, Clone, Copy)]
pub struct VenueLimits {
    pub max_per_second: u32,
    pub max_per_minute: u32,
}

impl Default for VenueLimits {
    fn default() -> Self {
        VenueLimits {
            max_per_second: 10,
            max_per_minute: 300,
        }
    }
}

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const MINUTE_WINDOW: Duration = Duration::from_secs(60);
const SAFETY_BUFFER: Duration = Duration::from_millis(50);
const MINUTE_OVERFLOW_FACTOR: f64 = 1.10;
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(20);

const HIT_RING_CAPACITY: usize = 1000;
const ADMIT_RING_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    at: Instant,
    weight: u32,
}

#[derive(Debug, Clone)]
struct HitEvent {
    at: Instant,
    operation: String,
    waited: Duration,
}

#[derive(Debug, Clone)]
struct AdmitEvent {
    at: Instant,
    operation: String,
    weight: u32,
    queued_wait: Duration,
}

#[derive(Debug, Clone, Copy)]
struct QueueTicket {
    priority: Priority,
    seq: u64,
}

struct VenueState {
    limits: VenueLimits,
    second_window: VecDeque<WindowEntry>,
    minute_window: VecDeque<WindowEntry>,
    wait_queue: Vec<QueueTicket>,
    hits: VecDeque<HitEvent>,
    admits: VecDeque<AdmitEvent>,
}

impl VenueState {
    fn new(limits: VenueLimits) -> Self {
        VenueState {
            limits,
            second_window: VecDeque::new(),
            minute_window: VecDeque::new(),
            wait_queue: Vec::new(),
            hits: VecDeque::new(),
            admits: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .second_window
            .front()
            .is_some_and(|e| now.saturating_duration_since(e.at) >= SECOND_WINDOW)
        {
            self.second_window.pop_front();
        }
        while self
            .minute_window
            .front()
            .is_some_and(|e| now.saturating_duration_since(e.at) >= MINUTE_WINDOW)
        {
            self.minute_window.pop_front();
        }
    }

    fn second_total(&self) -> u32 {
        self.second_window.iter().map(|e| e.weight).sum()
    }

    fn minute_total(&self) -> u32 {
        self.minute_window.iter().map(|e| e.weight).sum()
    }

    fn fits_both(&self, weight: u32) -> bool {
        self.second_total() + weight <= self.limits.max_per_second
            && self.minute_total() + weight <= self.limits.max_per_minute
    }

    /// Emergency admission check: bypasses the per-second window entirely but
    /// still respects 110% of the per-minute budget (§4.1).
    fn fits_emergency(&self, weight: u32) -> bool {
        (self.minute_total() + weight) as f64
            <= self.limits.max_per_minute as f64 * MINUTE_OVERFLOW_FACTOR
    }

    /// Minimum wait until `weight` additional capacity is available in both
    /// windows, via simulated expiry of the oldest entries.
    fn wait_time_for(&self, weight: u32, now: Instant) -> Duration {
        let second_wait = Self::window_wait(&self.second_window, SECOND_WINDOW, self.limits.max_per_second, weight, now);
        let minute_wait = Self::window_wait(&self.minute_window, MINUTE_WINDOW, self.limits.max_per_minute, weight, now);
        second_wait.max(minute_wait)
    }

    fn window_wait(
        entries: &VecDeque<WindowEntry>,
        window: Duration,
        max_weight: u32,
        need: u32,
        now: Instant,
    ) -> Duration {
        let mut total: u32 = entries.iter().map(|e| e.weight).sum();
        if total + need <= max_weight {
            return Duration::ZERO;
        }
        for entry in entries {
            total = total.saturating_sub(entry.weight);
            if total + need <= max_weight {
                let expires_at = entry.at + window;
                return expires_at.saturating_duration_since(now);
            }
        }
        Duration::ZERO
    }

    fn admit(&mut self, now: Instant, weight: u32, operation: &str, queued_wait: Duration) {
        self.second_window.push_back(WindowEntry { at: now, weight });
        self.minute_window.push_back(WindowEntry { at: now, weight });
        self.admits.push_back(AdmitEvent {
            at: now,
            operation: operation.to_string(),
            weight,
            queued_wait,
        });
        if self.admits.len() > ADMIT_RING_CAPACITY {
            self.admits.pop_front();
        }
    }

    fn record_hit(&mut self, now: Instant, operation: &str, waited: Duration) {
        self.hits.push_back(HitEvent {
            at: now,
            operation: operation.to_string(),
            waited,
        });
        if self.hits.len() > HIT_RING_CAPACITY {
            self.hits.pop_front();
        }
    }

    /// Is `seq` the highest-priority, earliest-enqueued ticket in the queue?
    fn is_head(&self, ticket: QueueTicket) -> bool {
        self.wait_queue
            .iter()
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|head| head.seq == ticket.seq)
            .unwrap_or(true)
    }

    fn dequeue(&mut self, seq: u64) {
        self.wait_queue.retain(|t| t.seq != seq);
    }
}

/// Analytics summary for a venue (or the aggregate across venues) over a
/// lookback window (§4.1: "the last 1 h and 24 h").
#[derive(Debug, Clone, Default)]
pub struct RateLimitAnalytics {
    pub total_requests: u64,
    pub hit_count: u64,
    pub hit_rate: f64,
    pub avg_queue_time: Duration,
    pub max_queue_time: Duration,
    pub peak_usage_percent: f64,
    pub per_operation: HashMap<String, u64>,
}

/// Exchange-agnostic sliding-window weighted rate limiter (§4.1).
pub struct RateLimiter {
    venues: Mutex<HashMap<String, VenueState>>,
    defaults: HashMap<String, VenueLimits>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl RateLimiter {
    pub fn new(defaults: HashMap<String, VenueLimits>) -> Self {
        RateLimiter {
            venues: Mutex::new(HashMap::new()),
            defaults,
            next_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn limits_for(&self, venue: &str) -> VenueLimits {
        self.defaults.get(venue).copied().unwrap_or_default()
    }

    fn next_ticket(&self, priority: Priority) -> QueueTicket {
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        QueueTicket { priority, seq }
    }

    /// Blocks until `weight` can be admitted under `venue`'s budget.
    pub async fn acquire(&self, venue: &str, weight: u32, priority: Priority, operation: &str) {
        let is_emergency = priority == Priority::Emergency;
        let ticket = self.next_ticket(priority);
        let start = Instant::now();

        if !is_emergency {
            let mut state = self.venues.lock().await;
            let entry = state
                .entry(venue.to_string())
                .or_insert_with(|| VenueState::new(self.limits_for(venue)));
            entry.wait_queue.push(ticket);
        }

        let mut did_wait = false;
        loop {
            let now = Instant::now();
            let mut state = self.venues.lock().await;
            let entry = state
                .entry(venue.to_string())
                .or_insert_with(|| VenueState::new(self.limits_for(venue)));
            entry.prune(now);

            let can_admit = if is_emergency {
                entry.fits_emergency(weight)
            } else {
                entry.is_head(ticket) && entry.fits_both(weight)
            };

            if can_admit {
                let queued_wait = now.saturating_duration_since(start);
                entry.admit(now, weight, operation, queued_wait);
                if !is_emergency {
                    entry.dequeue(ticket.seq);
                }
                if did_wait {
                    entry.record_hit(now, operation, queued_wait);
                }
                return;
            }

            did_wait = true;
            let capacity_blocked = is_emergency || entry.is_head(ticket);
            let wait = if capacity_blocked {
                let base = entry.wait_time_for(weight, now);
                Duration::from_secs_f64(base.as_secs_f64() * priority.wait_multiplier()) + SAFETY_BUFFER
            } else {
                QUEUE_POLL_INTERVAL
            };
            drop(state);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Non-blocking: admits immediately iff both windows have room right now.
    /// Never queues, never waits.
    pub async fn try_acquire(&self, venue: &str, weight: u32, operation: &str) -> bool {
        let now = Instant::now();
        let mut state = self.venues.lock().await;
        let entry = state
            .entry(venue.to_string())
            .or_insert_with(|| VenueState::new(self.limits_for(venue)));
        entry.prune(now);
        if entry.fits_both(weight) {
            entry.admit(now, weight, operation, Duration::ZERO);
            true
        } else {
            false
        }
    }

    /// On a 429 from the venue, force subsequent callers to wait out the
    /// cooldown by injecting a synthetic future-dated entry sized to the
    /// venue's max (§4.1).
    pub async fn record_external_rate_limit(&self, venue: &str, cooldown: Duration) {
        let mut state = self.venues.lock().await;
        let limits = self.limits_for(venue);
        let entry = state
            .entry(venue.to_string())
            .or_insert_with(|| VenueState::new(limits));
        let future = Instant::now() + cooldown;
        entry.second_window.push_back(WindowEntry {
            at: future,
            weight: limits.max_per_second,
        });
        entry.minute_window.push_back(WindowEntry {
            at: future,
            weight: limits.max_per_minute,
        });
    }

    /// Analytics over the last `lookback`, for one venue.
    pub async fn analytics(&self, venue: &str, lookback: Duration) -> RateLimitAnalytics {
        let now = Instant::now();
        let state = self.venues.lock().await;
        let Some(entry) = state.get(venue) else {
            return RateLimitAnalytics::default();
        };
        Self::summarize(entry, now, lookback)
    }

    /// Analytics aggregated across every venue seen so far.
    pub async fn analytics_all(&self, lookback: Duration) -> RateLimitAnalytics {
        let now = Instant::now();
        let state = self.venues.lock().await;
        let mut agg = RateLimitAnalytics::default();
        let mut queue_times = Vec::new();
        for entry in state.values() {
            let s = Self::summarize(entry, now, lookback);
            agg.total_requests += s.total_requests;
            agg.hit_count += s.hit_count;
            for (op, n) in s.per_operation {
                *agg.per_operation.entry(op).or_insert(0) += n;
            }
            agg.peak_usage_percent = agg.peak_usage_percent.max(s.peak_usage_percent);
            if !s.avg_queue_time.is_zero() {
                queue_times.push(s.avg_queue_time);
            }
            agg.max_queue_time = agg.max_queue_time.max(s.max_queue_time);
        }
        agg.hit_rate = if agg.total_requests > 0 {
            agg.hit_count as f64 / agg.total_requests as f64
        } else {
            0.0
        };
        if !queue_times.is_empty() {
            agg.avg_queue_time =
                queue_times.iter().sum::<Duration>() / queue_times.len() as u32;
        }
        agg
    }

    fn summarize(entry: &VenueState, now: Instant, lookback: Duration) -> RateLimitAnalytics {
        let admits: Vec<&AdmitEvent> = entry
            .admits
            .iter()
            .filter(|e| now.saturating_duration_since(e.at) <= lookback)
            .collect();
        let hits: Vec<&HitEvent> = entry
            .hits
            .iter()
            .filter(|e| now.saturating_duration_since(e.at) <= lookback)
            .collect();

        let total_requests = admits.len() as u64;
        let hit_count = hits.len() as u64;
        let hit_rate = if total_requests > 0 {
            hit_count as f64 / total_requests as f64
        } else {
            0.0
        };

        let mut per_operation: HashMap<String, u64> = HashMap::new();
        for a in &admits {
            *per_operation.entry(a.operation.clone()).or_insert(0) += 1;
        }

        let queue_times: Vec<Duration> = admits.iter().map(|a| a.queued_wait).collect();
        let avg_queue_time = if queue_times.is_empty() {
            Duration::ZERO
        } else {
            queue_times.iter().sum::<Duration>() / queue_times.len() as u32
        };
        let max_queue_time = queue_times.into_iter().max().unwrap_or(Duration::ZERO);

        let second_pct = entry.second_total() as f64 / entry.limits.max_per_second.max(1) as f64;
        let minute_pct = entry.minute_total() as f64 / entry.limits.max_per_minute.max(1) as f64;

        RateLimitAnalytics {
            total_requests,
            hit_count,
            hit_rate,
            avg_queue_time,
            max_queue_time,
            peak_usage_percent: second_pct.max(minute_pct) * 100.0,
            per_operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_per_second: u32, max_per_minute: u32) -> RateLimiter {
        let mut defaults = HashMap::new();
        defaults.insert(
            "alpha".to_string(),
            VenueLimits {
                max_per_second,
                max_per_minute,
            },
        );
        RateLimiter::new(defaults)
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_respects_per_second_budget() {
        let rl = limiter(2, 120);
        assert!(rl.try_acquire("alpha", 1, "order").await);
        assert!(rl.try_acquire("alpha", 1, "order").await);
        assert!(!rl.try_acquire("alpha", 1, "order").await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_window_frees_capacity() {
        let rl = limiter(1, 120);
        rl.acquire("alpha", 1, Priority::Normal, "order").await;
        assert!(!rl.try_acquire("alpha", 1, "order").await);

        let start = Instant::now();
        rl.acquire("alpha", 1, Priority::Normal, "order").await;
        let elapsed = Instant::now().saturating_duration_since(start);
        assert!(elapsed >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_bypasses_second_window() {
        let rl = limiter(1, 120);
        rl.acquire("alpha", 1, Priority::Normal, "order").await;
        // Second window is full, but emergency only checks the 110% minute budget.
        let start = Instant::now();
        rl.acquire("alpha", 1, Priority::Emergency, "close-all").await;
        let elapsed = Instant::now().saturating_duration_since(start);
        assert_eq!(elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_still_bounded_by_minute_overflow() {
        let rl = limiter(1000, 10);
        for _ in 0..11 {
            rl.acquire("alpha", 1, Priority::Emergency, "close-all").await;
        }
        // 11 requests = 110% of 10; the 12th must wait for an entry to expire.
        let start = Instant::now();
        rl.acquire("alpha", 1, Priority::Emergency, "close-all").await;
        let elapsed = Instant::now().saturating_duration_since(start);
        assert!(elapsed > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn record_external_rate_limit_forces_cooldown() {
        let rl = limiter(5, 300);
        rl.record_external_rate_limit("alpha", Duration::from_secs(3))
            .await;
        assert!(!rl.try_acquire("alpha", 1, "order").await);
        tokio::time::advance(Duration::from_millis(1500)).await;
        // Still within the cooldown window.
        assert!(!rl.try_acquire("alpha", 1, "order").await);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(rl.try_acquire("alpha", 1, "order").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_never_exceeds_minute_budget_times_1_1() {
        let rl = limiter(1000, 10);
        for _ in 0..11 {
            rl.acquire("alpha", 1, Priority::Emergency, "x").await;
        }
        let state = rl.venues.lock().await;
        let entry = state.get("alpha").unwrap();
        let total = entry.minute_total();
        assert!((total as f64) <= 10.0 * MINUTE_OVERFLOW_FACTOR);
    }

    #[tokio::test(start_paused = true)]
    async fn analytics_tracks_requests_and_hits() {
        let rl = limiter(1, 120);
        rl.acquire("alpha", 1, Priority::Normal, "order").await;
        // This second acquire has to wait -> counts as a hit.
        rl.acquire("alpha", 1, Priority::Normal, "order").await;
        let stats = rl.analytics("alpha", Duration::from_secs(3600)).await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.hit_count, 1);
        assert!(stats.hit_rate > 0.0);
    }
}
