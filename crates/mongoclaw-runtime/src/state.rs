use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Process-local mutable state shared across dispatcher and workers. Every
/// field is guarded by its own mutex; critical sections are O(1) map work
/// with no I/O.
pub struct RuntimeState {
    dedup: Mutex<DedupCache>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    stream_inflight: Mutex<HashMap<String, u64>>,
    failure_events: Mutex<HashMap<String, VecDeque<Instant>>>,
    quarantine_until: Mutex<HashMap<String, Instant>>,
    pressure_cache: Mutex<HashMap<String, (Instant, f64)>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::with_dedup_capacity(DEFAULT_DEDUP_CAPACITY)
    }

    pub fn with_dedup_capacity(capacity: usize) -> Self {
        Self {
            dedup: Mutex::new(DedupCache::new(capacity)),
            semaphores: Mutex::new(HashMap::new()),
            stream_inflight: Mutex::new(HashMap::new()),
            failure_events: Mutex::new(HashMap::new()),
            quarantine_until: Mutex::new(HashMap::new()),
            pressure_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the key was already present (a duplicate); inserts
    /// otherwise.
    pub fn dedup_check_and_insert(&self, key: &str) -> bool {
        self.dedup.lock().check_and_insert(key)
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.lock().len()
    }

    pub fn clear_dedup(&self) {
        self.dedup.lock().clear();
    }

    /// Per-agent semaphore, created on first use with `permits`.
    pub fn agent_semaphore(&self, agent_id: &str, permits: u32) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock();
        Arc::clone(
            semaphores
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits as usize))),
        )
    }

    pub fn inflight_inc(&self, stream: &str) -> u64 {
        let mut inflight = self.stream_inflight.lock();
        let count = inflight.entry(stream.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn inflight_dec(&self, stream: &str) -> u64 {
        let mut inflight = self.stream_inflight.lock();
        match inflight.get_mut(stream) {
            Some(count) => {
                *count = count.saturating_sub(1);
                let value = *count;
                if value == 0 {
                    inflight.remove(stream);
                }
                value
            }
            None => 0,
        }
    }

    pub fn inflight_count(&self, stream: &str) -> u64 {
        self.stream_inflight.lock().get(stream).copied().unwrap_or(0)
    }

    /// Record a failed execution into the agent's sliding window. Returns
    /// true when this failure exhausted the budget and started a quarantine;
    /// the window is cleared in that case.
    pub fn record_failure(
        &self,
        agent_id: &str,
        window: Duration,
        max_failures: u32,
        quarantine: Duration,
    ) -> bool {
        let now = Instant::now();
        let mut events = self.failure_events.lock();
        let window_events = events.entry(agent_id.to_string()).or_default();
        window_events.push_back(now);
        while let Some(oldest) = window_events.front() {
            if now.duration_since(*oldest) > window {
                window_events.pop_front();
            } else {
                break;
            }
        }
        if window_events.len() >= max_failures as usize {
            window_events.clear();
            self.quarantine_until
                .lock()
                .insert(agent_id.to_string(), now + quarantine);
            true
        } else {
            false
        }
    }

    pub fn is_quarantined(&self, agent_id: &str) -> bool {
        let mut quarantine = self.quarantine_until.lock();
        match quarantine.get(agent_id) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                quarantine.remove(agent_id);
                false
            }
            None => false,
        }
    }

    pub fn quarantine(&self, agent_id: &str, duration: Duration) {
        self.quarantine_until
            .lock()
            .insert(agent_id.to_string(), Instant::now() + duration);
    }

    pub fn pressure_get(&self, stream: &str, ttl: Duration) -> Option<f64> {
        let cache = self.pressure_cache.lock();
        cache.get(stream).and_then(|(sampled_at, fullness)| {
            (sampled_at.elapsed() < ttl).then_some(*fullness)
        })
    }

    pub fn pressure_set(&self, stream: &str, fullness: f64) {
        self.pressure_cache
            .lock()
            .insert(stream.to_string(), (Instant::now(), fullness));
    }
}

/// Bounded LRU set of recently seen idempotency keys.
struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn check_and_insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return true;
        }
        self.seen.insert(key.to_string());
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.seen.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
