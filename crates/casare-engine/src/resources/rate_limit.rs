//! Sliding-window rate limiting for outbound resource traffic
//!
//! Used by resource consumers that must respect a per-target budget
//! (e.g. HTTP calls per host). Limiter state per identifier lives in an
//! LRU map so unbounded key sets cannot grow without limit.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A single sliding-window limiter: at most `budget` hits per `window`.
///
/// The hit queue is bounded at twice the budget, so a burst of rejected
/// probes cannot grow memory.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    budget: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(budget: usize, window: Duration) -> Self {
        Self {
            budget: budget.max(1),
            window,
            hits: VecDeque::new(),
        }
    }

    /// Record an attempt; returns whether it is within budget
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.budget {
            return false;
        }
        if self.hits.len() < self.budget * 2 {
            self.hits.push_back(now);
        }
        true
    }

    /// Hits currently inside the window
    pub fn in_flight(&self) -> usize {
        self.hits.len()
    }
}

/// LRU map of per-identifier limiters (capacity 100)
pub struct RateLimiterMap {
    budget: usize,
    window: Duration,
    capacity: usize,
    limiters: HashMap<String, (Instant, SlidingWindowLimiter)>,
}

impl RateLimiterMap {
    pub fn new(budget: usize, window: Duration) -> Self {
        Self {
            budget,
            window,
            capacity: 100,
            limiters: HashMap::new(),
        }
    }

    /// Record an attempt for `key`, creating its limiter on first use
    pub fn try_acquire(&mut self, key: &str) -> bool {
        let now = Instant::now();
        if !self.limiters.contains_key(key) {
            if self.limiters.len() >= self.capacity {
                // Evict the least recently used identifier
                if let Some(victim) = self
                    .limiters
                    .iter()
                    .min_by_key(|(_, (used, _))| *used)
                    .map(|(k, _)| k.clone())
                {
                    self.limiters.remove(&victim);
                }
            }
            self.limiters.insert(
                key.to_string(),
                (now, SlidingWindowLimiter::new(self.budget, self.window)),
            );
        }
        let entry = match self.limiters.get_mut(key) {
            Some(entry) => entry,
            None => return true,
        };
        entry.0 = now;
        entry.1.try_acquire_at(now)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_enforced() {
        let mut limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_window_expiry() {
        let mut limiter = SlidingWindowLimiter::new(1, Duration::from_millis(10));
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start));
        assert!(limiter.try_acquire_at(start + Duration::from_millis(11)));
    }

    #[test]
    fn test_map_lru_eviction() {
        let mut map = RateLimiterMap::new(1, Duration::from_secs(60));
        map.capacity = 2;
        assert!(map.try_acquire("a"));
        assert!(map.try_acquire("b"));
        assert!(map.try_acquire("c"));
        assert_eq!(map.len(), 2);
        // "a" was least recently used and must have been evicted, so its
        // fresh limiter admits again
        assert!(map.try_acquire("a"));
    }
}
