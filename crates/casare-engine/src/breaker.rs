//! Circuit breaker per node type
//!
//! Breakers are shared across all runs of one engine instance and keyed by
//! node type, so a systematically failing integration stops being called
//! process-wide. State and stats live behind an async mutex; every update
//! is a short critical section.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

/// Breaker tuning, shared by every node type in the registry
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sliding window length in calls
    pub window: usize,
    /// Failure ratio over the window that opens the circuit
    pub failure_threshold: f64,
    /// Calls required before the ratio is meaningful
    pub min_calls: usize,
    /// Time the circuit stays open before a probe is admitted
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            failure_threshold: 0.5,
            min_calls: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Counters exposed for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub blocked: u64,
    pub times_opened: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    /// One probe is in flight; further calls are blocked
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    window: VecDeque<bool>,
    stats: BreakerStats,
}

/// Circuit breaker for one node type
pub struct CircuitBreaker {
    type_name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(type_name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            type_name: type_name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                stats: BreakerStats::default(),
            }),
        }
    }

    /// Ask to pass a call through.
    ///
    /// Closed admits; Open rejects until the cooldown elapses, at which
    /// point exactly one caller is admitted as the half-open probe.
    pub async fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                inner.stats.blocked += 1;
                Err(EngineError::CircuitOpen {
                    type_name: self.type_name.clone(),
                })
            }
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    log::debug!("breaker '{}' admitting half-open probe", self.type_name);
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    inner.stats.blocked += 1;
                    Err(EngineError::CircuitOpen {
                        type_name: self.type_name.clone(),
                    })
                }
            }
        }
    }

    /// Feed the outcome of an admitted call back into the breaker
    pub async fn record(&self, success: bool) {
        let mut inner = self.inner.lock().await;
        inner.stats.total += 1;
        if success {
            inner.stats.successful += 1;
        } else {
            inner.stats.failed += 1;
        }

        match inner.state {
            BreakerState::HalfOpen => {
                if success {
                    log::info!("breaker '{}' closing after probe success", self.type_name);
                    inner.state = BreakerState::Closed;
                    inner.window.clear();
                } else {
                    log::warn!("breaker '{}' re-opening after probe failure", self.type_name);
                    inner.state = BreakerState::Open {
                        until: Instant::now() + self.config.cooldown,
                    };
                    inner.stats.times_opened += 1;
                }
            }
            BreakerState::Closed => {
                inner.window.push_back(success);
                while inner.window.len() > self.config.window {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.min_calls {
                    let failed = inner.window.iter().filter(|ok| !**ok).count();
                    let ratio = failed as f64 / inner.window.len() as f64;
                    if ratio > self.config.failure_threshold {
                        log::warn!(
                            "breaker '{}' opening (failure ratio {:.2} over {} calls)",
                            self.type_name,
                            ratio,
                            inner.window.len()
                        );
                        inner.state = BreakerState::Open {
                            until: Instant::now() + self.config.cooldown,
                        };
                        inner.stats.times_opened += 1;
                        inner.window.clear();
                    }
                }
            }
            // A late record while open (call admitted before the flip)
            // only updates counters
            BreakerState::Open { .. } => {}
        }
    }

    pub async fn stats(&self) -> BreakerStats {
        self.inner.lock().await.stats
    }

    /// Whether calls are currently admitted
    pub async fn is_closed(&self) -> bool {
        matches!(self.inner.lock().await.state, BreakerState::Closed)
    }
}

/// Breakers keyed by node type, owned by the engine instance.
///
/// A fresh engine starts with fresh breakers; tests reset state by
/// constructing a new engine.
#[derive(Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: SyncMutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: SyncMutex::new(HashMap::new()),
        }
    }

    /// The breaker for a node type, created on first use
    pub fn for_type(&self, type_name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(type_name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(type_name, self.config.clone()))
        }))
    }
}
