// 🔌 Circuit Breaker - stop hammering a degraded upstream
//
// Closed --(failure ratio over the rolling window)--> Open
// Open   --(cooldown elapsed)--> HalfOpen (exactly one trial call)
// HalfOpen --trial ok--> Closed   |   --trial failed--> Open, cooldown doubled (capped)

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Trip when failures / calls in the window reaches this ratio
    pub failure_ratio: f64,

    /// Minimum outcomes in the window before the ratio is trusted
    pub min_calls: usize,

    /// Rolling window length
    pub window: Duration,

    /// First cooldown after tripping
    pub cooldown: Duration,

    /// Cap for the doubled cooldown after failed trials
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_ratio: 0.5,
            min_calls: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Admission ticket for one call, tied to the trip it was granted under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
    trial: bool,
}

impl Permit {
    /// The single call admitted while half-open
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

struct BreakerInner {
    state: BreakerState,
    /// (when, succeeded)
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    trips: u64,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.outcomes.front() {
            if now.duration_since(at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
        self.outcomes.clear();
        self.trips += 1;
    }

    /// Outcomes of calls admitted before the latest trip are stale
    fn admits(&self, permit: Permit) -> bool {
        permit.generation == self.trips
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened) => (opened + self.cooldown).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                cooldown,
                trial_in_flight: false,
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission for one call. `Err(retry_in)` means fail fast, no I/O.
    ///
    /// The permit must be handed back to `record_success`, `record_failure`
    /// or `abandon`.
    pub fn try_acquire(&self) -> Result<Permit, Duration> {
        let mut inner = self.lock();
        let now = Instant::now();
        let generation = inner.trips;

        match inner.state {
            BreakerState::Closed => Ok(Permit {
                generation,
                trial: false,
            }),
            BreakerState::Open => {
                let remaining = inner.remaining_cooldown(now);
                if remaining.is_zero() {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    log::info!("circuit half-open: admitting one trial call");
                    Ok(Permit {
                        generation,
                        trial: true,
                    })
                } else {
                    Err(remaining)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(inner.cooldown)
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit {
                        generation,
                        trial: true,
                    })
                }
            }
        }
    }

    /// The permitted call never reached the network (e.g. rate limited)
    pub fn abandon(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit.trial && inner.admits(permit) && inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.lock();
        if !inner.admits(permit) {
            log::debug!("ignoring success from before the last trip");
            return;
        }
        let now = Instant::now();

        match inner.state {
            BreakerState::HalfOpen if permit.trial => {
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.outcomes.clear();
                inner.cooldown = self.config.cooldown;
                log::info!("circuit closed: trial call succeeded");
            }
            BreakerState::Closed => {
                inner.outcomes.push_back((now, true));
                inner.prune(now, self.config.window);
            }
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, permit: Permit) {
        let mut inner = self.lock();
        if !inner.admits(permit) {
            log::debug!("ignoring failure from before the last trip");
            return;
        }
        let now = Instant::now();

        match inner.state {
            BreakerState::HalfOpen if permit.trial => {
                let doubled = inner.cooldown.saturating_mul(2);
                inner.cooldown = doubled.min(self.config.max_cooldown);
                inner.trip(now);
                log::warn!("circuit re-opened: trial call failed, cooldown {:?}", inner.cooldown);
            }
            BreakerState::Closed => {
                inner.outcomes.push_back((now, false));
                inner.prune(now, self.config.window);

                let calls = inner.outcomes.len();
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
                if calls >= self.config.min_calls
                    && failures as f64 / calls as f64 >= self.config.failure_ratio
                {
                    inner.trip(now);
                    log::warn!(
                        "circuit opened: {}/{} calls failed within {:?}, cooling down {:?}",
                        failures,
                        calls,
                        self.config.window,
                        inner.cooldown
                    );
                }
            }
            BreakerState::HalfOpen | BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Current cooldown (grows after failed trials)
    pub fn cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    /// How many times the breaker has opened
    pub fn trips(&self) -> u64 {
        self.lock().trips
    }
}

// ============================================================================
// TESTS
// ============================================================================
