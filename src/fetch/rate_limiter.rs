// ⏱️ Rate Limiter - sliding-window ceiling on outbound requests
//
// At most `max_requests` grants fall inside any window of length `per`,
// no matter how many threads are asking. Callers block for a free slot up to
// their own `max_wait`, then give up instead of queueing forever.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Returned when a slot would not free up within the caller's wait budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    /// How long the caller already waited
    pub waited: Duration,
    /// How much longer it would have needed to wait
    pub needed: Duration,
}

pub struct RateLimiter {
    max_requests: usize,
    per: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Default)]
struct LimiterState {
    /// Grant instants still inside the window, oldest first
    grants: VecDeque<Instant>,

    /// Backoff hint from the upstream (429/503); nothing is granted before it
    paused_until: Option<Instant>,
}

impl LimiterState {
    fn prune(&mut self, now: Instant, per: Duration) {
        while let Some(&oldest) = self.grants.front() {
            if oldest + per <= now {
                self.grants.pop_front();
            } else {
                break;
            }
        }
        if matches!(self.paused_until, Some(until) if until <= now) {
            self.paused_until = None;
        }
    }

    /// None when a grant is possible right now, otherwise how long until one might be
    fn wait_needed(&self, now: Instant, max_requests: usize, per: Duration) -> Option<Duration> {
        if let Some(until) = self.paused_until {
            return Some(until - now);
        }
        if self.grants.len() < max_requests {
            return None;
        }
        self.grants
            .front()
            .map(|&oldest| (oldest + per).saturating_duration_since(now))
    }
}

impl RateLimiter {
    /// `max_requests` per `per`; a zero ceiling is bumped to one
    pub fn new(max_requests: usize, per: Duration) -> Self {
        RateLimiter {
            max_requests: max_requests.max(1),
            per,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Requests per second, the way operators configure it
    pub fn per_second(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.per
    }

    /// Block until a request may be dispatched. Returns the grant instant.
    pub fn acquire(&self, max_wait: Duration) -> Result<Instant, RateLimitExceeded> {
        let started = Instant::now();

        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                state.prune(now, self.per);

                match state.wait_needed(now, self.max_requests, self.per) {
                    None => {
                        state.grants.push_back(now);
                        return Ok(now);
                    }
                    Some(wait) => wait,
                }
            };

            let waited = started.elapsed();
            if waited + wait > max_wait {
                return Err(RateLimitExceeded {
                    waited,
                    needed: wait,
                });
            }

            // Another caller may take the slot first; loop and re-check
            thread::sleep(wait.max(Duration::from_millis(1)));
        }
    }

    /// Non-blocking variant of `acquire`
    pub fn try_acquire(&self) -> bool {
        self.acquire(Duration::ZERO).is_ok()
    }

    /// Stop granting for `duration` (upstream asked us to back off)
    pub fn penalize(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let until = Instant::now() + duration;
        state.paused_until = Some(match state.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
