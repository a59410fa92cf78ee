use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use warden_types::{Result, WardenError};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Attempts are allowed.
    Closed,
    /// Too many attempts inside the window. Everything is refused until it elapses.
    Open,
    /// Window elapsed after tripping. One probe attempt is allowed.
    HalfOpen,
}

/// Sliding-window attempt limiter.
///
/// Attempts older than `window` are forgotten. The attempt that pushes the
/// count past `threshold` trips the breaker open.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitBreakerState,
    pub threshold: usize,
    pub window: Duration,
    attempts: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            threshold,
            window,
            attempts: VecDeque::new(),
            opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.attempts.front() {
            if now.duration_since(*front) > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an attempt at `now`. Returns the resulting state. In HalfOpen
    /// only one attempt is let through; a second one re-trips.
    pub fn record_attempt(&mut self, now: Instant) -> CircuitBreakerState {
        self.check_cooldown(now);
        if self.state == CircuitBreakerState::Open {
            return self.state;
        }
        self.prune(now);
        let probe_failed = self.state == CircuitBreakerState::HalfOpen && !self.attempts.is_empty();
        self.attempts.push_back(now);
        if probe_failed || self.attempts.len() > self.threshold {
            self.state = CircuitBreakerState::Open;
            self.opened_at = Some(now);
        }
        self.state
    }

    /// Move from Open to HalfOpen once a full window has passed since tripping.
    pub fn check_cooldown(&mut self, now: Instant) {
        if self.state != CircuitBreakerState::Open {
            return;
        }
        if let Some(opened) = self.opened_at {
            if now.duration_since(opened) >= self.window {
                self.state = CircuitBreakerState::HalfOpen;
                self.attempts.clear();
                self.opened_at = None;
            }
        }
    }

    /// A probe after HalfOpen succeeded.
    pub fn record_success(&mut self) {
        if self.state == CircuitBreakerState::HalfOpen {
            self.state = CircuitBreakerState::Closed;
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(
            self.state,
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen
        )
    }

    pub fn attempts_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.attempts.len()
    }

    pub fn reset(&mut self) {
        self.state = CircuitBreakerState::Closed;
        self.attempts.clear();
        self.opened_at = None;
    }
}

/// Outcome of recording an attempt through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub state: CircuitBreakerState,
    pub attempts_in_window: usize,
    /// This attempt is the one that tripped the breaker.
    pub tripped: bool,
}

/// Circuit breakers keyed by name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    default_threshold: usize,
    default_window: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(default_threshold: usize, default_window: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            default_threshold,
            default_window,
        }
    }

    pub fn get_or_create(&self, key: &str) -> CircuitBreaker {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_threshold, self.default_window))
            .clone()
    }

    pub fn record_attempt(&self, key: &str) -> AttemptOutcome {
        let now = Instant::now();
        let mut entry = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_threshold, self.default_window));
        let was_open = entry.state == CircuitBreakerState::Open;
        let state = entry.record_attempt(now);
        AttemptOutcome {
            state,
            attempts_in_window: entry.attempts_in_window(now),
            tripped: !was_open && state == CircuitBreakerState::Open,
        }
    }

    pub fn record_success(&self, key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.record_success();
        }
    }

    /// Err(CircuitOpen) while the breaker for `key` refuses attempts.
    pub fn check(&self, key: &str) -> Result<()> {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.check_cooldown(Instant::now());
            if !breaker.is_allowed() {
                return Err(WardenError::CircuitOpen(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn state(&self, key: &str) -> CircuitBreakerState {
        match self.breakers.get_mut(key) {
            Some(mut breaker) => {
                breaker.check_cooldown(Instant::now());
                breaker.state
            }
            None => CircuitBreakerState::Closed,
        }
    }

    pub fn attempts_in_window(&self, key: &str) -> usize {
        self.breakers
            .get_mut(key)
            .map(|mut b| b.attempts_in_window(Instant::now()))
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(key) {
            breaker.reset();
        }
    }
}
