//! Per-server circuit breaking and performance metrics

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of response-time samples kept per server
const RESPONSE_WINDOW: usize = 100;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker for a single back-end server
///
/// Transitions are serialized by the caller (one breaker per server behind a
/// mutex); `can_execute` is the authoritative routing query and performs the
/// OPEN -> HALF_OPEN transition when the cooldown has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,

    failure_count: u32,
    success_count: u32,
    state: CircuitState,
    next_attempt: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            success_threshold,
            failure_count: 0,
            success_count: 0,
            state: CircuitState::Closed,
            next_attempt: None,
        }
    }

    /// Whether a request may be sent to this server right now
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.next_attempt.is_some_and(|at| Instant::now() >= at) {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful request
    pub fn record_success(&mut self) {
        self.failure_count = 0;

        if self.state == CircuitState::HalfOpen {
            self.success_count += 1;
            if self.success_count >= self.success_threshold {
                self.state = CircuitState::Closed;
            }
        }
    }

    /// Record a failed request
    pub fn record_failure(&mut self) {
        self.failure_count += 1;

        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            self.state = CircuitState::Open;
            self.next_attempt = Some(Instant::now() + self.recovery_timeout);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    #[cfg(test)]
    fn force_next_attempt_elapsed(&mut self) {
        self.next_attempt = Some(Instant::now());
    }
}

/// Performance metrics for a single back-end server
#[derive(Debug)]
pub struct ServerMetrics {
    pub active_connections: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    response_times_ms: VecDeque<f64>,
    pub avg_response_time_ms: f64,
    pub last_update: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            active_connections: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            response_times_ms: VecDeque::with_capacity(RESPONSE_WINDOW),
            avg_response_time_ms: 0.0,
            last_update: Instant::now(),
        }
    }
}

impl ServerMetrics {
    /// Record one request outcome with its response time
    pub fn record_request(&mut self, response_time_ms: f64, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        if self.response_times_ms.len() >= RESPONSE_WINDOW {
            self.response_times_ms.pop_front();
        }
        self.response_times_ms.push_back(response_time_ms);

        self.avg_response_time_ms =
            self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64;
        self.last_update = Instant::now();
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }

    /// Load-balancing score in [0, 1]
    ///
    /// score = w_health * success_rate
    ///       + w_latency * 1/(1 + avg_ms/100)
    ///       + w_capacity * 1/(1 + active/10)
    pub fn score(&self) -> f64 {
        self.score_weighted(0.3, 0.4, 0.3)
    }

    pub fn score_weighted(
        &self,
        health_weight: f64,
        latency_weight: f64,
        capacity_weight: f64,
    ) -> f64 {
        let health_score = self.success_rate();

        let latency_score = if self.avg_response_time_ms > 0.0 {
            1.0 / (1.0 + self.avg_response_time_ms / 100.0)
        } else {
            1.0
        };

        let capacity_score = 1.0 / (1.0 + self.active_connections as f64 / 10.0);

        health_weight * health_score
            + latency_weight * latency_score
            + capacity_weight * capacity_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(60), 3)
    }

    #[test]
    fn test_closed_allows_execution() {
        let mut cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_opens_at_failure_threshold() {
        let mut cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let mut cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        cb.force_next_attempt_elapsed();
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        cb.force_next_attempt_elapsed();
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_metrics_ring_window() {
        let mut m = ServerMetrics::default();
        for i in 0..150 {
            m.record_request(i as f64, true);
        }
        assert_eq!(m.total_requests, 150);
        // Only the last 100 samples contribute to the average: 50..149
        let expected = (50..150).sum::<i64>() as f64 / 100.0;
        assert!((m.avg_response_time_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate() {
        let mut m = ServerMetrics::default();
        assert_eq!(m.success_rate(), 1.0);

        m.record_request(10.0, true);
        m.record_request(10.0, true);
        m.record_request(10.0, false);
        m.record_request(10.0, false);
        assert!((m.success_rate() - 0.5).abs() < 1e-9);
        assert!((m.error_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounds() {
        let mut m = ServerMetrics::default();
        // Fresh server with no history scores 1.0
        assert!((m.score() - 1.0).abs() < 1e-9);

        m.active_connections = 1000;
        for _ in 0..10 {
            m.record_request(10_000.0, false);
        }
        let score = m.score();
        assert!(score >= 0.0 && score < 0.1);
    }
}
