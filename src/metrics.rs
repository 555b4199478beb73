//! # Metrics Engine
//!
//! Per-provider request accounting: monotonic counters, a bounded ring of
//! recent successful latencies, time windows of recent errors and attempts,
//! and a derived health classification that drives routing.
//!
//! Counter reads are lock-free atomics; the rings sit behind a per-provider
//! mutex taken only by mutations and by [`ProviderMetrics::snapshot`].
//! Records are created by the router at provider registration and live until
//! the router is torn down; they are never shared across routers.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Capacity of the successful-latency ring.
const LATENCY_RING_CAPACITY: usize = 100;

/// Width of the recent-error and recent-attempt windows.
const RECENT_WINDOW: Duration = Duration::from_secs(60);

/// Below this many total requests the record is optimistically healthy and
/// the error rate is conventionally zero.
const MIN_SAMPLE_SIZE: u64 = 5;

/// Success count required before the latency-degradation rule applies.
const LATENCY_RULE_MIN_SUCCESSES: u64 = 20;

/// Derived health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Value exported on the `llm_provider_health` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-capacity ring of the most recent successful latencies.
///
/// Pre-allocated so the hot path never touches the heap.
struct LatencyRing {
    slots: [f64; LATENCY_RING_CAPACITY],
    len: usize,
    next: usize,
}

impl LatencyRing {
    fn new() -> Self {
        Self {
            slots: [0.0; LATENCY_RING_CAPACITY],
            len: 0,
            next: 0,
        }
    }

    fn push(&mut self, latency_ms: f64) {
        self.slots[self.next] = latency_ms;
        self.next = (self.next + 1) % LATENCY_RING_CAPACITY;
        if self.len < LATENCY_RING_CAPACITY {
            self.len += 1;
        }
    }

    fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.slots[..self.len].iter().sum::<f64>() / self.len as f64
    }
}

/// Timestamps within the last [`RECENT_WINDOW`], compacted lazily.
struct TimeWindow {
    stamps: VecDeque<Instant>,
}

impl TimeWindow {
    fn new() -> Self {
        Self {
            stamps: VecDeque::with_capacity(64),
        }
    }

    fn record(&mut self, now: Instant) {
        self.prune(now);
        self.stamps.push_back(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.duration_since(*front) > RECENT_WINDOW {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }
}

struct Rings {
    cost_rub: f64,
    latencies: LatencyRing,
    errors: TimeWindow,
    attempts: TimeWindow,
}

/// Mutable per-provider metrics record.
///
/// Invariant: `total == success + failure` at all times outside an in-flight
/// update.
pub struct ProviderMetrics {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    /// Sum of successful-attempt latencies; failures are excluded so the
    /// average stays denominated in successes.
    total_latency_ms: AtomicU64,
    rings: Mutex<Rings>,
}

impl ProviderMetrics {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            rings: Mutex::new(Rings {
                cost_rub: 0.0,
                latencies: LatencyRing::new(),
                errors: TimeWindow::new(),
                attempts: TimeWindow::new(),
            }),
        }
    }

    /// Record a successful attempt.
    pub fn record_success(
        &self,
        latency_ms: u64,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_rub: f64,
    ) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.success.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(completion_tokens, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let now = Instant::now();
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.cost_rub += cost_rub;
        rings.latencies.push(latency_ms as f64);
        rings.attempts.record(now);
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, _latency_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failure.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.errors.record(now);
        rings.attempts.record(now);
    }

    /// Point-in-time snapshot with all derived fields resolved.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let failure = self.failure.load(Ordering::Relaxed);
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        let total_latency_ms = self.total_latency_ms.load(Ordering::Relaxed);

        let now = Instant::now();
        let (cost_rub, rolling_avg_latency_ms, recent_errors, recent_attempts) = {
            let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
            let errors = rings.errors.len(now);
            let attempts = rings.attempts.len(now);
            (rings.cost_rub, rings.latencies.mean(), errors, attempts)
        };

        let avg_latency_ms = total_latency_ms as f64 / success.max(1) as f64;
        let recent_error_rate = if total < MIN_SAMPLE_SIZE {
            0.0
        } else {
            recent_errors as f64 / recent_attempts.max(1) as f64
        };

        let health = if total < MIN_SAMPLE_SIZE {
            HealthStatus::Healthy
        } else if recent_error_rate >= 0.6 {
            HealthStatus::Unhealthy
        } else if recent_error_rate >= 0.3 {
            HealthStatus::Degraded
        } else if success >= LATENCY_RULE_MIN_SUCCESSES
            && rolling_avg_latency_ms > 2.0 * avg_latency_ms
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        MetricsSnapshot {
            total,
            success,
            failure,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_rub,
            avg_latency_ms,
            rolling_avg_latency_ms,
            recent_error_rate,
            health,
        }
    }
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of a provider's metrics at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_rub: f64,
    pub avg_latency_ms: f64,
    pub rolling_avg_latency_ms: f64,
    pub recent_error_rate: f64,
    pub health: HealthStatus,
}

impl MetricsSnapshot {
    /// Latency figure used for best-available selection: the rolling average
    /// when the ring has samples, the cumulative average otherwise, zero for
    /// a provider that has not succeeded yet.
    pub fn effective_latency_ms(&self) -> f64 {
        if self.rolling_avg_latency_ms > 0.0 {
            self.rolling_avg_latency_ms
        } else if self.success > 0 {
            self.avg_latency_ms
        } else {
            0.0
        }
    }
}
