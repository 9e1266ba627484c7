//! Per-destination health statistics and the circuit breaker state machine.
//!
//! [`HealthRegistry`] owns one [`DestinationHealth`] per destination URL,
//! created on first use and kept for the process lifetime. Counters are plain
//! atomics; the circuit `(state, last_state_change)` pair sits behind one
//! small mutex so a reader always observes both values from the same
//! transition. No operation in this module performs I/O — probing lives in
//! the health monitor adapter.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::{config::models::CircuitBreakerOptions, metrics};

/// Breaker state guarding a single destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Destination is shed; probes are skipped until the break elapses.
    Open,
    /// Break elapsed; one probe decides the next state.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of the pre-probe circuit gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Issue the probe.
    Proceed,
    /// Circuit is open and the break has not elapsed; report unhealthy
    /// without probing.
    Skip,
}

#[derive(Debug, Clone, Copy)]
struct CircuitStamp {
    state: CircuitState,
    last_state_change: DateTime<Utc>,
}

/// The `(state, last_state_change)` pair. Every write goes through the lock
/// and stamps both fields, so concurrent readers never see values from two
/// different transitions.
#[derive(Debug)]
struct Circuit {
    inner: Mutex<CircuitStamp>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CircuitStamp {
                state: CircuitState::Closed,
                last_state_change: Utc::now(),
            }),
        }
    }

    fn read(&self) -> (CircuitState, DateTime<Utc>) {
        let stamp = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (stamp.state, stamp.last_state_change)
    }

    /// Gate a probe attempt: an open circuit past its break duration flips to
    /// half-open (stamped) and lets the probe through; an open circuit within
    /// the break blocks it.
    fn probe_decision(&self, break_duration: ChronoDuration) -> (ProbeDecision, Option<CircuitState>) {
        let mut stamp = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match stamp.state {
            CircuitState::Closed | CircuitState::HalfOpen => (ProbeDecision::Proceed, None),
            CircuitState::Open => {
                if Utc::now() - stamp.last_state_change > break_duration {
                    stamp.state = CircuitState::HalfOpen;
                    stamp.last_state_change = Utc::now();
                    (ProbeDecision::Proceed, Some(CircuitState::HalfOpen))
                } else {
                    (ProbeDecision::Skip, None)
                }
            }
        }
    }

    /// A recorded success closes a half-open circuit.
    fn on_success(&self) -> Option<CircuitState> {
        let mut stamp = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if stamp.state == CircuitState::HalfOpen {
            stamp.state = CircuitState::Closed;
            stamp.last_state_change = Utc::now();
            Some(CircuitState::Closed)
        } else {
            None
        }
    }

    /// A recorded failure opens the circuit from closed or half-open, but
    /// only when the caller determined the minimum-throughput rule is met.
    fn on_failure(&self, open_eligible: bool) -> Option<CircuitState> {
        if !open_eligible {
            return None;
        }
        let mut stamp = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match stamp.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                stamp.state = CircuitState::Open;
                stamp.last_state_change = Utc::now();
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    #[cfg(test)]
    fn force(&self, state: CircuitState, at: DateTime<Utc>) {
        let mut stamp = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stamp.state = state;
        stamp.last_state_change = at;
    }
}

/// Monotonic request counters plus the fast health flag consulted by the
/// load balancer. `total_requests` is derived from the two outcome counters,
/// which keeps `total == successful + failed` true by construction.
#[derive(Debug)]
pub struct HealthStats {
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    healthy: AtomicBool,
    last_health_check: RwLock<DateTime<Utc>>,
}

impl HealthStats {
    fn new() -> Self {
        Self {
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_health_check: RwLock::new(Utc::now()),
        }
    }

    fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::AcqRel);
        // A single success re-admits the destination to candidacy, whatever
        // the historical rate.
        self.healthy.store(true, Ordering::Release);
        self.stamp();
    }

    /// Returns `(total, success_rate)` as observed after the increment.
    fn record_failure(&self, rate_threshold: f64) -> (u64, f64) {
        self.failed_requests.fetch_add(1, Ordering::AcqRel);
        let successful = self.successful_requests.load(Ordering::Acquire);
        let failed = self.failed_requests.load(Ordering::Acquire);
        let total = successful + failed;
        let rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };
        self.healthy.store(rate >= rate_threshold, Ordering::Release);
        self.stamp();
        (total, rate)
    }

    fn stamp(&self) {
        let mut last = self
            .last_health_check
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *last = Utc::now();
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let successful = self.successful_requests.load(Ordering::Acquire);
        let failed = self.failed_requests.load(Ordering::Acquire);
        let total = successful + failed;
        HealthSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            last_health_check: *self
                .last_health_check
                .read()
                .unwrap_or_else(|e| e.into_inner()),
            is_healthy: self.is_healthy(),
        }
    }
}

/// Point-in-time, serializable view of a destination's stats.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub last_health_check: DateTime<Utc>,
    pub is_healthy: bool,
}

/// Stats + circuit for one destination. Lifetime = process.
#[derive(Debug)]
pub struct DestinationHealth {
    stats: HealthStats,
    circuit: Circuit,
}

impl DestinationHealth {
    fn new() -> Self {
        Self {
            stats: HealthStats::new(),
            circuit: Circuit::new(),
        }
    }

    pub fn stats(&self) -> &HealthStats {
        &self.stats
    }
}

/// Admin-facing pairing of a destination URL with its stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationHealthView {
    pub destination: String,
    pub stats: HealthSnapshot,
}

/// Concurrent map of destination URL to health state. Entries are created on
/// first use and never removed while the process lives.
pub struct HealthRegistry {
    entries: scc::HashMap<String, Arc<DestinationHealth>>,
    options: CircuitBreakerOptions,
    /// Gateway-level toggle. When off, circuits never open and probes are
    /// never gated; stats and the health flag keep working.
    breaker_enabled: bool,
}

impl HealthRegistry {
    pub fn new(options: CircuitBreakerOptions, breaker_enabled: bool) -> Self {
        Self {
            entries: scc::HashMap::new(),
            options,
            breaker_enabled,
        }
    }

    fn entry(&self, destination: &str) -> Arc<DestinationHealth> {
        if let Some(existing) = self.entries.read_sync(destination, |_, v| v.clone()) {
            return existing;
        }
        let fresh = Arc::new(DestinationHealth::new());
        match self.entries.insert_sync(destination.to_string(), fresh.clone()) {
            Ok(()) => fresh,
            // Lost the insert race; the winner's entry is authoritative.
            Err(_) => self
                .entries
                .read_sync(destination, |_, v| v.clone())
                .unwrap_or(fresh),
        }
    }

    /// Record a successful observation (probe 2xx or completed proxy
    /// request). Closes a half-open circuit.
    pub fn record_success(&self, destination: &str) {
        let entry = self.entry(destination);
        entry.stats.record_success();
        if let Some(new_state) = entry.circuit.on_success() {
            tracing::info!(destination, state = new_state.as_str(), "circuit closed");
            metrics::increment_circuit_transition(destination, new_state.as_str());
        }
        metrics::set_destination_health_status(destination, true);
    }

    /// Record a failed observation. Opens the circuit once the destination
    /// has at least `minimum_throughput` observations with a success rate
    /// below the threshold.
    pub fn record_failure(&self, destination: &str) {
        let entry = self.entry(destination);
        let (total, rate) = entry
            .stats
            .record_failure(self.options.failure_rate_threshold);
        let open_eligible = self.breaker_enabled
            && rate < self.options.failure_rate_threshold
            && total >= self.options.minimum_throughput;
        if let Some(new_state) = entry.circuit.on_failure(open_eligible) {
            tracing::warn!(
                destination,
                state = new_state.as_str(),
                success_rate = rate,
                total_requests = total,
                "circuit opened"
            );
            metrics::increment_circuit_transition(destination, new_state.as_str());
        }
        metrics::set_destination_health_status(destination, entry.stats.is_healthy());
    }

    /// The fast flag consulted by the load balancer when filtering
    /// candidates. Untracked destinations count as healthy.
    pub fn is_flagged_healthy(&self, destination: &str) -> bool {
        self.entries
            .read_sync(destination, |_, v| v.stats.is_healthy())
            .unwrap_or(true)
    }

    /// Read-only stats snapshot.
    pub fn snapshot(&self, destination: &str) -> HealthSnapshot {
        self.entry(destination).stats.snapshot()
    }

    /// Consistent read of the circuit pair.
    pub fn circuit(&self, destination: &str) -> (CircuitState, DateTime<Utc>) {
        self.entry(destination).circuit.read()
    }

    /// Gate a probe attempt against the circuit, applying the
    /// open-to-half-open transition when the break has elapsed.
    pub fn probe_decision(&self, destination: &str) -> ProbeDecision {
        if !self.breaker_enabled {
            return ProbeDecision::Proceed;
        }
        let entry = self.entry(destination);
        let break_duration = ChronoDuration::seconds(self.options.break_duration_seconds as i64);
        let (decision, transition) = entry.circuit.probe_decision(break_duration);
        if let Some(new_state) = transition {
            tracing::info!(
                destination,
                state = new_state.as_str(),
                "circuit break elapsed, probing"
            );
            metrics::increment_circuit_transition(destination, new_state.as_str());
        }
        decision
    }

    /// Admin view over all tracked destinations.
    pub fn views(&self) -> Vec<DestinationHealthView> {
        let mut views = Vec::new();
        self.entries.iter_sync(|destination, entry| {
            views.push(DestinationHealthView {
                destination: destination.clone(),
                stats: entry.stats.snapshot(),
            });
            true
        });
        views.sort_by(|a, b| a.destination.cmp(&b.destination));
        views
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn force_circuit(&self, destination: &str, state: CircuitState, at: DateTime<Utc>) {
        self.entry(destination).circuit.force(state, at);
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerOptions::default(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEST: &str = "http://upstream:3000";

    #[test]
    fn test_counters_balance() {
        let registry = HealthRegistry::default();
        for _ in 0..7 {
            registry.record_success(DEST);
        }
        for _ in 0..3 {
            registry.record_failure(DEST);
        }

        let snap = registry.snapshot(DEST);
        assert_eq!(snap.total_requests, 10);
        assert_eq!(snap.successful_requests, 7);
        assert_eq!(snap.failed_requests, 3);
        assert!((snap.success_rate - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_rate_zero_when_untouched() {
        let registry = HealthRegistry::default();
        let snap = registry.snapshot(DEST);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.success_rate, 0.0);
        assert!(snap.is_healthy);
    }

    #[test]
    fn test_single_success_readmits() {
        let registry = HealthRegistry::default();
        for _ in 0..6 {
            registry.record_failure(DEST);
        }
        assert!(!registry.is_flagged_healthy(DEST));

        registry.record_success(DEST);
        // Healthy flag flips on any success even though the rate is 1/7.
        assert!(registry.is_flagged_healthy(DEST));
    }

    #[test]
    fn test_failure_sets_flag_from_rate() {
        let registry = HealthRegistry::default();
        registry.record_success(DEST);
        registry.record_failure(DEST);
        // rate 0.5 >= threshold keeps the flag up
        assert!(registry.is_flagged_healthy(DEST));

        registry.record_failure(DEST);
        // rate 1/3 drops it
        assert!(!registry.is_flagged_healthy(DEST));
    }

    #[test]
    fn test_circuit_stays_closed_below_minimum_throughput() {
        let registry = HealthRegistry::default();
        for _ in 0..9 {
            registry.record_failure(DEST);
        }
        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_at_minimum_throughput() {
        let registry = HealthRegistry::default();
        for _ in 0..10 {
            registry.record_failure(DEST);
        }
        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::Open);
    }

    #[test]
    fn test_open_circuit_skips_probe_within_break() {
        let registry = HealthRegistry::default();
        registry.force_circuit(DEST, CircuitState::Open, Utc::now());
        assert_eq!(registry.probe_decision(DEST), ProbeDecision::Skip);

        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::Open);
    }

    #[test]
    fn test_open_circuit_half_opens_after_break() {
        let registry = HealthRegistry::default();
        registry.force_circuit(
            DEST,
            CircuitState::Open,
            Utc::now() - ChronoDuration::seconds(31),
        );
        assert_eq!(registry.probe_decision(DEST), ProbeDecision::Proceed);

        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let registry = HealthRegistry::default();
        registry.force_circuit(DEST, CircuitState::HalfOpen, Utc::now());
        registry.record_success(DEST);

        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure_with_throughput() {
        let registry = HealthRegistry::default();
        for _ in 0..10 {
            registry.record_failure(DEST);
        }
        registry.force_circuit(DEST, CircuitState::HalfOpen, Utc::now());
        registry.record_failure(DEST);

        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::Open);
    }

    #[test]
    fn test_disabled_breaker_never_opens() {
        let registry = HealthRegistry::new(CircuitBreakerOptions::default(), false);
        for _ in 0..20 {
            registry.record_failure(DEST);
        }
        let (state, _) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::Closed);
        assert_eq!(registry.probe_decision(DEST), ProbeDecision::Proceed);
        // The health flag still tracks the rate for the load balancer.
        assert!(!registry.is_flagged_healthy(DEST));
    }

    #[test]
    fn test_transition_stamps_move_forward() {
        let registry = HealthRegistry::default();
        let past = Utc::now() - ChronoDuration::seconds(60);
        registry.force_circuit(DEST, CircuitState::Open, past);

        registry.probe_decision(DEST);
        let (state, stamped) = registry.circuit(DEST);
        assert_eq!(state, CircuitState::HalfOpen);
        assert!(stamped > past);
    }

    #[test]
    fn test_pair_read_is_consistent_under_contention() {
        use std::sync::Arc as StdArc;

        let registry = StdArc::new(HealthRegistry::default());
        // Prime the entry so every thread works on the same circuit.
        for _ in 0..10 {
            registry.record_failure(DEST);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    registry.record_success(DEST);
                    registry.record_failure(DEST);
                    let (state, stamp) = registry.circuit(DEST);
                    // The pair must always be internally consistent; a torn
                    // read would panic inside the mutex instead.
                    let _ = (state, stamp);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("reader thread panicked");
        }
    }
}
