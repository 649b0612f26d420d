use crate::config::{CircuitBreakerConfig, GatewayConfig};
use crate::domain::circuit::{CircuitBreakerState, CircuitState};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Permission to call a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single trial call allowed while half-open.
    Probe,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    consecutive_trips: u32,
    probe_in_flight: bool,
}

/// Breaker for one gateway. Reads of `state`/`next_retry_ms` are lock-free;
/// every write holds `inner`.
#[derive(Debug)]
struct GatewayBreaker {
    gateway_id: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    next_retry_ms: AtomicI64,
    inner: Mutex<BreakerInner>,
}

impl GatewayBreaker {
    fn new(gateway_id: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            next_retry_ms: AtomicI64::new(0),
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn publish(&self, state: CircuitState, next_retry_at: Option<DateTime<Utc>>) {
        self.next_retry_ms.store(
            next_retry_at.map(|at| at.timestamp_millis()).unwrap_or(0),
            Ordering::Release,
        );
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn open_error(&self, retry_at: DateTime<Utc>) -> PaymentError {
        PaymentError::CircuitOpen {
            gateway: self.gateway_id.clone(),
            retry_at,
        }
    }

    fn try_acquire(&self, now: DateTime<Utc>) -> Result<Permit> {
        match self.state() {
            CircuitState::Closed => return Ok(Permit::Normal),
            CircuitState::Open => {
                let next_retry_ms = self.next_retry_ms.load(Ordering::Acquire);
                if now.timestamp_millis() < next_retry_ms
                    && let Some(retry_at) = Utc.timestamp_millis_opt(next_retry_ms).single()
                {
                    return Err(self.open_error(retry_at));
                }
            }
            CircuitState::HalfOpen => {}
        }

        let mut inner = self.lock();
        match self.state() {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let retry_at = inner.next_retry_at.unwrap_or(now);
                if now < retry_at {
                    return Err(self.open_error(retry_at));
                }
                inner.probe_in_flight = true;
                self.publish(CircuitState::HalfOpen, inner.next_retry_at);
                info!(gateway = %self.gateway_id, "Circuit half-open, probing gateway");
                Ok(Permit::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    let retry_at =
                        now + chrono::Duration::seconds(self.config.open_seconds as i64);
                    return Err(self.open_error(retry_at));
                }
                inner.probe_in_flight = true;
                Ok(Permit::Probe)
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        if self.state() != CircuitState::Closed {
            inner.consecutive_trips = 0;
            inner.probe_in_flight = false;
            inner.next_retry_at = None;
            self.publish(CircuitState::Closed, None);
            info!(gateway = %self.gateway_id, "Circuit closed");
        }
    }

    fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        match self.state() {
            CircuitState::HalfOpen => {
                inner.consecutive_trips = inner.consecutive_trips.saturating_add(1);
                inner.probe_in_flight = false;
                inner.last_failure_at = Some(now);
                let retry_at = now + self.cooldown(inner.consecutive_trips);
                inner.next_retry_at = Some(retry_at);
                self.publish(CircuitState::Open, Some(retry_at));
                warn!(
                    gateway = %self.gateway_id,
                    trips = inner.consecutive_trips,
                    %retry_at,
                    "Probe failed, circuit re-opened"
                );
            }
            CircuitState::Closed => {
                let window = chrono::Duration::seconds(self.config.failure_window_seconds as i64);
                let within_window = inner
                    .last_failure_at
                    .is_some_and(|last| now - last <= window);
                inner.consecutive_failures = if within_window {
                    inner.consecutive_failures.saturating_add(1)
                } else {
                    1
                };
                inner.last_failure_at = Some(now);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.consecutive_trips = 1;
                    let retry_at = now + self.cooldown(1);
                    inner.next_retry_at = Some(retry_at);
                    self.publish(CircuitState::Open, Some(retry_at));
                    warn!(
                        gateway = %self.gateway_id,
                        failures = inner.consecutive_failures,
                        %retry_at,
                        "Circuit opened"
                    );
                }
            }
            // A call admitted before the trip; the cooldown already runs.
            CircuitState::Open => {
                inner.last_failure_at = Some(now);
            }
        }
    }

    /// `open_seconds * 2^(trips-1)`, capped.
    fn cooldown(&self, trips: u32) -> chrono::Duration {
        let factor = 1u64
            .checked_shl(trips.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let seconds = self
            .config
            .open_seconds
            .saturating_mul(factor)
            .min(self.config.max_open_seconds.max(self.config.open_seconds));
        chrono::Duration::seconds(seconds.min(i64::MAX as u64 / 1000) as i64)
    }

    fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            gateway_id: self.gateway_id.clone(),
            state: self.state(),
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            next_retry_at: inner.next_retry_at,
            consecutive_trips: inner.consecutive_trips,
            probe_in_flight: inner.probe_in_flight,
        }
    }
}

/// Process-wide circuit breakers, one per gateway id.
#[derive(Debug, Default, Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<GatewayBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(gateways: &[GatewayConfig]) -> Self {
        let registry = Self::new();
        for gateway in gateways {
            registry.register(&gateway.id, gateway.circuit_breaker.clone());
        }
        registry
    }

    /// Installs a breaker for `gateway_id`, replacing any previous one.
    pub fn register(&self, gateway_id: &str, config: CircuitBreakerConfig) {
        self.breakers.insert(
            gateway_id.to_string(),
            Arc::new(GatewayBreaker::new(gateway_id, config)),
        );
    }

    fn breaker(&self, gateway_id: &str) -> Arc<GatewayBreaker> {
        if let Some(existing) = self.breakers.get(gateway_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(gateway_id.to_string())
            .or_insert_with(|| {
                Arc::new(GatewayBreaker::new(gateway_id, CircuitBreakerConfig::default()))
            });
        Arc::clone(entry.value())
    }

    /// Asks whether `gateway_id` may be called now.
    ///
    /// Fails with `PaymentError::CircuitOpen` while the breaker is open or its
    /// single half-open probe is already taken.
    pub fn try_acquire(&self, gateway_id: &str, now: DateTime<Utc>) -> Result<Permit> {
        self.breaker(gateway_id).try_acquire(now)
    }

    pub fn record_success(&self, gateway_id: &str) {
        self.breaker(gateway_id).record_success();
    }

    pub fn record_failure(&self, gateway_id: &str, now: DateTime<Utc>) {
        self.breaker(gateway_id).record_failure(now);
    }

    pub fn state(&self, gateway_id: &str) -> CircuitState {
        self.breakers
            .get(gateway_id)
            .map(|b| b.state())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, gateway_id: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(gateway_id).map(|b| b.snapshot())
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let mut all: Vec<CircuitBreakerState> =
            self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        all.sort_by(|a, b| a.gateway_id.cmp(&b.gateway_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        let registry = CircuitBreakerRegistry::new();
        registry.register("orange-money", CircuitBreakerConfig::default());
        registry
    }

    fn trip(registry: &CircuitBreakerRegistry, now: DateTime<Utc>) {
        for _ in 0..5 {
            registry.try_acquire("orange-money", now).unwrap();
            registry.record_failure("orange-money", now);
        }
    }

    #[test]
    fn test_trips_after_threshold_and_fails_fast() {
        let registry = registry();
        let now = Utc::now();
        for _ in 0..4 {
            registry.record_failure("orange-money", now);
        }
        assert_eq!(registry.state("orange-money"), CircuitState::Closed);
        registry.record_failure("orange-money", now);
        assert_eq!(registry.state("orange-money"), CircuitState::Open);

        match registry.try_acquire("orange-money", now + chrono::Duration::seconds(10)) {
            Err(PaymentError::CircuitOpen { gateway, retry_at }) => {
                assert_eq!(gateway, "orange-money");
                assert_eq!(retry_at, now + chrono::Duration::seconds(30));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshots_list_every_gateway_by_id() {
        let registry = registry();
        registry.register("afrimoney", CircuitBreakerConfig::default());
        let now = Utc::now();
        trip(&registry, now);

        let snapshots = registry.snapshots();
        let ids: Vec<_> = snapshots.iter().map(|s| s.gateway_id.as_str()).collect();
        assert_eq!(ids, vec!["afrimoney", "orange-money"]);
        assert_eq!(snapshots[0].state, CircuitState::Closed);
        assert_eq!(snapshots[1].state, CircuitState::Open);
        assert_eq!(snapshots[1].consecutive_trips, 1);
        assert_eq!(snapshots[1].next_retry_at, Some(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let registry = registry();
        let start = Utc::now();
        for i in 0..10 {
            registry.record_failure("orange-money", start + chrono::Duration::seconds(61 * i));
        }
        assert_eq!(registry.state("orange-money"), CircuitState::Closed);
        assert_eq!(
            registry.snapshot("orange-money").unwrap().consecutive_failures,
            1
        );
    }

    #[test]
    fn test_success_resets_failure_count() {
        let registry = registry();
        let now = Utc::now();
        for _ in 0..4 {
            registry.record_failure("orange-money", now);
        }
        registry.record_success("orange-money");
        registry.record_failure("orange-money", now);
        assert_eq!(registry.state("orange-money"), CircuitState::Closed);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let registry = registry();
        let now = Utc::now();
        trip(&registry, now);

        let later = now + chrono::Duration::seconds(30);
        assert_eq!(registry.try_acquire("orange-money", later).unwrap(), Permit::Probe);
        assert_eq!(registry.state("orange-money"), CircuitState::HalfOpen);
        assert!(matches!(
            registry.try_acquire("orange-money", later),
            Err(PaymentError::CircuitOpen { .. })
        ));

        registry.record_success("orange-money");
        assert_eq!(registry.state("orange-money"), CircuitState::Closed);
        assert_eq!(registry.try_acquire("orange-money", later).unwrap(), Permit::Normal);
    }

    #[test]
    fn test_failed_probe_doubles_cooldown() {
        let registry = registry();
        let now = Utc::now();
        trip(&registry, now);

        let probe_at = now + chrono::Duration::seconds(30);
        registry.try_acquire("orange-money", probe_at).unwrap();
        registry.record_failure("orange-money", probe_at);

        let snapshot = registry.snapshot("orange-money").unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_trips, 2);
        assert_eq!(
            snapshot.next_retry_at,
            Some(probe_at + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_cooldown_is_capped() {
        let registry = registry();
        let mut now = Utc::now();
        trip(&registry, now);
        for _ in 0..10 {
            now = registry.snapshot("orange-money").unwrap().next_retry_at.unwrap();
            registry.try_acquire("orange-money", now).unwrap();
            registry.record_failure("orange-money", now);
        }
        let snapshot = registry.snapshot("orange-money").unwrap();
        assert_eq!(
            snapshot.next_retry_at,
            Some(now + chrono::Duration::seconds(600))
        );
    }

    #[test]
    fn test_concurrent_probe_is_exclusive() {
        let registry = registry();
        let now = Utc::now();
        trip(&registry, now);
        let probe_at = now + chrono::Duration::seconds(31);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.try_acquire("orange-money", probe_at))
            })
            .collect();
        let probes = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap().ok())
            .filter(|permit| *permit == Permit::Probe)
            .count();
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_unknown_gateway_gets_default_breaker() {
        let registry = CircuitBreakerRegistry::new();
        assert_eq!(registry.state("ghost"), CircuitState::Closed);
        assert_eq!(registry.try_acquire("ghost", Utc::now()).unwrap(), Permit::Normal);
        assert!(registry.snapshot("ghost").is_some());
    }
}
