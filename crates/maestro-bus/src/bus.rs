use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use maestro_core::{BreakerPolicy, EngineError, Event, EventId, EventType};
use maestro_telemetry::{MetricsSink, NoopMetrics};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::handler::EventHandler;
use crate::registry::{SubscriberRegistry, Subscription};

/// Outcome of a publish that the breaker admitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub event_id: EventId,
    pub event_type: EventType,
    pub delivered: usize,
    pub failed: usize,
    /// The failing share crossed the policy ratio and counted against the breaker.
    pub channel_failure: bool,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BusMetrics {
    pub breaker: BreakerSnapshot,
    pub published: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub subscribers: usize,
    pub in_flight: usize,
    pub latency: LatencySummary,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
}

#[derive(Default)]
struct LatencyStats {
    count: u64,
    total_ms: f64,
    max_ms: f64,
    last_ms: f64,
}

/// Typed publish/subscribe channel.
pub struct EventBus {
    registry: RwLock<SubscriberRegistry>,
    breaker: CircuitBreaker,
    handler_timeout: Duration,
    handler_failure_ratio: f64,
    counters: Counters,
    latency: Mutex<LatencyStats>,
    in_flight: AtomicUsize,
    idle: Notify,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &*self.registry.read())
            .field("breaker", &self.breaker.state())
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Tracks one admitted publish; releases an unfinished probe when dropped.
struct InFlight<'a> {
    bus: &'a EventBus,
    admission: Admission,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn enter(bus: &'a EventBus, admission: Admission) -> Self {
        let _ = bus.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            bus,
            admission,
            finished: false,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished && self.admission == Admission::Probe {
            self.bus.breaker.release_probe();
        }
        if self.bus.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.bus.idle.notify_waiters();
        }
    }
}

impl EventBus {
    pub fn new(policy: &BreakerPolicy) -> Self {
        Self {
            registry: RwLock::new(SubscriberRegistry::new()),
            breaker: CircuitBreaker::new(policy),
            handler_timeout: policy.handler_timeout(),
            handler_failure_ratio: policy.handler_failure_ratio,
            counters: Counters::default(),
            latency: Mutex::new(LatencyStats::default()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            sink: Arc::new(NoopMetrics),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Subscription {
        debug!(event_type = event_type.as_str(), handler = handler.name(), "subscribed");
        self.registry.write().insert(event_type, handler)
    }

    /// Register one handler for several event types.
    pub fn subscribe_many(
        &self,
        event_types: &[EventType],
        handler: &Arc<dyn EventHandler>,
    ) -> Vec<Subscription> {
        let mut registry = self.registry.write();
        event_types
            .iter()
            .map(|ty| registry.insert(*ty, Arc::clone(handler)))
            .collect()
    }

    /// Remove exactly one registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.registry.write().remove(subscription)
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.registry.read().count(event_type)
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every handler subscribed to its type.
    ///
    /// Fails fast with `ChannelUnavailable` while the breaker is open. Handler
    /// failures never surface as errors; they are counted in the report and,
    /// past the configured ratio, against the breaker.
    #[instrument(skip_all, fields(event_type = event.event_type().as_str(), event_id = %event.id))]
    pub async fn publish(&self, event: Event) -> Result<PublishReport, EngineError> {
        let event_type = event.event_type();
        let admission = match self.breaker.try_acquire() {
            Ok(admission) => admission,
            Err(retry_after) => {
                let _ = self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.sink.counter("bus.publish", &[("outcome", "rejected")], 1);
                debug!(?retry_after, "publish rejected, breaker open");
                return Err(EngineError::ChannelUnavailable { retry_after });
            }
        };
        let mut guard = InFlight::enter(self, admission);
        let _ = self.counters.published.fetch_add(1, Ordering::Relaxed);

        let handlers = self.registry.read().handlers_for(event_type);
        let started = Instant::now();
        let outcomes = join_all(
            handlers
                .iter()
                .map(|handler| invoke(handler.as_ref(), &event, self.handler_timeout)),
        )
        .await;

        let total = outcomes.len();
        let failed = outcomes.iter().filter(|ok| !**ok).count();
        let channel_failure = total > 0 && (failed as f64 / total as f64) > self.handler_failure_ratio;

        if channel_failure {
            self.breaker.record_failure(admission);
            let _ = self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.sink.counter("bus.publish", &[("outcome", "failed")], 1);
        } else {
            self.breaker.record_success(admission);
            let _ = self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            self.sink.counter("bus.publish", &[("outcome", "ok")], 1);
        }
        guard.finished = true;

        let _ = self
            .counters
            .handler_invocations
            .fetch_add(total as u64, Ordering::Relaxed);
        let _ = self
            .counters
            .handler_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record_latency(elapsed_ms);
        self.sink
            .timing("bus.publish.latency_ms", &[("event_type", event_type.as_str())], elapsed_ms);

        Ok(PublishReport {
            event_id: event.id,
            event_type,
            delivered: total - failed,
            failed,
            channel_failure,
        })
    }

    fn record_latency(&self, ms: f64) {
        let mut stats = self.latency.lock();
        stats.count += 1;
        stats.total_ms += ms;
        stats.max_ms = stats.max_ms.max(ms);
        stats.last_ms = ms;
    }

    /// Snapshot of channel health. Never mutates breaker state.
    pub fn get_metrics(&self) -> BusMetrics {
        let latency = {
            let stats = self.latency.lock();
            LatencySummary {
                count: stats.count,
                mean_ms: if stats.count == 0 {
                    0.0
                } else {
                    stats.total_ms / stats.count as f64
                },
                max_ms: stats.max_ms,
                last_ms: stats.last_ms,
            }
        };
        BusMetrics {
            breaker: self.breaker.snapshot(),
            published: self.counters.published.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            handler_invocations: self.counters.handler_invocations.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            subscribers: self.registry.read().total(),
            in_flight: self.in_flight(),
            latency,
        }
    }

    /// Wait until no publish is in flight.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// [`drain`](Self::drain) bounded by `timeout`. Returns `false` on timeout.
    pub async fn drain_with_timeout(&self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.drain()).await.is_ok() {
            true
        } else {
            warn!(
                in_flight = self.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "event bus drain timed out"
            );
            false
        }
    }
}

/// Run one handler under a timeout and a panic guard. Returns success.
async fn invoke(handler: &dyn EventHandler, event: &Event, timeout: Duration) -> bool {
    let fut = std::panic::AssertUnwindSafe(handler.handle(event)).catch_unwind();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            warn!(handler = handler.name(), error = %e, "event handler failed");
            false
        }
        Ok(Err(_panic)) => {
            warn!(handler = handler.name(), "event handler panicked");
            false
        }
        Err(_timeout) => {
            warn!(
                handler = handler.name(),
                timeout_ms = timeout.as_millis() as u64,
                "event handler timed out"
            );
            false
        }
    }
}
