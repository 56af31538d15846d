use std::sync::Arc;

use maestro_bus::EventBus;
use maestro_core::{Event, EventPayload};
use maestro_telemetry::MetricsSink;
use tracing::warn;

/// Publishes scheduler events. A refused or failed publish is logged and
/// counted; it never interrupts execution.
#[derive(Clone)]
pub(crate) struct Emitter {
    bus: Arc<EventBus>,
    metrics: Arc<dyn MetricsSink>,
}

impl Emitter {
    pub(crate) fn new(bus: Arc<EventBus>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { bus, metrics }
    }

    pub(crate) fn metrics(&self) -> &dyn MetricsSink {
        self.metrics.as_ref()
    }

    pub(crate) async fn emit(&self, payload: EventPayload) {
        let event_type = payload.event_type();
        if let Err(e) = self.bus.publish(Event::new(payload)).await {
            warn!(
                event_type = event_type.as_str(),
                error = %e,
                error_kind = e.error_kind(),
                retryable = e.is_retryable(),
                "scheduler event dropped"
            );
            self.metrics.counter(
                "scheduler.events.dropped",
                &[("event_type", event_type.as_str()), ("error_kind", e.error_kind())],
                1,
            );
        }
    }

    pub(crate) async fn emit_all(&self, payloads: Vec<EventPayload>) {
        for payload in payloads {
            self.emit(payload).await;
        }
    }
}
