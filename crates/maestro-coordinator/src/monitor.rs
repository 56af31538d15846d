use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use maestro_bus::{EventBus, EventHandler, HandlerError, Subscription};
use maestro_core::{Event, EventType, WorkflowId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Events buffered per monitor before new ones are dropped.
pub const MONITOR_CAPACITY: usize = 1024;

struct Forwarder {
    name: String,
    workflow_id: WorkflowId,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

#[async_trait]
impl EventHandler for Forwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        if event.workflow_id() != Some(&self.workflow_id) {
            return Ok(());
        }
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    monitor = %self.name,
                    event_type = event.event_type().as_str(),
                    dropped,
                    "monitor buffer full, dropping event"
                );
            }
            // Nobody is watching any more.
            Err(TrySendError::Closed(_)) => {}
        }
        Ok(())
    }
}

/// Stream of one workflow's events. Unsubscribes from the bus when dropped.
///
/// The buffer is bounded; events arriving while it is full are dropped and
/// counted in [`WorkflowMonitor::dropped`].
#[derive(Debug)]
pub struct WorkflowMonitor {
    workflow_id: WorkflowId,
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
    bus: Arc<EventBus>,
    subscriptions: Vec<Subscription>,
}

impl WorkflowMonitor {
    pub(crate) fn attach(bus: Arc<EventBus>, workflow_id: WorkflowId) -> Self {
        Self::attach_with_capacity(bus, workflow_id, MONITOR_CAPACITY)
    }

    pub(crate) fn attach_with_capacity(
        bus: Arc<EventBus>,
        workflow_id: WorkflowId,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let handler: Arc<dyn EventHandler> = Arc::new(Forwarder {
            name: format!("monitor.{workflow_id}"),
            workflow_id: workflow_id.clone(),
            tx,
            dropped: Arc::clone(&dropped),
        });
        let scoped: Vec<EventType> = EventType::ALL
            .into_iter()
            .filter(|ty| ty.is_workflow_scoped())
            .collect();
        let subscriptions = bus.subscribe_many(&scoped, &handler);
        Self {
            workflow_id,
            rx,
            dropped,
            bus,
            subscriptions,
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Events discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Wait for `workflow_completed` or `workflow_failed`.
    pub async fn wait_for_terminal(&mut self) -> Option<Event> {
        while let Some(event) = self.rx.recv().await {
            if matches!(
                event.event_type(),
                EventType::WorkflowCompleted | EventType::WorkflowFailed
            ) {
                return Some(event);
            }
        }
        None
    }

    /// Everything buffered so far.
    pub fn drain_buffered(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
}

impl Drop for WorkflowMonitor {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            let _ = self.bus.unsubscribe(subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::{BreakerPolicy, EventPayload};

    #[tokio::test]
    async fn forwards_only_its_workflow() {
        let bus = Arc::new(EventBus::new(&BreakerPolicy::default()));
        let mut monitor = WorkflowMonitor::attach(Arc::clone(&bus), WorkflowId::from_raw("wf_a"));

        for id in ["wf_b", "wf_a"] {
            let _ = bus
                .publish(Event::new(EventPayload::WorkflowStarted {
                    workflow_id: WorkflowId::from_raw(id),
                }))
                .await
                .unwrap();
        }
        let _ = bus
            .publish(Event::new(EventPayload::WorkflowCompleted {
                workflow_id: WorkflowId::from_raw("wf_a"),
                stages_completed: 1,
                stages_failed: 0,
            }))
            .await
            .unwrap();

        let first = monitor.recv().await.unwrap();
        assert_eq!(first.event_type(), EventType::WorkflowStarted);
        assert_eq!(first.workflow_id().unwrap().as_str(), "wf_a");
        let done = monitor.wait_for_terminal().await.unwrap();
        assert_eq!(done.event_type(), EventType::WorkflowCompleted);
        assert!(monitor.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_buffer_drops_newest_events() {
        let bus = Arc::new(EventBus::new(&BreakerPolicy::default()));
        let mut monitor =
            WorkflowMonitor::attach_with_capacity(Arc::clone(&bus), WorkflowId::from_raw("wf_a"), 2);

        for _ in 0..5 {
            let _ = bus
                .publish(Event::new(EventPayload::WorkflowStarted {
                    workflow_id: WorkflowId::from_raw("wf_a"),
                }))
                .await
                .unwrap();
        }

        assert_eq!(monitor.dropped(), 3);
        assert_eq!(monitor.drain_buffered().len(), 2);
        assert!(monitor.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = Arc::new(EventBus::new(&BreakerPolicy::default()));
        let monitor = WorkflowMonitor::attach(Arc::clone(&bus), WorkflowId::from_raw("wf_a"));
        assert_eq!(bus.subscriber_count(EventType::StageCompleted), 1);
        assert_eq!(bus.subscriber_count(EventType::AgentRegistered), 0);
        drop(monitor);
        assert_eq!(bus.subscriber_count(EventType::StageCompleted), 0);
    }
}
