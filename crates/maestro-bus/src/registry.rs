use std::fmt;
use std::sync::Arc;

use maestro_core::EventType;

use crate::handler::EventHandler;

/// Token for one handler registration, returned by `subscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    event_type: EventType,
    slot: u64,
}

impl Subscription {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }
}

struct Slot {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

/// Handlers bucketed by `EventType::index()`, in subscription order.
pub(crate) struct SubscriberRegistry {
    buckets: Vec<Vec<Slot>>,
    next_slot: u64,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            buckets: (0..EventType::COUNT).map(|_| Vec::new()).collect(),
            next_slot: 0,
        }
    }

    pub(crate) fn insert(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Subscription {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.buckets[event_type.index()].push(Slot { id: slot, handler });
        Subscription { event_type, slot }
    }

    /// Remove exactly the registration behind `subscription`.
    pub(crate) fn remove(&mut self, subscription: Subscription) -> bool {
        let bucket = &mut self.buckets[subscription.event_type.index()];
        let before = bucket.len();
        bucket.retain(|s| s.id != subscription.slot);
        bucket.len() != before
    }

    pub(crate) fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.buckets[event_type.index()]
            .iter()
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    pub(crate) fn count(&self, event_type: EventType) -> usize {
        self.buckets[event_type.index()].len()
    }

    pub(crate) fn total(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for ty in EventType::ALL {
            let bucket = &self.buckets[ty.index()];
            if !bucket.is_empty() {
                let names: Vec<&str> = bucket.iter().map(|s| s.handler.name()).collect();
                let _ = map.entry(&ty.as_str(), &names);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop(name: &str) -> Arc<dyn EventHandler> {
        handler_fn(name.to_string(), |_| Ok(()))
    }

    #[test]
    fn insert_and_count() {
        let mut reg = SubscriberRegistry::new();
        let _ = reg.insert(EventType::StageFailed, noop("a"));
        let _ = reg.insert(EventType::StageFailed, noop("b"));
        let _ = reg.insert(EventType::WorkflowFailed, noop("c"));
        assert_eq!(reg.count(EventType::StageFailed), 2);
        assert_eq!(reg.count(EventType::StageStarted), 0);
        assert_eq!(reg.total(), 3);
    }

    #[test]
    fn remove_only_targets_one_registration() {
        let mut reg = SubscriberRegistry::new();
        let handler = noop("shared");
        let first = reg.insert(EventType::StageFailed, Arc::clone(&handler));
        let _second = reg.insert(EventType::StageFailed, handler);
        assert!(reg.remove(first));
        assert!(!reg.remove(first));
        assert_eq!(reg.count(EventType::StageFailed), 1);
    }

    #[test]
    fn handlers_keep_subscription_order() {
        let mut reg = SubscriberRegistry::new();
        let _ = reg.insert(EventType::AgentRegistered, noop("first"));
        let _ = reg.insert(EventType::AgentRegistered, noop("second"));
        let names: Vec<String> = reg
            .handlers_for(EventType::AgentRegistered)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn debug_lists_handler_names() {
        let mut reg = SubscriberRegistry::new();
        let _ = reg.insert(EventType::SecurityViolation, noop("audit"));
        let debug = format!("{reg:?}");
        assert!(debug.contains("security_violation"));
        assert!(debug.contains("audit"));
    }
}
