//! Event channel: typed publish/subscribe with a per-channel circuit breaker.
//!
//! Handlers for an event type run concurrently and independently of each
//! other; each is bounded by a timeout and isolated from panics. When too
//! many handlers fail on a publish, the publish counts as a channel failure,
//! and enough consecutive channel failures open the breaker so later
//! publishes fail fast with `ChannelUnavailable` until a probe succeeds.

mod breaker;
mod bus;
mod handler;
mod registry;

pub use breaker::{BreakerSnapshot, BreakerState};
pub use bus::{BusMetrics, EventBus, LatencySummary, PublishReport};
pub use handler::{EventHandler, FnHandler, HandlerError, handler_fn};
pub use registry::Subscription;
