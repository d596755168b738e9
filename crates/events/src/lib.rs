//! Outbound events and the transport they are flushed to.
//!
//! Jobs never publish directly. They queue [`OutboundEvent`]s into an
//! [`EventSink`] owned by the current run, and the harness either flushes the
//! whole batch (success) or discards it (failure).

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod sink;

pub use bus::{BatchError, EventBus, Subscription};
pub use event::OutboundEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use sink::{EventBuffer, EventQueue, EventSink, EventSinkError};
