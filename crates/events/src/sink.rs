//! Per-run event buffering with flush-or-discard semantics.
//!
//! A job body only sees [`EventQueue`]; the harness that owns the run holds
//! the full [`EventSink`] and calls exactly one of `send_events()` or
//! `rollback()` once the outcome of the run is known.

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::event::OutboundEvent;

/// Accepts events for later emission.
pub trait EventQueue {
    fn queue(&mut self, event: OutboundEvent);
}

/// Flush-or-discard contract for a run's buffered events.
pub trait EventSink: EventQueue {
    /// Emit every queued event in queue order as one batch. Returns how many
    /// were sent.
    ///
    /// The buffer is empty afterwards, even on error.
    fn send_events(&mut self) -> Result<usize, EventSinkError>;

    /// Discard every queued event. Returns how many were dropped.
    fn rollback(&mut self) -> usize;

    fn pending(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
pub enum EventSinkError {
    /// The bus rejected the flush. `sent` is the prefix already delivered,
    /// always zero for buses that publish batches atomically.
    #[error("event publication failed after {sent} event(s): {reason}")]
    Publish { sent: usize, reason: String },
}

/// Buffer over an [`EventBus`], scoped to a single job run.
#[derive(Debug)]
pub struct EventBuffer<'a, B> {
    bus: &'a B,
    pending: Vec<OutboundEvent>,
}

impl<'a, B> EventBuffer<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self {
            bus,
            pending: Vec::new(),
        }
    }
}

impl<B> EventQueue for EventBuffer<'_, B> {
    fn queue(&mut self, event: OutboundEvent) {
        self.pending.push(event);
    }
}

impl<B> EventSink for EventBuffer<'_, B>
where
    B: EventBus<OutboundEvent>,
{
    fn send_events(&mut self) -> Result<usize, EventSinkError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.pending);
        let sent = self
            .bus
            .publish_batch(batch)
            .map_err(|e| EventSinkError::Publish {
                sent: e.sent,
                reason: format!("{:?}", e.error),
            })?;
        debug!(sent, "flushed outbound events");
        Ok(sent)
    }

    fn rollback(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            warn!(dropped, "discarded outbound events");
        }
        dropped
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }
}
