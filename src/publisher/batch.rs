// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::time::Instant;

use crate::event::Event;

/// An ordered group of events delivered to the sink as one unit. A retry
/// resends the same batch unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    events: Vec<Event>,
    bytes: usize,
}

impl Batch {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sum of payload sizes
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl From<Vec<Event>> for Batch {
    fn from(events: Vec<Event>) -> Self {
        let bytes = events.iter().map(Event::size).sum();
        Self { events, bytes }
    }
}

/// Accumulates events until one of the count, size or linger bounds closes
/// the batch.
pub(crate) struct BatchBuilder {
    events: Vec<Event>,
    bytes: usize,
    max_events: usize,
    max_bytes: usize,
    max_linger: Duration,
    opened_at: Option<Instant>,
}

impl BatchBuilder {
    pub(crate) fn new(max_events: usize, max_bytes: usize, max_linger: Duration) -> Self {
        Self {
            events: Vec::with_capacity(max_events.min(4096)),
            bytes: 0,
            max_events: max_events.max(1),
            max_bytes: max_bytes.max(1),
            max_linger,
            opened_at: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Add an event. When it does not fit beside what is already buffered,
    /// the buffered events are closed into a batch and returned, and the new
    /// event starts the next one. An event larger than `max_bytes` therefore
    /// travels alone.
    pub(crate) fn push(&mut self, event: Event) -> Option<Batch> {
        let closed = if !self.events.is_empty() && self.bytes + event.size() > self.max_bytes {
            Some(self.take())
        } else {
            None
        };

        if self.events.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += event.size();
        self.events.push(event);
        closed
    }

    pub(crate) fn is_full(&self) -> bool {
        self.events.len() >= self.max_events || self.bytes >= self.max_bytes
    }

    /// When the open batch must be flushed regardless of size.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.max_linger)
    }

    pub(crate) fn take(&mut self) -> Batch {
        self.opened_at = None;
        let bytes = std::mem::take(&mut self.bytes);
        Batch {
            events: std::mem::take(&mut self.events),
            bytes,
        }
    }
}
