// SPDX-License-Identifier: Apache-2.0

//! Events flowing from harvesters to the publisher, and the acknowledgments
//! flowing back.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::bounded_channel::BoundedSender;
use crate::registry::FileId;

/// What a harvester learns about the fate of its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Every event of this source up to `end_offset` reached the sink.
    Ack {
        generation: u64,
        epoch: u64,
        end_offset: u64,
        line_terminated: bool,
    },
    /// A batch holding events of this source was given up on. The harvester
    /// re-reads from its last committed offset.
    Nack {
        generation: u64,
        epoch: u64,
        from_offset: u64,
    },
}

/// Return path to the harvester that produced an event.
#[derive(Clone)]
pub struct AckRoute {
    tx: BoundedSender<Acknowledgement>,
    epoch: u64,
}

impl AckRoute {
    pub fn new(tx: BoundedSender<Acknowledgement>, epoch: u64) -> Self {
        Self { tx, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn sender(&self) -> &BoundedSender<Acknowledgement> {
        &self.tx
    }

    /// Whether two routes lead to the same harvester in the same epoch.
    pub fn same_target(&self, other: &AckRoute) -> bool {
        self.epoch == other.epoch && self.tx.same_channel(&other.tx)
    }
}

impl fmt::Debug for AckRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckRoute")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// One line of a harvested file
    Line,
    /// A size report from the usage reporter
    Usage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Line => "log",
            EventKind::Usage => "efsbeat",
        }
    }
}

/// One line read from a file. Immutable once built.
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,
    pub source: FileId,
    pub source_path: Arc<PathBuf>,
    pub generation: u64,
    pub offset_range: Range<u64>,
    pub payload: Bytes,
    pub timestamp_read: DateTime<Utc>,
    /// False when this event is a piece of an over-long line that continues
    /// in the next event.
    pub line_terminated: bool,
    ack: Option<AckRoute>,
}

impl Event {
    pub fn line(
        source: FileId,
        source_path: Arc<PathBuf>,
        generation: u64,
        offset_range: Range<u64>,
        payload: Bytes,
        line_terminated: bool,
        ack: AckRoute,
    ) -> Self {
        Self {
            kind: EventKind::Line,
            source,
            source_path,
            generation,
            offset_range,
            payload,
            timestamp_read: Utc::now(),
            line_terminated,
            ack: Some(ack),
        }
    }

    /// Event with nothing to acknowledge. Used for generated reports.
    pub fn unrouted(kind: EventKind, source_path: impl AsRef<Path>, payload: Bytes) -> Self {
        Self {
            kind,
            source: FileId::new(0, 0),
            source_path: Arc::new(source_path.as_ref().to_path_buf()),
            generation: 0,
            offset_range: 0..0,
            payload,
            timestamp_read: Utc::now(),
            line_terminated: true,
            ack: None,
        }
    }

    pub fn ack_route(&self) -> Option<&AckRoute> {
        self.ack.as_ref()
    }

    /// Bytes this event accounts for in batch sizing.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.source == other.source
            && self.source_path == other.source_path
            && self.generation == other.generation
            && self.offset_range == other.offset_range
            && self.payload == other.payload
            && self.timestamp_read == other.timestamp_read
            && self.line_terminated == other.line_terminated
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("path", &self.source_path)
            .field("generation", &self.generation)
            .field("offset_range", &self.offset_range)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("line_terminated", &self.line_terminated)
            .field("ack", &self.ack)
            .finish()
    }
}
