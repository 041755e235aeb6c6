// Segment data model.
//
// A segment is one finished, self-contained span of muxed media. It
// accumulates bytes while `Open`, freezes at `Close`, and then moves
// through delivery to a terminal state. Closed metadata is never mutated.

pub mod store;

pub use store::{SegmentHandle, SegmentStore};

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Accumulating muxed bytes.
    Open,
    /// Duration threshold reached; buffer and metadata frozen.
    Closed,
    /// Handed to a writer; buffer borrowed read-only for the call.
    Delivering,
    /// Stored and acknowledged by the backend.
    Committed,
    /// Uploaded, but the commit notification failed. Subject to the
    /// reconciliation sweep; the data itself is not at risk.
    CommittedUnconfirmed,
    /// Delivery failed; terminal.
    Failed,
}

impl SegmentState {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Delivering => "delivering",
            Self::Committed => "committed",
            Self::CommittedUnconfirmed => "committed-unconfirmed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are evictable; `Delivering` never is.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::CommittedUnconfirmed | Self::Failed
        )
    }
}

/// One finished, immutable span of muxed media, ready for delivery.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub buffer: Bytes,
    /// Wall-clock start, fractional seconds.
    pub start_ts: f64,
    /// Length in seconds.
    pub duration: f64,
    /// Remote name issued by the backend, once known.
    pub remote_name: Option<String>,
}

impl Segment {
    #[must_use]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }
}

/// In-store representation while a segment moves through its lifecycle.
#[derive(Debug)]
pub(crate) struct CachedSegment {
    pub sequence: u64,
    pub state: SegmentState,
    pub open_buffer: BytesMut,
    pub frozen: Option<Bytes>,
    pub start_ts: f64,
    pub duration: f64,
    pub remote_name: Option<String>,
}

impl CachedSegment {
    pub(crate) fn new(sequence: u64, start_ts: f64) -> Self {
        Self {
            sequence,
            state: SegmentState::Open,
            open_buffer: BytesMut::new(),
            frozen: None,
            start_ts,
            duration: 0.0,
            remote_name: None,
        }
    }

    pub(crate) fn snapshot(&self) -> Segment {
        Segment {
            sequence: self.sequence,
            buffer: self.frozen.clone().unwrap_or_default(),
            start_ts: self.start_ts,
            duration: self.duration,
            remote_name: self.remote_name.clone(),
        }
    }
}
