// Storage backend contract.
//
// Every backend implements `SegmentWriter`; the segment store consumes it.
// Calls are sequential per writer, the segment buffer must not be retained
// past the call, and retries beyond one `write_segment` invocation are the
// caller's decision.

pub mod file;

pub use file::FileWriter;

use async_trait::async_trait;

use crate::error::Result;
use crate::segment::Segment;

/// Result of one delivery attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored and acknowledged.
    Committed,
    /// Bytes stored, but the commit notification failed. The caller keeps
    /// the segment for a reconciliation sweep; data is not re-uploaded.
    CommittedUnconfirmed { name: String },
    /// The backend is not ready to accept this segment (no reservation
    /// issued). Not an error: retry the whole segment later.
    Deferred,
}

#[async_trait]
pub trait SegmentWriter: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Deliver one closed segment. Safe to call repeatedly for different
    /// segments sequentially; must not retain the buffer past the call.
    async fn write_segment(&self, segment: &Segment) -> Result<WriteOutcome>;

    /// Re-issue the commit notification for an unconfirmed segment.
    /// Backends without transaction semantics accept by default.
    async fn confirm(&self, _segment: &Segment, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn uninit(&self) -> Result<()>;
}
