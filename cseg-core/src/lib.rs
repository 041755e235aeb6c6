//! Cached-segment recording core.
//!
//! Buffers continuous multi-stream A/V packets into discrete time-bounded
//! segments and hands each finished segment to a pluggable storage writer,
//! while keeping the streams on one drift-corrected timeline.
//!
//! The pipeline: encoder packets enter [`timeline::TimelineSynchronizer`]
//! for PTS assignment and boundary detection, an external [`media::Muxer`]
//! frames them into container bytes, and [`segment::SegmentStore`]
//! accumulates those bytes until rotation closes the segment and a
//! [`writer::SegmentWriter`] backend delivers it.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod segment;
pub mod session;
pub mod timeline;
pub mod writer;

pub use clock::{Clock, SystemClock};
pub use config::CsegConfig;
pub use error::{Error, Result};
pub use media::{Muxer, RawPacket, StreamDescriptor, SyncedPacket};
pub use segment::{Segment, SegmentState, SegmentStore};
pub use session::RecordingSession;
pub use writer::{FileWriter, SegmentWriter, WriteOutcome};
