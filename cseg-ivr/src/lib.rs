//! Transactional HTTP segment writer for IVR cloud storage.
//!
//! Implements the [`cseg_core::writer::SegmentWriter`] contract over a
//! REST-fronted object store: `create` reserves a name and upload URI,
//! the segment bytes are PUT there, and `save`/`fail` commits or releases
//! the reservation. Also provides backend selection by target URI scheme.

pub mod backend;
pub mod client;
pub mod meta;
pub mod writer;

pub use backend::writer_for_target;
pub use client::{HttpReply, HttpTransport};
pub use writer::IvrWriter;
