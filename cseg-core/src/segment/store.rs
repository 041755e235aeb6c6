// Cached-segment lifecycle manager.
//
// Owns the ring of in-flight and completed segments, enforces the
// bounded-count eviction policy and the pre-recording look-back window,
// and hands closed segments to a configured writer. All count/eviction
// bookkeeping sits in one mutex-guarded critical section; the writer call
// itself runs without the lock held.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing as log;

use crate::config::SegmentConfig;
use crate::error::{Error, Result};
use crate::segment::{CachedSegment, Segment, SegmentState};
use crate::writer::{SegmentWriter, WriteOutcome};

/// Opaque reference to an `Open` segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHandle(u64);

impl SegmentHandle {
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

struct StoreState {
    segments: VecDeque<CachedSegment>,
    next_sequence: u64,
    /// Look-back ring held before the recording trigger fires, keyed by
    /// wall-clock arrival time. Discarded once consumed.
    pre_record: VecDeque<(f64, Bytes)>,
    pre_record_consumed: bool,
}

pub struct SegmentStore {
    inner: Mutex<StoreState>,
    max_segments: usize,
    pre_record_secs: f64,
}

impl SegmentStore {
    #[must_use]
    pub fn new(config: &SegmentConfig) -> Self {
        Self::with_start_sequence(config, 0)
    }

    /// Resume numbering from a prior session.
    #[must_use]
    pub fn with_start_sequence(config: &SegmentConfig, start_sequence: u64) -> Self {
        Self {
            inner: Mutex::new(StoreState {
                segments: VecDeque::new(),
                next_sequence: start_sequence,
                pre_record: VecDeque::new(),
                pre_record_consumed: false,
            }),
            max_segments: config.max_segments.max(1),
            pre_record_secs: config.pre_record_secs.max(0.0),
        }
    }

    /// Allocate a new `Open` segment.
    ///
    /// At the segment-count bound the oldest evictable segment (lowest
    /// sequence, terminal first, then `Closed`) is discarded; if every
    /// cached segment is `Open` or `Delivering` the call fails with
    /// `CapacityExceeded`.
    pub fn open_segment(&self, start_ts: f64) -> Result<SegmentHandle> {
        let mut state = self.inner.lock();

        if state.segments.len() >= self.max_segments {
            let evict_pos = Self::evictable_position(&state.segments)?;
            if let Some(evicted) = state.segments.remove(evict_pos) {
                log::debug!(
                    sequence = evicted.sequence,
                    state = evicted.state.name(),
                    "evicted cached segment"
                );
            }
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.segments.push_back(CachedSegment::new(sequence, start_ts));
        Ok(SegmentHandle(sequence))
    }

    fn evictable_position(segments: &VecDeque<CachedSegment>) -> Result<usize> {
        // Lowest sequence wins within each class; the deque is ordered by
        // sequence already.
        if let Some(pos) = segments.iter().position(|s| s.state.is_terminal()) {
            return Ok(pos);
        }
        if let Some(pos) = segments
            .iter()
            .position(|s| s.state == SegmentState::Closed)
        {
            return Ok(pos);
        }
        Err(Error::CapacityExceeded(
            "segment store full, nothing evictable".to_string(),
        ))
    }

    /// Append muxed bytes to an `Open` segment.
    pub fn append(&self, handle: SegmentHandle, bytes: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        let segment = Self::find_mut(&mut state, handle)?;
        if segment.state != SegmentState::Open {
            return Err(Error::InvalidState {
                expected: "open",
                found: segment.state.name(),
            });
        }
        segment.open_buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Freeze an `Open` segment: buffer and metadata become immutable.
    pub fn close(&self, handle: SegmentHandle, duration: f64) -> Result<Segment> {
        let mut state = self.inner.lock();
        let segment = Self::find_mut(&mut state, handle)?;
        if segment.state != SegmentState::Open {
            return Err(Error::InvalidState {
                expected: "open",
                found: segment.state.name(),
            });
        }
        segment.state = SegmentState::Closed;
        segment.duration = duration;
        segment.frozen = Some(std::mem::take(&mut segment.open_buffer).freeze());
        Ok(segment.snapshot())
    }

    /// Deliver a closed segment through a writer.
    ///
    /// Failure terminates only this segment's lifecycle; the error is
    /// surfaced but the session is expected to continue. A `Deferred`
    /// outcome returns the segment to `Closed` for a later attempt.
    pub async fn deliver(
        &self,
        sequence: u64,
        writer: &dyn SegmentWriter,
    ) -> Result<SegmentState> {
        let segment = {
            let mut state = self.inner.lock();
            let cached = Self::find_mut(&mut state, SegmentHandle(sequence))?;
            if cached.state != SegmentState::Closed {
                return Err(Error::InvalidState {
                    expected: "closed",
                    found: cached.state.name(),
                });
            }
            cached.state = SegmentState::Delivering;
            cached.snapshot()
        };

        let result = writer.write_segment(&segment).await;

        let mut state = self.inner.lock();
        let cached = Self::find_mut(&mut state, SegmentHandle(sequence))?;
        match result {
            Ok(WriteOutcome::Committed) => {
                cached.state = SegmentState::Committed;
                Ok(SegmentState::Committed)
            }
            Ok(WriteOutcome::CommittedUnconfirmed { name }) => {
                cached.state = SegmentState::CommittedUnconfirmed;
                cached.remote_name = Some(name);
                Ok(SegmentState::CommittedUnconfirmed)
            }
            Ok(WriteOutcome::Deferred) => {
                cached.state = SegmentState::Closed;
                Ok(SegmentState::Closed)
            }
            Err(err) => {
                cached.state = SegmentState::Failed;
                log::error!(sequence, error = %err, "segment delivery failed");
                Err(err)
            }
        }
    }

    /// Segments uploaded but not yet acknowledged, for the reconciliation
    /// sweep.
    #[must_use]
    pub fn unconfirmed(&self) -> Vec<Segment> {
        self.inner
            .lock()
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::CommittedUnconfirmed)
            .map(CachedSegment::snapshot)
            .collect()
    }

    /// Promote an unconfirmed segment after a successful late commit.
    pub fn mark_confirmed(&self, sequence: u64) -> Result<()> {
        let mut state = self.inner.lock();
        let cached = Self::find_mut(&mut state, SegmentHandle(sequence))?;
        if cached.state != SegmentState::CommittedUnconfirmed {
            return Err(Error::InvalidState {
                expected: "committed-unconfirmed",
                found: cached.state.name(),
            });
        }
        cached.state = SegmentState::Committed;
        Ok(())
    }

    /// Buffer bytes arriving before the recording trigger. The ring is
    /// trimmed to the configured look-back window and dropped entirely
    /// once consumed.
    pub fn buffer_pre_record(&self, wall_ts: f64, bytes: Bytes) {
        if self.pre_record_secs <= 0.0 {
            return;
        }
        let mut state = self.inner.lock();
        if state.pre_record_consumed {
            return;
        }
        state.pre_record.push_back((wall_ts, bytes));
        while let Some(&(front_ts, _)) = state.pre_record.front() {
            if wall_ts - front_ts > self.pre_record_secs {
                state.pre_record.pop_front();
            } else {
                break;
            }
        }
    }

    /// Consume the look-back ring at trigger time. Returns the backdated
    /// start timestamp and the buffered chunks inside the window, oldest
    /// first. Subsequent calls return nothing.
    pub fn take_pre_record(&self, trigger_ts: f64) -> (f64, Vec<Bytes>) {
        let mut state = self.inner.lock();
        if state.pre_record_consumed {
            return (trigger_ts, Vec::new());
        }
        state.pre_record_consumed = true;
        let window_start = trigger_ts - self.pre_record_secs;
        let ring = std::mem::take(&mut state.pre_record);
        let mut start_ts = trigger_ts;
        let mut chunks = Vec::new();
        for (ts, bytes) in ring {
            if ts >= window_start {
                if chunks.is_empty() {
                    start_ts = ts;
                }
                chunks.push(bytes);
            }
        }
        (start_ts, chunks)
    }

    #[must_use]
    pub fn state_of(&self, sequence: u64) -> Option<SegmentState> {
        self.inner
            .lock()
            .segments
            .iter()
            .find(|s| s.sequence == sequence)
            .map(|s| s.state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().segments.is_empty()
    }

    fn find_mut<'a>(
        state: &'a mut StoreState,
        handle: SegmentHandle,
    ) -> Result<&'a mut CachedSegment> {
        state
            .segments
            .iter_mut()
            .find(|s| s.sequence == handle.0)
            .ok_or_else(|| Error::NotFound(format!("segment {}", handle.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_segments: usize, pre_record_secs: f64) -> SegmentConfig {
        SegmentConfig {
            max_segments,
            pre_record_secs,
            ..SegmentConfig::default()
        }
    }

    struct StubWriter {
        outcome: WriteOutcome,
        calls: AtomicUsize,
    }

    impl StubWriter {
        fn new(outcome: WriteOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SegmentWriter for StubWriter {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn write_segment(&self, _segment: &Segment) -> Result<WriteOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }

        async fn uninit(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingWriter;

    #[async_trait]
    impl SegmentWriter for FailingWriter {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn write_segment(&self, _segment: &Segment) -> Result<WriteOutcome> {
            Err(Error::Transport("connection refused".to_string()))
        }

        async fn uninit(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_closed_buffer_is_concatenation_of_appends() {
        let store = SegmentStore::new(&config(4, 0.0));
        let handle = store.open_segment(100.0).expect("open");
        store.append(handle, b"abc").expect("append");
        store.append(handle, b"").expect("append");
        store.append(handle, b"defg").expect("append");

        let segment = store.close(handle, 10.0).expect("close");
        assert_eq!(&segment.buffer[..], b"abcdefg");
        assert_eq!(segment.size(), 7);
        assert!((segment.start_ts - 100.0).abs() < f64::EPSILON);
        assert!((segment.duration - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_append_after_close_is_invalid_state() {
        let store = SegmentStore::new(&config(4, 0.0));
        let handle = store.open_segment(0.0).expect("open");
        store.close(handle, 1.0).expect("close");

        let err = store.append(handle, b"late").expect_err("closed");
        assert!(matches!(err, Error::InvalidState { .. }));
        let err = store.close(handle, 2.0).expect_err("already closed");
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn test_sequence_numbers_strictly_increasing_no_gaps() {
        let store = SegmentStore::new(&config(16, 0.0));
        let sequences: Vec<u64> = (0..8)
            .map(|i| {
                let handle = store.open_segment(f64::from(i)).expect("open");
                store.close(handle, 1.0).expect("close");
                handle.sequence()
            })
            .collect();
        assert_eq!(sequences, (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn test_start_sequence_continuation() {
        let store = SegmentStore::with_start_sequence(&config(4, 0.0), 42);
        let handle = store.open_segment(0.0).expect("open");
        assert_eq!(handle.sequence(), 42);
    }

    #[tokio::test]
    async fn test_eviction_prefers_oldest_terminal() {
        let store = SegmentStore::new(&config(2, 0.0));
        let writer = StubWriter::new(WriteOutcome::Committed);

        let first = store.open_segment(0.0).expect("open");
        store.close(first, 1.0).expect("close");
        store.deliver(first.sequence(), &writer).await.expect("deliver");

        let second = store.open_segment(1.0).expect("open");
        store.close(second, 1.0).expect("close");

        // At the bound: committed segment 0 goes, closed segment 1 stays.
        store.open_segment(2.0).expect("open with eviction");
        assert_eq!(store.len(), 2);
        assert!(store.state_of(first.sequence()).is_none());
        assert_eq!(
            store.state_of(second.sequence()),
            Some(SegmentState::Closed)
        );
    }

    #[test]
    fn test_capacity_exceeded_when_nothing_evictable() {
        let store = SegmentStore::new(&config(2, 0.0));
        store.open_segment(0.0).expect("open");
        store.open_segment(1.0).expect("open");

        let err = store.open_segment(2.0).expect_err("all open");
        assert!(matches!(err, Error::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_deliver_commit_and_failure_isolation() {
        let store = SegmentStore::new(&config(4, 0.0));

        let good = store.open_segment(0.0).expect("open");
        store.append(good, b"ts").expect("append");
        store.close(good, 1.0).expect("close");
        let writer = StubWriter::new(WriteOutcome::Committed);
        let state = store.deliver(good.sequence(), &writer).await.expect("deliver");
        assert_eq!(state, SegmentState::Committed);

        let bad = store.open_segment(1.0).expect("open");
        store.close(bad, 1.0).expect("close");
        let err = store
            .deliver(bad.sequence(), &FailingWriter)
            .await
            .expect_err("failed delivery");
        assert!(err.is_transport());
        assert_eq!(store.state_of(bad.sequence()), Some(SegmentState::Failed));

        // The next segment still opens normally.
        assert!(store.open_segment(2.0).is_ok());
    }

    #[tokio::test]
    async fn test_deferred_returns_segment_to_closed() {
        let store = SegmentStore::new(&config(4, 0.0));
        let handle = store.open_segment(0.0).expect("open");
        store.close(handle, 1.0).expect("close");

        let writer = StubWriter::new(WriteOutcome::Deferred);
        let state = store
            .deliver(handle.sequence(), &writer)
            .await
            .expect("deferred");
        assert_eq!(state, SegmentState::Closed);

        // A later attempt is permitted.
        let writer = StubWriter::new(WriteOutcome::Committed);
        let state = store
            .deliver(handle.sequence(), &writer)
            .await
            .expect("retry");
        assert_eq!(state, SegmentState::Committed);
    }

    #[tokio::test]
    async fn test_unconfirmed_tracking_and_confirmation() {
        let store = SegmentStore::new(&config(4, 0.0));
        let handle = store.open_segment(0.0).expect("open");
        store.close(handle, 1.0).expect("close");

        let writer = StubWriter::new(WriteOutcome::CommittedUnconfirmed {
            name: "seg-0001".to_string(),
        });
        let state = store
            .deliver(handle.sequence(), &writer)
            .await
            .expect("deliver");
        assert_eq!(state, SegmentState::CommittedUnconfirmed);

        let unconfirmed = store.unconfirmed();
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].remote_name.as_deref(), Some("seg-0001"));

        store.mark_confirmed(handle.sequence()).expect("confirm");
        assert_eq!(
            store.state_of(handle.sequence()),
            Some(SegmentState::Committed)
        );
        assert!(store.unconfirmed().is_empty());
    }

    #[test]
    fn test_pre_record_window_trim_and_consume() {
        let store = SegmentStore::new(&config(4, 5.0));
        store.buffer_pre_record(100.0, Bytes::from_static(b"old"));
        store.buffer_pre_record(103.0, Bytes::from_static(b"aa"));
        store.buffer_pre_record(106.0, Bytes::from_static(b"bb"));

        // Trigger at 107: the window covers [102, 107], the 100.0 chunk is
        // outside it.
        let (start_ts, chunks) = store.take_pre_record(107.0);
        assert!((start_ts - 103.0).abs() < f64::EPSILON);
        assert_eq!(chunks, vec![Bytes::from_static(b"aa"), Bytes::from_static(b"bb")]);

        // Consumed: the ring is gone.
        let (start_ts, chunks) = store.take_pre_record(108.0);
        assert!((start_ts - 108.0).abs() < f64::EPSILON);
        assert!(chunks.is_empty());
        store.buffer_pre_record(109.0, Bytes::from_static(b"cc"));
        assert!(store.take_pre_record(110.0).1.is_empty());
    }

    #[test]
    fn test_pre_record_disabled_by_default() {
        let store = SegmentStore::new(&config(4, 0.0));
        store.buffer_pre_record(1.0, Bytes::from_static(b"x"));
        let (start_ts, chunks) = store.take_pre_record(2.0);
        assert!((start_ts - 2.0).abs() < f64::EPSILON);
        assert!(chunks.is_empty());
    }
}
