// Recording session wiring.
//
// The producer side (encoder thread) runs synchronously: timeline PTS
// assignment, muxing, and segment-buffer appends never wait on network
// I/O. Closed segments are handed over a bounded queue to a delivery
// worker task; a slow or retrying upload therefore cannot stall packet
// ingestion. A periodic sweep re-issues commit notifications for
// segments that uploaded but were never acknowledged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing as log;

use crate::clock::Clock;
use crate::config::CsegConfig;
use crate::error::{Error, Result};
use crate::media::{Muxer, RawPacket, StreamDescriptor, TS_TIME_BASE};
use crate::segment::{SegmentHandle, SegmentState, SegmentStore};
use crate::timeline::TimelineSynchronizer;
use crate::writer::SegmentWriter;

/// Delay before a deferred segment is offered to the writer again.
const DEFERRED_RETRY_DELAY: Duration = Duration::from_secs(5);

struct CurrentSegment {
    handle: SegmentHandle,
    start_ts: f64,
    /// PTS of the first packet appended after the trigger; duration is
    /// measured from here.
    start_pts: Option<i64>,
    last_pts: i64,
    /// Bytes appended so far, against the size threshold.
    bytes: usize,
    /// Wall-clock span covered by pre-recorded chunks, counted into the
    /// first segment's duration on top of the PTS span.
    lead_secs: f64,
}

pub struct RecordingSession {
    timeline: TimelineSynchronizer,
    store: Arc<SegmentStore>,
    muxer: Box<dyn Muxer>,
    writer: Arc<dyn SegmentWriter>,
    clock: Arc<dyn Clock>,
    current: Option<CurrentSegment>,
    max_segment_bytes: usize,
    triggered: bool,
    delivery_tx: mpsc::Sender<u64>,
    worker: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl RecordingSession {
    /// Initialize the writer and spawn the delivery worker and the
    /// reconciliation sweep. Must run inside a tokio runtime.
    pub async fn start(
        config: &CsegConfig,
        streams: Vec<StreamDescriptor>,
        muxer: Box<dyn Muxer>,
        writer: Arc<dyn SegmentWriter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        writer.init().await?;

        let timeline = TimelineSynchronizer::new(
            streams,
            config.segment.duration_secs,
            Arc::clone(&clock),
        )?;
        let store = Arc::new(SegmentStore::new(&config.segment));

        let (delivery_tx, delivery_rx) = mpsc::channel(config.segment.queue_depth.max(1));
        // The worker gets a weak handle only: a strong clone would keep its
        // own channel open and `recv` could never drain out on shutdown.
        let worker = tokio::spawn(delivery_loop(
            Arc::clone(&store),
            Arc::clone(&writer),
            delivery_rx,
            delivery_tx.downgrade(),
        ));
        let sweep = tokio::spawn(reconcile_loop(
            Arc::clone(&store),
            Arc::clone(&writer),
            Duration::from_secs(config.segment.reconcile_interval_secs.max(1)),
        ));

        Ok(Self {
            timeline,
            store,
            muxer,
            writer,
            clock,
            current: None,
            max_segment_bytes: config.segment.max_segment_bytes,
            // Without a look-back window there is nothing to arm: record
            // from the first started packet.
            triggered: config.segment.pre_record_secs <= 0.0,
            delivery_tx,
            worker,
            sweep,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// Fire the recording trigger: consume the look-back ring and open the
    /// first segment, backdated to the oldest retained chunk.
    pub fn trigger(&mut self) -> Result<()> {
        if self.triggered {
            return Ok(());
        }
        self.triggered = true;
        let now = self.clock.wall_ts()?;
        let (start_ts, chunks) = self.store.take_pre_record(now);
        let handle = self.store.open_segment(start_ts)?;
        let mut bytes = 0;
        for chunk in &chunks {
            self.store.append(handle, chunk)?;
            bytes += chunk.len();
        }
        log::info!(
            sequence = handle.sequence(),
            start_ts,
            pre_record_chunks = chunks.len(),
            "recording triggered"
        );
        self.current = Some(CurrentSegment {
            handle,
            start_ts,
            start_pts: None,
            last_pts: 0,
            bytes,
            lead_secs: (now - start_ts).max(0.0),
        });
        Ok(())
    }

    /// Ingest one raw packet from the encoder. Never blocks on delivery.
    ///
    /// Errors abort only this packet; the session stays usable.
    pub fn feed_packet(&mut self, packet: RawPacket) -> Result<()> {
        let Some(output) = self.timeline.process(packet)? else {
            return Ok(());
        };

        let muxed = self.muxer.encode_packet(&output.packet)?;

        if !self.triggered {
            self.store.buffer_pre_record(self.clock.wall_ts()?, muxed);
            return Ok(());
        }

        if output.boundary || self.size_threshold_reached() {
            self.rotate(output.packet.pts)?;
        }

        let Some(current) = self.current.as_mut() else {
            // The last open attempt failed; bytes are dropped until the
            // next boundary.
            return Ok(());
        };
        if current.start_pts.is_none() {
            current.start_pts = Some(output.packet.pts);
        }
        current.last_pts = output.packet.pts;
        current.bytes += muxed.len();
        self.store.append(current.handle, &muxed)?;
        Ok(())
    }

    /// Size-forced rotation: keyframe-starved streams must not grow one
    /// segment without bound.
    fn size_threshold_reached(&self) -> bool {
        self.max_segment_bytes > 0
            && self
                .current
                .as_ref()
                .is_some_and(|c| c.bytes >= self.max_segment_bytes)
    }

    /// Close the current segment and open the next one at `pts`.
    fn rotate(&mut self, pts: i64) -> Result<()> {
        let next_start_ts = match self.current.take() {
            Some(current) => {
                let duration = current.lead_secs + pts_delta_secs(current.start_pts, pts);
                let closed = self.store.close(current.handle, duration)?;
                self.enqueue_delivery(closed.sequence);
                current.start_ts + duration
            }
            None => self.clock.wall_ts()?,
        };

        match self.store.open_segment(next_start_ts) {
            Ok(handle) => {
                self.current = Some(CurrentSegment {
                    handle,
                    start_ts: next_start_ts,
                    start_pts: Some(pts),
                    last_pts: pts,
                    bytes: 0,
                    lead_secs: 0.0,
                });
                Ok(())
            }
            Err(err @ Error::CapacityExceeded(_)) => {
                // Isolation: drop this segment's bytes, keep the session.
                log::error!(error = %err, "cannot open segment, dropping bytes");
                self.current = None;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn enqueue_delivery(&self, sequence: u64) {
        if let Err(err) = self.delivery_tx.try_send(sequence) {
            // Queue full or worker gone: the segment stays `Closed` in the
            // store and is evicted once capacity demands it.
            log::warn!(sequence, error = %err, "delivery queue rejected segment");
        }
    }

    /// Flush the open segment, drain the delivery queue, and release the
    /// writer.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(current) = self.current.take() {
            let duration =
                current.lead_secs + pts_delta_secs(current.start_pts, current.last_pts);
            let closed = self.store.close(current.handle, duration)?;
            self.enqueue_delivery(closed.sequence);
        }

        drop(self.delivery_tx);
        if let Err(err) = self.worker.await {
            log::warn!(error = %err, "delivery worker ended abnormally");
        }
        self.sweep.abort();

        self.writer.uninit().await
    }
}

fn pts_delta_secs(start_pts: Option<i64>, pts: i64) -> f64 {
    let start = start_pts.unwrap_or(pts);
    (pts - start).max(0) as f64 / TS_TIME_BASE as f64
}

/// Delivery worker: pulls closed segments off the bounded queue and runs
/// the blocking writer protocol, one segment at a time per worker.
async fn delivery_loop(
    store: Arc<SegmentStore>,
    writer: Arc<dyn SegmentWriter>,
    mut rx: mpsc::Receiver<u64>,
    retry_tx: mpsc::WeakSender<u64>,
) {
    while let Some(sequence) = rx.recv().await {
        match store.deliver(sequence, writer.as_ref()).await {
            Ok(SegmentState::Closed) => {
                // Backend not ready: retry the whole segment later.
                log::info!(sequence, "delivery deferred by backend");
                let tx = retry_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(DEFERRED_RETRY_DELAY).await;
                    let Some(tx) = tx.upgrade() else {
                        log::warn!(sequence, "session closed before deferred retry");
                        return;
                    };
                    if tx.send(sequence).await.is_err() {
                        log::warn!(sequence, "session closed before deferred retry");
                    }
                });
            }
            Ok(state) => {
                log::info!(sequence, state = state.name(), "segment delivered");
            }
            Err(err @ (Error::NotFound(_) | Error::InvalidState { .. })) => {
                // Never reached the writer: evicted (or re-queued) while it
                // sat in the queue.
                log::warn!(sequence, error = %err, "segment gone before delivery");
            }
            // Writer failures are logged by the store; terminal for this
            // segment only.
            Err(_) => {}
        }
    }
}

/// Reconciliation sweep: re-issues `save` for segments whose upload
/// succeeded but whose commit notification was lost.
async fn reconcile_loop(
    store: Arc<SegmentStore>,
    writer: Arc<dyn SegmentWriter>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for segment in store.unconfirmed() {
            let Some(name) = segment.remote_name.clone() else {
                continue;
            };
            match writer.confirm(&segment, &name).await {
                Ok(()) => {
                    if let Err(err) = store.mark_confirmed(segment.sequence) {
                        log::warn!(sequence = segment.sequence, error = %err, "confirm bookkeeping failed");
                    } else {
                        log::info!(sequence = segment.sequence, name, "segment confirmed");
                    }
                }
                Err(err) => {
                    log::warn!(sequence = segment.sequence, error = %err, "segment confirm retry failed");
                }
            }
        }
    }
}
