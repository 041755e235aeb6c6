// Multi-stream timeline synchronizer.
//
// Assigns presentation timestamps to raw encoder packets on a shared
// drift-corrected timeline and decides where segment boundaries fall.
// Recording start is gated on real time: the first video key frame seen
// after the wall clock has passed the sanity epoch becomes the session
// time origin; everything arriving earlier is dropped.

use std::sync::Arc;

use tracing as log;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::media::{
    MediaKind, RawPacket, StreamDescriptor, SyncedPacket, AAC_SAMPLES_PER_FRAME,
    MIN_WALL_TIMESTAMP, PTS_200_MS, PTS_400_MS, START_PTS, TS_TIME_BASE,
};

/// A synchronized packet plus the rotation decision for it.
#[derive(Debug, Clone)]
pub struct SyncOutput {
    pub packet: SyncedPacket,
    /// True when this packet starts a new segment (first packet of the
    /// session, or a video key frame past the configured segment length).
    pub boundary: bool,
}

struct StreamState {
    desc: StreamDescriptor,
    last_pts: Option<i64>,
}

pub struct TimelineSynchronizer {
    streams: Vec<StreamState>,
    audio_index: Option<usize>,
    clock: Arc<dyn Clock>,
    /// Monotonic origin, set once on session start. `NotStarted` while None.
    origin: Option<f64>,
    /// PTS at which the current segment began.
    segment_start_pts: Option<i64>,
    segment_duration_pts: i64,
}

impl TimelineSynchronizer {
    /// Validates the stream set: exactly one video stream is mandatory,
    /// at most one audio stream is allowed.
    pub fn new(
        streams: Vec<StreamDescriptor>,
        segment_duration_secs: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let video_count = streams
            .iter()
            .filter(|s| s.kind == MediaKind::Video)
            .count();
        if video_count != 1 {
            return Err(Error::InvalidConfig(format!(
                "exactly one video stream required, found {video_count}"
            )));
        }
        let audio_indexes: Vec<usize> = streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == MediaKind::Audio)
            .map(|(i, _)| i)
            .collect();
        if audio_indexes.len() > 1 {
            return Err(Error::InvalidConfig(format!(
                "at most one audio stream allowed, found {}",
                audio_indexes.len()
            )));
        }
        for stream in &streams {
            if stream.frame_rate == 0 {
                return Err(Error::InvalidConfig(
                    "stream frame rate must be non-zero".to_string(),
                ));
            }
        }

        Ok(Self {
            streams: streams
                .into_iter()
                .map(|desc| StreamState {
                    desc,
                    last_pts: None,
                })
                .collect(),
            audio_index: audio_indexes.first().copied(),
            clock,
            origin: None,
            segment_start_pts: None,
            segment_duration_pts: (segment_duration_secs * TS_TIME_BASE as f64) as i64,
        })
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.origin.is_some()
    }

    /// Assign a PTS to one raw packet.
    ///
    /// Returns `Ok(None)` while the session has not started; packets are
    /// dropped, not buffered. A clock-read failure aborts only this call.
    pub fn process(&mut self, packet: RawPacket) -> Result<Option<SyncOutput>> {
        if packet.stream_index >= self.streams.len() {
            return Err(Error::InvalidConfig(format!(
                "stream index {} out of range",
                packet.stream_index
            )));
        }

        let kind = self.streams[packet.stream_index].desc.kind;

        if self.origin.is_none() {
            if kind == MediaKind::Video && packet.key && self.clock.wall_secs()? > MIN_WALL_TIMESTAMP
            {
                let origin = self.clock.monotonic()?.as_secs_f64();
                self.origin = Some(origin);
                log::info!(origin, "recording timeline started");
            } else {
                return Ok(None);
            }
        }

        let pts = self.compute_pts(packet.stream_index, kind)?;
        self.streams[packet.stream_index].last_pts = Some(pts);

        let boundary = self.check_boundary(kind, packet.key, pts);

        Ok(Some(SyncOutput {
            packet: SyncedPacket {
                stream_index: packet.stream_index,
                pts,
                key: packet.key,
                payload: packet.payload,
            },
            boundary,
        }))
    }

    fn compute_pts(&self, stream_index: usize, kind: MediaKind) -> Result<i64> {
        let stream = &self.streams[stream_index];
        let frame_rate = i64::from(stream.desc.frame_rate);

        let Some(last) = stream.last_pts else {
            // First packet on this stream: anchor to real time elapsed
            // since the session origin.
            let origin = self.origin.unwrap_or_default();
            let now = self.clock.monotonic()?.as_secs_f64();
            return Ok(((now - origin) * TS_TIME_BASE as f64) as i64 + START_PTS);
        };

        match kind {
            MediaKind::Video => {
                let naive = last + TS_TIME_BASE / frame_rate;
                Ok(self.correct_video_drift(naive, last, frame_rate))
            }
            MediaKind::Audio => {
                if !stream.desc.codec.is_aac_family() {
                    return Err(Error::UnsupportedCodec(
                        stream.desc.codec.name().to_string(),
                    ));
                }
                Ok(last + TS_TIME_BASE * AAC_SAMPLES_PER_FRAME / frame_rate)
            }
        }
    }

    /// Two-tier audio/video drift correction, video side only.
    ///
    /// Trailing audio by more than 200ms snaps video forward to the audio
    /// position (a visible jump beats compounding drift). Leading audio
    /// slows the video timeline down instead: a quarter step beyond 400ms,
    /// a half step between 200 and 400ms. The two tiers avoid oscillation
    /// around a single threshold.
    fn correct_video_drift(&self, naive: i64, last: i64, frame_rate: i64) -> i64 {
        let Some(audio_pts) = self
            .audio_index
            .and_then(|i| self.streams[i].last_pts)
        else {
            return naive;
        };

        if naive + PTS_200_MS < audio_pts {
            log::debug!(naive, audio_pts, "video trails audio, resyncing");
            audio_pts
        } else if naive > audio_pts + PTS_400_MS {
            last + TS_TIME_BASE / (frame_rate * 4)
        } else if naive > audio_pts + PTS_200_MS {
            last + TS_TIME_BASE / (frame_rate * 2)
        } else {
            naive
        }
    }

    fn check_boundary(&mut self, kind: MediaKind, key: bool, pts: i64) -> bool {
        match self.segment_start_pts {
            None => {
                self.segment_start_pts = Some(pts);
                true
            }
            Some(start) => {
                if kind == MediaKind::Video && key && pts - start >= self.segment_duration_pts {
                    self.segment_start_pts = Some(pts);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::Codec;
    use bytes::Bytes;
    use std::time::Duration;

    const WALL_OK: i64 = 1_700_000_000;

    fn video_25fps() -> StreamDescriptor {
        StreamDescriptor {
            kind: MediaKind::Video,
            codec: Codec::H264,
            frame_rate: 25,
        }
    }

    fn audio_48k(codec: Codec) -> StreamDescriptor {
        StreamDescriptor {
            kind: MediaKind::Audio,
            codec,
            frame_rate: 48_000,
        }
    }

    fn packet(stream_index: usize, key: bool) -> RawPacket {
        RawPacket {
            stream_index,
            key,
            payload: Bytes::from_static(b"frame"),
        }
    }

    fn sync(streams: Vec<StreamDescriptor>, clock: &ManualClock) -> TimelineSynchronizer {
        TimelineSynchronizer::new(streams, 10.0, Arc::new(clock.clone())).expect("valid streams")
    }

    #[test]
    fn test_video_stream_mandatory() {
        let clock = ManualClock::new(WALL_OK);
        let err = TimelineSynchronizer::new(
            vec![audio_48k(Codec::Aac)],
            10.0,
            Arc::new(clock),
        )
        .err()
        .expect("no video");
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_at_most_one_audio_stream() {
        let clock = ManualClock::new(WALL_OK);
        let err = TimelineSynchronizer::new(
            vec![video_25fps(), audio_48k(Codec::Aac), audio_48k(Codec::Aac)],
            10.0,
            Arc::new(clock),
        )
        .err()
        .expect("two audio streams");
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_no_start_before_sanity_epoch() {
        let clock = ManualClock::new(MIN_WALL_TIMESTAMP - 10);
        let mut sync = sync(vec![video_25fps()], &clock);

        assert!(sync.process(packet(0, true)).expect("ok").is_none());
        assert!(!sync.is_started());

        clock.set_wall_secs(WALL_OK);
        assert!(sync.process(packet(0, true)).expect("ok").is_some());
        assert!(sync.is_started());
    }

    #[test]
    fn test_only_video_key_frame_starts() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps(), audio_48k(Codec::Aac)], &clock);

        // Non-key video and audio packets are dropped pre-start.
        assert!(sync.process(packet(0, false)).expect("ok").is_none());
        assert!(sync.process(packet(1, false)).expect("ok").is_none());
        assert!(!sync.is_started());

        let out = sync.process(packet(0, true)).expect("ok").expect("started");
        assert!(out.boundary);
        assert_eq!(out.packet.pts, START_PTS);
    }

    #[test]
    fn test_video_pts_arithmetic_sequence() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps()], &clock);

        let mut seen = Vec::new();
        sync.process(packet(0, true)).expect("ok").expect("started");
        for _ in 0..10 {
            let out = sync.process(packet(0, false)).expect("ok").expect("synced");
            seen.push(out.packet.pts);
        }
        // 25 fps on a 90kHz timebase: common difference 3600.
        for pair in seen.windows(2) {
            assert_eq!(pair[1] - pair[0], 3600);
        }
        assert_eq!(seen[0], START_PTS + 3600);
    }

    #[test]
    fn test_audio_pts_step() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps(), audio_48k(Codec::AacAdts)], &clock);

        sync.process(packet(0, true)).expect("ok").expect("started");
        let first = sync.process(packet(1, false)).expect("ok").expect("synced");
        let second = sync.process(packet(1, false)).expect("ok").expect("synced");
        // 1024 samples at 48kHz on a 90kHz timebase: 1920 ticks.
        assert_eq!(second.packet.pts - first.packet.pts, 1920);
    }

    #[test]
    fn test_non_aac_audio_rejected() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps(), audio_48k(Codec::Mp3)], &clock);

        sync.process(packet(0, true)).expect("ok").expect("started");
        // First audio packet anchors to the clock without touching the codec.
        sync.process(packet(1, false)).expect("ok").expect("synced");
        let err = sync.process(packet(1, false)).expect_err("mp3 rejected");
        assert!(matches!(err, Error::UnsupportedCodec(_)));
    }

    #[test]
    fn test_drift_lead_250ms_takes_half_step() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps(), audio_48k(Codec::Aac)], &clock);

        sync.process(packet(0, true)).expect("ok").expect("started");
        // Ten more video frames: last video PTS = 90000 + 10*3600 = 126000.
        for _ in 0..10 {
            sync.process(packet(0, false)).expect("ok");
        }
        // Anchor audio at 0.19s: PTS = 0.19*90000 + 90000 = 107100, so the
        // naive next video PTS (129600) leads audio by exactly 250ms.
        clock.advance(Duration::from_millis(190));
        let audio = sync.process(packet(1, false)).expect("ok").expect("synced");
        assert_eq!(audio.packet.pts, 107_100);

        let out = sync.process(packet(0, false)).expect("ok").expect("synced");
        // Halved-rate branch, not a snap: 126000 + 3600/2.
        assert_eq!(out.packet.pts, 127_800);
    }

    #[test]
    fn test_drift_lead_over_400ms_takes_quarter_step() {
        let clock = ManualClock::new(WALL_OK);
        let video_2fps = StreamDescriptor {
            kind: MediaKind::Video,
            codec: Codec::H264,
            frame_rate: 2,
        };
        let mut sync = sync(vec![video_2fps, audio_48k(Codec::Aac)], &clock);

        sync.process(packet(0, true)).expect("ok").expect("started");
        let audio = sync.process(packet(1, false)).expect("ok").expect("synced");
        assert_eq!(audio.packet.pts, START_PTS);

        // 2 fps step is 45000 ticks; naive 135000 leads audio (90000) by
        // 500ms, so the next frame advances a quarter step only.
        let out = sync.process(packet(0, false)).expect("ok").expect("synced");
        assert_eq!(out.packet.pts, START_PTS + 45_000 / 4);
    }

    #[test]
    fn test_drift_trail_snaps_to_audio() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps(), audio_48k(Codec::Aac)], &clock);

        sync.process(packet(0, true)).expect("ok").expect("started");
        // Audio anchored half a second in: PTS = 0.5*90000 + 90000 = 135000.
        clock.advance(Duration::from_millis(500));
        let audio = sync.process(packet(1, false)).expect("ok").expect("synced");
        assert_eq!(audio.packet.pts, 135_000);

        // Naive video PTS 93600 trails audio by far more than 200ms.
        let out = sync.process(packet(0, false)).expect("ok").expect("synced");
        assert_eq!(out.packet.pts, 135_000);
    }

    #[test]
    fn test_no_correction_without_audio_pts() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps(), audio_48k(Codec::Aac)], &clock);

        sync.process(packet(0, true)).expect("ok").expect("started");
        // No audio packet seen yet: plain arithmetic progression.
        let out = sync.process(packet(0, false)).expect("ok").expect("synced");
        assert_eq!(out.packet.pts, START_PTS + 3600);
    }

    #[test]
    fn test_segment_boundary_on_key_frame_past_duration() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = TimelineSynchronizer::new(
            vec![video_25fps()],
            1.0,
            Arc::new(clock.clone()),
        )
        .expect("valid");

        let first = sync.process(packet(0, true)).expect("ok").expect("started");
        assert!(first.boundary);

        // 24 more frames: still within the 1s segment.
        for _ in 0..24 {
            let out = sync.process(packet(0, false)).expect("ok").expect("synced");
            assert!(!out.boundary);
        }
        // Frame 25 crosses 1s but is not a key frame.
        let out = sync.process(packet(0, false)).expect("ok").expect("synced");
        assert!(!out.boundary);
        // The next key frame rotates.
        let out = sync.process(packet(0, true)).expect("ok").expect("synced");
        assert!(out.boundary);
    }

    #[test]
    fn test_clock_failure_aborts_single_packet() {
        let clock = ManualClock::new(WALL_OK);
        let mut sync = sync(vec![video_25fps()], &clock);

        clock.set_failing(true);
        let err = sync.process(packet(0, true)).expect_err("clock down");
        assert!(matches!(err, Error::ClockFailure(_)));

        clock.set_failing(false);
        assert!(sync.process(packet(0, true)).expect("ok").is_some());
    }
}
