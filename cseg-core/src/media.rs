use bytes::Bytes;

use crate::error::Result;

/// PTS units per second (MPEG-TS timebase).
pub const TS_TIME_BASE: i64 = 90_000;

/// Fixed startup offset added to the first assigned PTS, keeping early
/// timestamps strictly positive and ahead of the container minimum.
pub const START_PTS: i64 = 90_000;

/// Samples per AAC frame.
pub const AAC_SAMPLES_PER_FRAME: i64 = 1024;

/// 200ms / 400ms expressed in PTS units; drift-correction thresholds.
pub const PTS_200_MS: i64 = 18_000;
pub const PTS_400_MS: i64 = 36_000;

/// Wall-clock sanity epoch (seconds): recording refuses to start while the
/// system date still looks unset.
pub const MIN_WALL_TIMESTAMP: i64 = 1_000_000_000;

/// Media type of a finished segment buffer.
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Aac,
    /// AAC framed with ADTS headers.
    AacAdts,
    Mp3,
}

impl Codec {
    #[must_use]
    pub const fn is_aac_family(self) -> bool {
        matches!(self, Self::Aac | Self::AacAdts)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Aac => "aac",
            Self::AacAdts => "aac-adts",
            Self::Mp3 => "mp3",
        }
    }
}

/// One encoder-fed stream within a recording session.
#[derive(Debug, Clone, Copy)]
pub struct StreamDescriptor {
    pub kind: MediaKind,
    pub codec: Codec,
    /// Frames per second for video; sample rate for audio.
    pub frame_rate: u32,
}

/// A packet as produced by the encoder, before PTS assignment.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub stream_index: usize,
    pub key: bool,
    pub payload: Bytes,
}

/// A packet with its assigned output-timeline position.
#[derive(Debug, Clone)]
pub struct SyncedPacket {
    pub stream_index: usize,
    pub pts: i64,
    pub key: bool,
    pub payload: Bytes,
}

/// External container collaborator: frames one synchronized packet into
/// muxed bytes. Container correctness is outside this crate.
pub trait Muxer: Send {
    fn encode_packet(&mut self, packet: &SyncedPacket) -> Result<Bytes>;
}
