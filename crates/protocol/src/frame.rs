//! Media frame types crossing the reader → service → peer boundaries.
//!
//! Payloads are `bytes::Bytes` so fanning a frame out to N subscribers is a
//! reference-count bump, not a copy.

use bytes::Bytes;

/// Sample format of decoded audio, as reported by the decoder caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit signed integer
    S16,
    /// 32-bit signed integer
    S32,
    /// 32-bit IEEE float
    F32,
    /// 64-bit IEEE float
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Decoded audio exactly as the reader produced it: native sample format
/// and channel layout, little-endian bytes.
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    pub data: Bytes,
    pub sample_format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
    /// true when channels are stored as consecutive planes rather than
    /// interleaved samples.
    pub is_planar: bool,
}

impl RawAudioFrame {
    /// Samples per channel in this frame, or 0 if the buffer length doesn't
    /// divide evenly.
    pub fn samples_per_channel(&self) -> usize {
        let stride = self.sample_format.bytes_per_sample() * self.channels as usize;
        if stride == 0 {
            return 0;
        }
        self.data.len() / stride
    }
}

/// A processed audio frame as published to peer subscribers.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub room_id: i32,
    /// 16-bit signed little-endian interleaved PCM.
    pub pcm_data: Bytes,
    /// Rolling-mean level for this room at the time of the frame (dBFS).
    pub audio_level_db: f32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Unix epoch milliseconds.
    pub timestamp_ms: u64,
    /// Encoded Opus payload, set only on the Nest passthrough path.
    pub raw_opus: Option<Bytes>,
    /// RTP units (48 kHz samples per channel) covered by `raw_opus`.
    pub duration_rtp_units: Option<u32>,
}

/// A video frame: raw I420 from the RTSP decode path, or an Annex-B H.264
/// access unit from the Nest passthrough path. Exactly one variant per frame.
#[derive(Debug, Clone)]
pub enum VideoFrame {
    I420 {
        width: u32,
        height: u32,
        data: Bytes,
        timestamp_ms: u64,
    },
    RawH264 {
        annex_b_data: Bytes,
        /// RTP units (90 kHz) since the previous frame.
        duration_rtp_units: u32,
        timestamp_ms: u64,
    },
}

impl VideoFrame {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            VideoFrame::I420 { timestamp_ms, .. } => *timestamp_ms,
            VideoFrame::RawH264 { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_sample() {
        assert_eq!(SampleFormat::S16.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::S32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::F32.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::F64.bytes_per_sample(), 8);
    }

    #[test]
    fn samples_per_channel_divides_by_stride() {
        let frame = RawAudioFrame {
            data: Bytes::from(vec![0u8; 960 * 2 * 2]),
            sample_format: SampleFormat::S16,
            sample_rate: 48_000,
            channels: 2,
            is_planar: false,
        };
        assert_eq!(frame.samples_per_channel(), 960);
    }

    #[test]
    fn video_frame_timestamp_covers_both_variants() {
        let i420 = VideoFrame::I420 {
            width: 640,
            height: 480,
            data: Bytes::new(),
            timestamp_ms: 10,
        };
        let h264 = VideoFrame::RawH264 {
            annex_b_data: Bytes::new(),
            duration_rtp_units: 3000,
            timestamp_ms: 20,
        };
        assert_eq!(i420.timestamp_ms(), 10);
        assert_eq!(h264.timestamp_ms(), 20);
    }
}
