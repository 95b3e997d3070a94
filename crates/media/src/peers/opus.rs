//! Per-peer Opus encoder for RTSP rooms: buffers resampled PCM and emits
//! one packet per complete 20 ms frame.

use anyhow::bail;
use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;

/// Clock rate negotiated for the outgoing Opus track.
pub const OPUS_CLOCK_RATE: u32 = 48_000;

pub struct PeerOpusEncoder {
    encoder: OpusEncoder,
    channels: usize,
    /// Samples per channel in one 20 ms frame.
    samples_per_frame: usize,
    pending: Vec<i16>,
    opus_buffer: Vec<u8>,
}

impl PeerOpusEncoder {
    pub fn new(clock_rate: u32, channels: u16) -> anyhow::Result<Self> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => bail!("Unsupported channel count: {channels}"),
        };
        let opus_sample_rate = match clock_rate {
            48000 => SampleRate::Hz48000,
            24000 => SampleRate::Hz24000,
            16000 => SampleRate::Hz16000,
            12000 => SampleRate::Hz12000,
            8000 => SampleRate::Hz8000,
            _ => bail!("Unsupported sample rate for Opus: {clock_rate}"),
        };

        let mut encoder =
            OpusEncoder::new(opus_sample_rate, opus_channels, Application::LowDelay)
                .map_err(|e| anyhow::anyhow!("Failed to create Opus encoder: {e:?}"))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(128_000))
            .map_err(|e| anyhow::anyhow!("Failed to set Opus bitrate: {e:?}"))?;

        let samples_per_frame = (clock_rate / 50) as usize;
        Ok(Self {
            encoder,
            channels: channels as usize,
            samples_per_frame,
            pending: Vec::with_capacity(samples_per_frame * channels as usize * 2),
            opus_buffer: vec![0u8; 4000], // Max Opus frame size
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    /// Append interleaved samples; returns the encoded packets for every
    /// complete 20 ms frame, each with its per-channel sample count.
    pub fn encode(&mut self, samples: &[i16]) -> anyhow::Result<Vec<(Bytes, u32)>> {
        self.pending.extend_from_slice(samples);
        let frame_len = self.samples_per_frame * self.channels;
        let mut packets = Vec::new();
        while self.pending.len() >= frame_len {
            let frame: Vec<i16> = self.pending.drain(..frame_len).collect();
            let encoded_len = self
                .encoder
                .encode(&frame, &mut self.opus_buffer)
                .map_err(|e| anyhow::anyhow!("Opus encode failed: {e:?}"))?;
            packets.push((
                Bytes::copy_from_slice(&self.opus_buffer[..encoded_len]),
                self.samples_per_frame as u32,
            ));
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_exotic_formats() {
        assert!(PeerOpusEncoder::new(44_100, 2).is_err());
        assert!(PeerOpusEncoder::new(48_000, 6).is_err());
    }

    #[test]
    fn short_input_is_buffered_until_a_frame_fills() {
        let mut encoder = PeerOpusEncoder::new(48_000, 1).unwrap();
        let packets = encoder.encode(&vec![0i16; 500]).unwrap();
        assert!(packets.is_empty());
        // 500 + 460 = 960 = one 20 ms mono frame.
        let packets = encoder.encode(&vec![0i16; 460]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].1, 960);
        assert!(!packets[0].0.is_empty());
    }

    #[test]
    fn one_second_of_stereo_yields_fifty_packets() {
        let mut encoder = PeerOpusEncoder::new(48_000, 2).unwrap();
        let mut count = 0;
        // 10 buffers of 100 ms each.
        for _ in 0..10 {
            count += encoder.encode(&vec![0i16; 4_800 * 2]).unwrap().len();
        }
        assert_eq!(count, 50);
    }
}
