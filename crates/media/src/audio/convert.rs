//! Decoded-sample conversion: native formats to normalized f32 and back.
//!
//! The conversion is a tagged match on the sample format reported by the
//! decoder. Planar buffers (one plane per channel) are reinterleaved so the
//! rest of the pipeline only sees interleaved samples.

use cradle_protocol::{RawAudioFrame, SampleFormat};

/// Convert a raw decoded frame to normalized interleaved f32 in [-1, 1].
/// Float inputs are clamped after conversion; integer inputs cannot exceed
/// the range. Non-finite float samples pass through and are excluded later,
/// at the metering stage.
pub fn to_f32_interleaved(frame: &RawAudioFrame) -> Vec<f32> {
    let channels = frame.channels.max(1) as usize;
    let bps = frame.sample_format.bytes_per_sample();
    let total_samples = frame.data.len() / bps;
    if total_samples == 0 {
        return Vec::new();
    }

    let mut samples = Vec::with_capacity(total_samples);
    let read = |index: usize| -> f32 {
        let offset = index * bps;
        let bytes = &frame.data[offset..offset + bps];
        match frame.sample_format {
            SampleFormat::S16 => {
                i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0
            }
            SampleFormat::S32 => {
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32
                    / 2_147_483_648.0
            }
            SampleFormat::F32 => {
                let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if v.is_finite() { v.clamp(-1.0, 1.0) } else { v }
            }
            SampleFormat::F64 => {
                let v = f64::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]) as f32;
                if v.is_finite() { v.clamp(-1.0, 1.0) } else { v }
            }
        }
    };

    if frame.is_planar && channels > 1 {
        // One plane per channel: plane c holds samples [c*n .. (c+1)*n).
        let per_channel = total_samples / channels;
        for i in 0..per_channel {
            for c in 0..channels {
                samples.push(read(c * per_channel + i));
            }
        }
    } else {
        for i in 0..total_samples {
            samples.push(read(i));
        }
    }

    samples
}

/// Apply a gain in dB (multiplier = 10^(dB/20)), clipping to [-1, 1].
pub fn apply_gain_db(samples: &mut [f32], gain_db: f32) {
    if gain_db == 0.0 {
        return;
    }
    let multiplier = 10f32.powf(gain_db / 20.0);
    for sample in samples.iter_mut() {
        *sample = (*sample * multiplier).clamp(-1.0, 1.0);
    }
}

/// Normalized f32 to 16-bit signed little-endian bytes.
pub fn f32_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let v = if sample.is_finite() {
            (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16
        } else {
            0
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// 16-bit signed little-endian bytes to normalized f32.
pub fn s16le_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect()
}

/// 16-bit signed little-endian bytes to i16 samples.
pub fn s16le_to_i16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
