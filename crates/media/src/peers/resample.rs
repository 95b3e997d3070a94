//! Linear-interpolation resampler for the RTSP → Opus path.
//!
//! State (the trailing input frame and the fractional read position) carries
//! across calls, so frame boundaries interpolate against the previous
//! buffer instead of restarting and producing zipper noise.

pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    /// Fractional read position, in input frames, relative to the carried
    /// frame (index 0 when primed).
    pos: f64,
    /// The last input frame of the previous call.
    carry: Vec<i16>,
    primed: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            from_rate,
            to_rate,
            channels,
            pos: 0.0,
            carry: vec![0; channels],
            primed: false,
        }
    }

    /// True when this resampler instance still fits the incoming format.
    pub fn matches(&self, from_rate: u32, channels: u16) -> bool {
        self.from_rate == from_rate && self.channels == channels.max(1) as usize
    }

    /// Resample one interleaved buffer. Equal rates pass through untouched.
    pub fn resample(&mut self, input: &[i16]) -> Vec<i16> {
        if self.from_rate == self.to_rate {
            return input.to_vec();
        }
        let ch = self.channels;
        let in_frames = input.len() / ch;
        if in_frames == 0 {
            return Vec::new();
        }

        let ratio = self.from_rate as f64 / self.to_rate as f64;
        let carried = if self.primed { 1usize } else { 0 };
        let ext_frames = carried + in_frames;

        let sample_at = |frame: usize, c: usize| -> f32 {
            if frame < carried {
                self.carry[c] as f32
            } else {
                input[(frame - carried) * ch + c] as f32
            }
        };

        let mut out =
            Vec::with_capacity(((in_frames as f64 / ratio) as usize + 2) * ch);
        let mut pos = self.pos;
        while pos < (ext_frames - 1) as f64 {
            let i0 = pos.floor() as usize;
            let frac = (pos - i0 as f64) as f32;
            for c in 0..ch {
                let a = sample_at(i0, c);
                let b = sample_at(i0 + 1, c);
                let v = a + (b - a) * frac;
                out.push(v.round().clamp(-32_768.0, 32_767.0) as i16);
            }
            pos += ratio;
        }

        // Carry the final input frame and rebase the position onto it.
        let last = (in_frames - 1) * ch;
        self.carry.copy_from_slice(&input[last..last + ch]);
        self.primed = true;
        self.pos = pos - (ext_frames - 1) as f64;

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_rates_pass_through() {
        let mut rs = LinearResampler::new(48_000, 48_000, 1);
        let input = vec![1i16, 2, 3, 4];
        assert_eq!(rs.resample(&input), input);
    }

    #[test]
    fn upsampling_doubles_output_over_time() {
        let mut rs = LinearResampler::new(24_000, 48_000, 1);
        let mut total = 0usize;
        for _ in 0..10 {
            let input = vec![0i16; 240];
            total += rs.resample(&input).len();
        }
        // 2400 input frames → ~4800 output frames, minus the tail still
        // held back for interpolation.
        assert!((4795..=4800).contains(&total), "got {total}");
    }

    #[test]
    fn downsampling_halves_output_over_time() {
        let mut rs = LinearResampler::new(48_000, 24_000, 1);
        let mut total = 0usize;
        for _ in 0..10 {
            let input = vec![0i16; 480];
            total += rs.resample(&input).len();
        }
        assert!((2395..=2400).contains(&total), "got {total}");
    }

    #[test]
    fn ramp_is_interpolated_without_discontinuities() {
        let mut rs = LinearResampler::new(24_000, 48_000, 1);
        // Feed a continuous ramp in two buffers; the output must be
        // monotonic across the buffer boundary.
        let first: Vec<i16> = (0..100).map(|n| n * 10).collect();
        let second: Vec<i16> = (100..200).map(|n| n * 10).collect();
        let mut out = rs.resample(&first);
        out.extend(rs.resample(&second));
        for pair in out.windows(2) {
            assert!(
                pair[1] >= pair[0],
                "output must stay monotonic: {} then {}",
                pair[0],
                pair[1]
            );
            assert!((pair[1] - pair[0]) <= 10, "step too large: {pair:?}");
        }
    }

    #[test]
    fn stereo_channels_stay_independent() {
        let mut rs = LinearResampler::new(24_000, 48_000, 2);
        // Left: ramp, right: constant.
        let mut input = Vec::new();
        for n in 0..100i16 {
            input.push(n * 100);
            input.push(-5_000);
        }
        let out = rs.resample(&input);
        assert!(out.len() % 2 == 0);
        for frame in out.chunks_exact(2) {
            assert_eq!(frame[1], -5_000);
        }
        let left: Vec<i16> = out.chunks_exact(2).map(|f| f[0]).collect();
        for pair in left.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let mut rs = LinearResampler::new(44_100, 48_000, 2);
        assert!(rs.resample(&[]).is_empty());
    }

    #[test]
    fn matches_checks_rate_and_channels() {
        let rs = LinearResampler::new(44_100, 48_000, 2);
        assert!(rs.matches(44_100, 2));
        assert!(!rs.matches(48_000, 2));
        assert!(!rs.matches(44_100, 1));
    }
}
