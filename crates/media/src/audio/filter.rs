//! Biquad filters for the metering chain (RBJ cookbook coefficients).
//!
//! Filters are instantiated at a fixed 44.1 kHz rate with Q = 1.0; the chain
//! is high-pass then low-pass in series.

/// Sample rate the filter coefficients are computed against.
const FILTER_SAMPLE_RATE: f32 = 44_100.0;
const FILTER_Q: f32 = 1.0;

/// Direct-form-I biquad section.
#[derive(Debug, Clone)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    pub fn low_pass(sample_rate: f32, cutoff_hz: f32, q: f32) -> Self {
        let omega = 2.0 * std::f32::consts::PI * cutoff_hz / sample_rate;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w) / 2.0) / a0,
            b1: (1.0 - cos_w) / a0,
            b2: ((1.0 - cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn high_pass(sample_rate: f32, cutoff_hz: f32, q: f32) -> Self {
        let omega = 2.0 * std::f32::consts::PI * cutoff_hz / sample_rate;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w) / 2.0) / a0,
            b1: (-(1.0 + cos_w)) / a0,
            b2: ((1.0 + cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// High-pass followed by low-pass, applied in place to a sample buffer.
#[derive(Debug, Clone)]
pub struct FilterChain {
    high_pass: Biquad,
    low_pass: Biquad,
}

impl FilterChain {
    pub fn new(high_pass_hz: f32, low_pass_hz: f32) -> Self {
        Self {
            high_pass: Biquad::high_pass(FILTER_SAMPLE_RATE, high_pass_hz, FILTER_Q),
            low_pass: Biquad::low_pass(FILTER_SAMPLE_RATE, low_pass_hz, FILTER_Q),
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let hp = self.high_pass.process(*sample);
            *sample = self.low_pass.process(hp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_pass_blocks_dc() {
        let mut filter = Biquad::high_pass(44_100.0, 300.0, 1.0);
        let mut last = 0.0;
        for _ in 0..44_100 {
            last = filter.process(1.0);
        }
        assert!(last.abs() < 1e-3, "DC should be attenuated, got {last}");
    }

    #[test]
    fn low_pass_passes_dc() {
        let mut filter = Biquad::low_pass(44_100.0, 4_000.0, 1.0);
        let mut last = 0.0;
        for _ in 0..44_100 {
            last = filter.process(1.0);
        }
        assert!((last - 1.0).abs() < 1e-3, "DC should pass, got {last}");
    }

    #[test]
    fn low_pass_attenuates_above_cutoff() {
        // 10 kHz tone through a 1 kHz low-pass loses most of its energy.
        let mut filter = Biquad::low_pass(44_100.0, 1_000.0, 1.0);
        let mut energy_in = 0.0;
        let mut energy_out = 0.0;
        for n in 0..44_100 {
            let x = (2.0 * std::f32::consts::PI * 10_000.0 * n as f32 / 44_100.0).sin();
            let y = filter.process(x);
            energy_in += x * x;
            energy_out += y * y;
        }
        assert!(energy_out < energy_in * 0.05);
    }

    #[test]
    fn chain_passes_band() {
        // 1 kHz sits between 300 Hz and 4 kHz and should survive the chain.
        let mut chain = FilterChain::new(300.0, 4_000.0);
        let mut samples: Vec<f32> = (0..44_100)
            .map(|n| (2.0 * std::f32::consts::PI * 1_000.0 * n as f32 / 44_100.0).sin())
            .collect();
        let energy_in: f32 = samples.iter().map(|s| s * s).sum();
        chain.process(&mut samples);
        // Skip the settling transient at the start.
        let energy_out: f32 = samples[4_410..].iter().map(|s| s * s).sum();
        assert!(energy_out > energy_in * 0.4);
    }
}
