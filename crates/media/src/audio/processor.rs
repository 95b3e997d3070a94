//! Per-room audio processor: conversion → gain → (metering filter) → RMS →
//! rolling average → threshold detection.
//!
//! The filter chain only feeds the meter; the samples published to peers are
//! the unfiltered (gain-adjusted) audio.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cradle_protocol::{GlobalSettings, RawAudioFrame, SoundAlert};
use tracing::debug;

use super::convert;
use super::filter::FilterChain;
use super::level::{self, RollingLevel};

pub struct AudioProcessor {
    room_id: i32,
    state: Mutex<ProcessorState>,
}

struct ProcessorState {
    settings: GlobalSettings,
    filters: FilterChain,
    rolling: RollingLevel,
    last_alert: Option<Instant>,
}

/// Output of one processed frame.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// 16-bit signed little-endian interleaved PCM, gain already applied.
    pub pcm: Bytes,
    /// Rolling-mean level in dBFS.
    pub level_db: f32,
    pub alert: Option<SoundAlert>,
}

impl AudioProcessor {
    pub fn new(room_id: i32, settings: GlobalSettings) -> Self {
        let filters = FilterChain::new(settings.high_pass_hz, settings.low_pass_hz);
        let rolling = RollingLevel::new(settings.average_sample_count);
        Self {
            room_id,
            state: Mutex::new(ProcessorState {
                settings,
                filters,
                rolling,
                last_alert: None,
            }),
        }
    }

    pub fn room_id(&self) -> i32 {
        self.room_id
    }

    /// Swap the settings and rebuild the filter chain and rolling window.
    pub fn update_settings(&self, settings: GlobalSettings) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.filters = FilterChain::new(settings.high_pass_hz, settings.low_pass_hz);
        state.rolling.set_capacity(settings.average_sample_count);
        state.settings = settings;
        debug!(room_id = self.room_id, "Audio processor settings updated");
    }

    pub fn volume_adjustment_db(&self) -> f32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.settings.volume_adjustment_db
    }

    /// Process a raw decoded frame from an RTSP reader: convert to f32,
    /// apply the configured volume adjustment, meter, and return s16le PCM
    /// for fan-out.
    pub fn process_raw(
        &self,
        frame: &RawAudioFrame,
        now: Instant,
        timestamp_ms: u64,
    ) -> ProcessedFrame {
        let mut samples = convert::to_f32_interleaved(frame);
        let gain_db = self.volume_adjustment_db();
        convert::apply_gain_db(&mut samples, gain_db);
        let pcm = Bytes::from(convert::f32_to_s16le(&samples));
        let (level_db, alert) = self.meter(&samples, now, timestamp_ms);
        ProcessedFrame {
            pcm,
            level_db,
            alert,
        }
    }

    /// Process already-interleaved s16le PCM (the Nest metering path).
    /// No volume adjustment is applied; the payload passes through untouched.
    pub fn process_pcm_s16(
        &self,
        pcm: &Bytes,
        now: Instant,
        timestamp_ms: u64,
    ) -> ProcessedFrame {
        let samples = convert::s16le_to_f32(pcm);
        let (level_db, alert) = self.meter(&samples, now, timestamp_ms);
        ProcessedFrame {
            pcm: pcm.clone(),
            level_db,
            alert,
        }
    }

    fn meter(&self, samples: &[f32], now: Instant, timestamp_ms: u64) -> (f32, Option<SoundAlert>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let frame_db = if state.settings.filter_enabled {
            let mut filtered = samples.to_vec();
            state.filters.process(&mut filtered);
            level::rms_to_db(level::rms(&filtered))
        } else {
            level::rms_to_db(level::rms(samples))
        };

        let mean_db = state.rolling.push(frame_db);

        let alert = self.detect_threshold(&mut state, mean_db, now, timestamp_ms);
        (mean_db, alert)
    }

    fn detect_threshold(
        &self,
        state: &mut ProcessorState,
        mean_db: f32,
        now: Instant,
        timestamp_ms: u64,
    ) -> Option<SoundAlert> {
        if mean_db <= state.settings.sound_threshold_db {
            return None;
        }
        let pause = Duration::from_secs(state.settings.threshold_pause_seconds);
        if let Some(last) = state.last_alert
            && now.duration_since(last) < pause
        {
            return None;
        }
        state.last_alert = Some(now);
        Some(SoundAlert {
            room_id: self.room_id,
            level_db: mean_db,
            threshold_db: state.settings.sound_threshold_db,
            timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_protocol::SampleFormat;
    use std::time::Duration;

    fn settings() -> GlobalSettings {
        GlobalSettings {
            sound_threshold_db: -40.0,
            average_sample_count: 1,
            filter_enabled: false,
            threshold_pause_seconds: 30,
            volume_adjustment_db: 0.0,
            ..GlobalSettings::default()
        }
    }

    fn s16_frame(samples: &[i16]) -> RawAudioFrame {
        let mut data = Vec::new();
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        RawAudioFrame {
            data: Bytes::from(data),
            sample_format: SampleFormat::S16,
            sample_rate: 44_100,
            channels: 1,
            is_planar: false,
        }
    }

    fn loud_frame() -> RawAudioFrame {
        // ~ -6 dBFS square-ish content, well above the -40 threshold.
        s16_frame(&[16_384, -16_384].repeat(220))
    }

    fn silent_frame() -> RawAudioFrame {
        s16_frame(&[0; 440])
    }

    #[test]
    fn silence_meters_at_floor_without_alert() {
        let processor = AudioProcessor::new(1, settings());
        let out = processor.process_raw(&silent_frame(), Instant::now(), 0);
        assert_eq!(out.level_db, -90.0);
        assert!(out.alert.is_none());
    }

    #[test]
    fn loud_frame_triggers_alert_once() {
        let processor = AudioProcessor::new(1, settings());
        let now = Instant::now();
        let first = processor.process_raw(&loud_frame(), now, 1);
        let alert = first.alert.expect("first loud frame should alert");
        assert_eq!(alert.room_id, 1);
        assert_eq!(alert.threshold_db, -40.0);
        assert!(alert.level_db > -40.0);

        // Within the pause window: no second alert.
        let second = processor.process_raw(&loud_frame(), now + Duration::from_secs(10), 2);
        assert!(second.alert.is_none());
    }

    #[test]
    fn alert_fires_again_after_pause() {
        let processor = AudioProcessor::new(1, settings());
        let now = Instant::now();
        assert!(processor.process_raw(&loud_frame(), now, 0).alert.is_some());
        assert!(
            processor
                .process_raw(&loud_frame(), now + Duration::from_secs(10), 1)
                .alert
                .is_none()
        );
        assert!(
            processor
                .process_raw(&loud_frame(), now + Duration::from_secs(35), 2)
                .alert
                .is_some()
        );
    }

    #[test]
    fn rolling_average_delays_threshold() {
        let mut config = settings();
        config.average_sample_count = 4;
        let processor = AudioProcessor::new(1, config);
        let now = Instant::now();
        // Three silent frames drag the mean down.
        for i in 0..3 {
            processor.process_raw(&silent_frame(), now, i);
        }
        // One loud frame isn't enough to lift a 4-frame mean above -40.
        let out = processor.process_raw(&loud_frame(), now, 3);
        assert!(out.alert.is_none(), "mean was {}", out.level_db);
    }

    #[test]
    fn settings_hot_reload_changes_threshold() {
        let processor = AudioProcessor::new(1, settings());
        let now = Instant::now();

        let mut tightened = settings();
        tightened.sound_threshold_db = 0.0;
        processor.update_settings(tightened);
        assert!(processor.process_raw(&loud_frame(), now, 0).alert.is_none());

        let mut relaxed = settings();
        relaxed.sound_threshold_db = -80.0;
        processor.update_settings(relaxed);
        assert!(processor.process_raw(&loud_frame(), now, 1).alert.is_some());
    }

    #[test]
    fn gain_applies_to_published_pcm() {
        let mut config = settings();
        config.volume_adjustment_db = -6.0;
        let processor = AudioProcessor::new(1, config);
        let out = processor.process_raw(&s16_frame(&[16_384]), Instant::now(), 0);
        let value = i16::from_le_bytes([out.pcm[0], out.pcm[1]]);
        assert!((value as f32 - 16_384.0 * 0.501).abs() < 64.0, "got {value}");
    }

    #[test]
    fn pcm_passthrough_is_untouched() {
        let processor = AudioProcessor::new(2, settings());
        let pcm = Bytes::from(vec![1u8, 2, 3, 4]);
        let out = processor.process_pcm_s16(&pcm, Instant::now(), 0);
        assert_eq!(out.pcm, pcm);
    }
}
