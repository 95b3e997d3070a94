//! RTSP audio reader: pull one stream, decode to raw PCM and emit frames
//! with their native sample format metadata.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use cradle_protocol::{CameraCredentials, RawAudioFrame, SampleFormat};
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use gstreamer_audio::{AudioFormat, AudioInfo, AudioLayout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, SessionEnd};

pub struct RtspAudioReader {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl RtspAudioReader {
    /// Start the reader task. Frames are sent on `tx`; when the channel is
    /// full the frame is dropped rather than stalling the decode loop.
    pub fn spawn(
        room_id: i32,
        url: String,
        credentials: Option<CameraCredentials>,
        tx: mpsc::Sender<RawAudioFrame>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run_reader(room_id, url, credentials, tx, task_cancel).await;
        });
        Self {
            cancel,
            _task: task,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RtspAudioReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_reader(
    room_id: i32,
    url: String,
    credentials: Option<CameraCredentials>,
    tx: mpsc::Sender<RawAudioFrame>,
    cancel: CancellationToken,
) {
    if let Err(e) = gst::init() {
        error!(room_id, "Failed to initialize GStreamer: {e}");
        return;
    }

    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        info!(room_id, url = %url, attempt, "Connecting RTSP audio stream");
        match run_pipeline(room_id, &url, credentials.as_ref(), &tx, &cancel).await {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Ended { delivered }) => {
                if delivered {
                    attempt = 0;
                } else {
                    attempt += 1;
                }
                warn!(room_id, delivered, "RTSP audio session ended");
            }
            Err(e) => {
                attempt += 1;
                warn!(room_id, "RTSP audio pipeline failed: {e:#}");
            }
        }
        if attempt >= CONNECT_ATTEMPTS {
            error!(
                room_id,
                attempts = attempt,
                "RTSP audio stream unreachable, giving up until the room is refreshed"
            );
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
        }
    }
    info!(room_id, "RTSP audio reader stopped");
}

fn parse_sample_format(format: AudioFormat) -> Option<SampleFormat> {
    match format {
        AudioFormat::S16le => Some(SampleFormat::S16),
        AudioFormat::S32le => Some(SampleFormat::S32),
        AudioFormat::F32le => Some(SampleFormat::F32),
        AudioFormat::F64le => Some(SampleFormat::F64),
        _ => None,
    }
}

async fn run_pipeline(
    room_id: i32,
    url: &str,
    credentials: Option<&CameraCredentials>,
    tx: &mpsc::Sender<RawAudioFrame>,
    cancel: &CancellationToken,
) -> anyhow::Result<SessionEnd> {
    let pipeline = gst::Pipeline::new();
    let source = super::make_decode_source(url, credentials)?;

    let appsink_elem = ElementFactory::make("appsink")
        .name("sink")
        .property("sync", false)
        .property("emit-signals", true)
        .property("max-buffers", 4u32)
        .property("drop", true)
        .build()
        .context("Failed to create appsink")?;
    let appsink = appsink_elem
        .dynamic_cast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

    // Accept the decoder's native layout; the format dispatch downstream
    // handles planar and integer/float variants.
    let caps = gst::Caps::builder("audio/x-raw")
        .field(
            "format",
            gst::List::new(["S16LE", "S32LE", "F32LE", "F64LE"]),
        )
        .build();
    appsink.set_caps(Some(&caps));

    let delivered = Arc::new(AtomicBool::new(false));
    let delivered_flag = Arc::clone(&delivered);
    let frame_tx = tx.clone();
    let unknown_format_logged = AtomicBool::new(false);
    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let Some(caps) = sample.caps() else {
                    return Ok(gst::FlowSuccess::Ok);
                };
                let Ok(info) = AudioInfo::from_caps(caps) else {
                    return Ok(gst::FlowSuccess::Ok);
                };
                let Some(sample_format) = parse_sample_format(info.format()) else {
                    if !unknown_format_logged.swap(true, Ordering::Relaxed) {
                        warn!(
                            room_id,
                            format = ?info.format(),
                            "Unsupported audio sample format, dropping"
                        );
                    }
                    return Ok(gst::FlowSuccess::Ok);
                };
                let rate = info.rate();
                let channels = info.channels();
                if rate == 0 || channels == 0 {
                    return Ok(gst::FlowSuccess::Ok);
                }
                let is_planar = info.layout() == AudioLayout::NonInterleaved;

                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let frame = RawAudioFrame {
                    data: Bytes::copy_from_slice(map.as_slice()),
                    sample_format,
                    sample_rate: rate,
                    channels: channels as u16,
                    is_planar,
                };
                delivered_flag.store(true, Ordering::Relaxed);
                if frame_tx.try_send(frame).is_err() {
                    debug!(room_id, "Audio frame dropped (consumer busy)");
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    pipeline
        .add_many([&source, appsink.upcast_ref()])
        .context("Failed to add elements to audio pipeline")?;

    // uridecodebin exposes decoded pads dynamically; link the first audio
    // pad to the appsink and dump everything else into a fakesink so
    // unused streams don't raise not-linked errors.
    let sink_pad = appsink
        .static_pad("sink")
        .context("appsink has no sink pad")?;
    let linked = Arc::new(AtomicBool::new(false));
    let pad_pipeline = pipeline.clone();
    source.connect_pad_added(move |_, pad| {
        let Some(caps) = pad.current_caps() else {
            return;
        };
        let Some(s) = caps.structure(0) else {
            return;
        };
        if !s.name().starts_with("audio/") || linked.swap(true, Ordering::Relaxed) {
            super::link_to_fakesink(&pad_pipeline, pad);
            return;
        }
        if let Err(e) = pad.link(&sink_pad) {
            warn!(room_id, "Failed to link decoded audio pad: {e:?}");
        } else {
            debug!(room_id, caps = %caps, "RTSP audio stream linked");
        }
    });

    let bus = pipeline.bus().context("Audio pipeline has no bus")?;

    pipeline
        .set_state(gst::State::Playing)
        .context("Failed to set audio pipeline to Playing")?;

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if super::poll_bus(&bus, "rtsp-audio").is_some() {
                    break SessionEnd::Ended {
                        delivered: delivered.load(Ordering::Relaxed),
                    };
                }
                if tx.is_closed() {
                    break SessionEnd::Cancelled;
                }
            }
        }
    };

    let _ = pipeline.set_state(gst::State::Null);
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_format_mapping() {
        assert_eq!(parse_sample_format(AudioFormat::S16le), Some(SampleFormat::S16));
        assert_eq!(parse_sample_format(AudioFormat::S32le), Some(SampleFormat::S32));
        assert_eq!(parse_sample_format(AudioFormat::F32le), Some(SampleFormat::F32));
        assert_eq!(parse_sample_format(AudioFormat::F64le), Some(SampleFormat::F64));
        // Big-endian and packed 24-bit variants are not supported.
        assert_eq!(parse_sample_format(AudioFormat::S16be), None);
        assert_eq!(parse_sample_format(AudioFormat::S24le), None);
    }
}
