//! RTSP video reader: decode, rescale and convert to I420 at a bounded
//! resolution, cap the frame rate at 10 fps by PTS spacing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use cradle_protocol::{CameraCredentials, VideoFrame};
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use gstreamer_video::VideoInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, SessionEnd};
use crate::unix_ms;

/// Output frame rate cap.
const MAX_FPS: u64 = 10;
/// Minimum PTS spacing between emitted frames.
const MIN_FRAME_SPACING_NS: u64 = 1_000_000_000 / MAX_FPS;
/// Output resolution bound.
const MAX_WIDTH: u32 = 640;
const MAX_HEIGHT: u32 = 480;

pub struct RtspVideoReader {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl RtspVideoReader {
    pub fn spawn(
        room_id: i32,
        url: String,
        credentials: Option<CameraCredentials>,
        tx: mpsc::Sender<VideoFrame>,
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

impl Drop for RtspVideoReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Source resolution rounded down to even, scaled into 640×480 preserving
/// aspect ratio.
pub(crate) fn compute_target_resolution(width: u32, height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (MAX_WIDTH, MAX_HEIGHT);
    }
    let (mut w, mut h) = (width, height);
    if w > MAX_WIDTH || h > MAX_HEIGHT {
        let scale = f64::min(
            MAX_WIDTH as f64 / w as f64,
            MAX_HEIGHT as f64 / h as f64,
        );
        w = (w as f64 * scale).round() as u32;
        h = (h as f64 * scale).round() as u32;
    }
    ((w & !1).max(2), (h & !1).max(2))
}

async fn run_reader(
    room_id: i32,
    url: String,
    credentials: Option<CameraCredentials>,
    tx: mpsc::Sender<VideoFrame>,
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
        info!(room_id, url = %url, attempt, "Connecting RTSP video stream");
        match run_pipeline(room_id, &url, credentials.as_ref(), &tx, &cancel).await {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Ended { delivered }) => {
                if delivered {
                    attempt = 0;
                } else {
                    attempt += 1;
                }
                warn!(room_id, delivered, "RTSP video session ended");
            }
            Err(e) => {
                attempt += 1;
                warn!(room_id, "RTSP video pipeline failed: {e:#}");
            }
        }
        if attempt >= CONNECT_ATTEMPTS {
            error!(
                room_id,
                attempts = attempt,
                "RTSP video stream unreachable, giving up until the room is refreshed"
            );
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
        }
    }
    info!(room_id, "RTSP video reader stopped");
}

async fn run_pipeline(
    room_id: i32,
    url: &str,
    credentials: Option<&CameraCredentials>,
    tx: &mpsc::Sender<VideoFrame>,
    cancel: &CancellationToken,
) -> anyhow::Result<SessionEnd> {
    let pipeline = gst::Pipeline::new();
    let source = super::make_decode_source(url, credentials)?;

    let convert = ElementFactory::make("videoconvert")
        .build()
        .context("Failed to create videoconvert")?;
    let scale = ElementFactory::make("videoscale")
        .build()
        .context("Failed to create videoscale")?;
    // Placeholder caps; replaced with the computed target once the source
    // resolution is known.
    let capsfilter = ElementFactory::make("capsfilter")
        .property(
            "caps",
            &gst::Caps::builder("video/x-raw").field("format", "I420").build(),
        )
        .build()
        .context("Failed to create capsfilter")?;

    let appsink_elem = ElementFactory::make("appsink")
        .name("sink")
        .property("sync", false)
        .property("emit-signals", true)
        .property("max-buffers", 2u32)
        .property("drop", true)
        .build()
        .context("Failed to create appsink")?;
    let appsink = appsink_elem
        .dynamic_cast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

    let delivered = Arc::new(AtomicBool::new(false));
    let delivered_flag = Arc::clone(&delivered);
    let frame_tx = tx.clone();
    // PTS of the last emitted frame, shared with the callback for the
    // 10 fps gate.
    let last_pts: Mutex<Option<u64>> = Mutex::new(None);
    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;

                if let Some(pts) = buffer.pts() {
                    let pts_ns = pts.nseconds();
                    let mut last = last_pts.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(prev) = *last
                        && pts_ns.saturating_sub(prev) < MIN_FRAME_SPACING_NS
                    {
                        return Ok(gst::FlowSuccess::Ok);
                    }
                    *last = Some(pts_ns);
                }

                let Some(info) = sample.caps().and_then(|caps| VideoInfo::from_caps(caps).ok())
                else {
                    return Ok(gst::FlowSuccess::Ok);
                };
                if info.width() == 0 || info.height() == 0 {
                    return Ok(gst::FlowSuccess::Ok);
                }

                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                let frame = VideoFrame::I420 {
                    width: info.width(),
                    height: info.height(),
                    data: Bytes::copy_from_slice(map.as_slice()),
                    timestamp_ms: unix_ms(),
                };
                delivered_flag.store(true, Ordering::Relaxed);
                if frame_tx.try_send(frame).is_err() {
                    debug!(room_id, "Video frame dropped (consumer busy)");
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    pipeline
        .add_many([&source, &convert, &scale, &capsfilter, appsink.upcast_ref()])
        .context("Failed to add elements to video pipeline")?;
    gst::Element::link_many([&convert, &scale, &capsfilter, appsink.upcast_ref()])
        .context("Failed to link video pipeline")?;

    let convert_sink = convert
        .static_pad("sink")
        .context("videoconvert has no sink pad")?;
    let caps_elem = capsfilter.clone();
    let linked = Arc::new(AtomicBool::new(false));
    let pad_pipeline = pipeline.clone();
    source.connect_pad_added(move |_, pad| {
        let Some(caps) = pad.current_caps() else {
            return;
        };
        let Some(s) = caps.structure(0) else {
            return;
        };
        if !s.name().starts_with("video/") || linked.swap(true, Ordering::Relaxed) {
            super::link_to_fakesink(&pad_pipeline, pad);
            return;
        }

        let src_w = s.get::<i32>("width").unwrap_or(0).max(0) as u32;
        let src_h = s.get::<i32>("height").unwrap_or(0).max(0) as u32;
        let (target_w, target_h) = compute_target_resolution(src_w, src_h);
        let target_caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", target_w as i32)
            .field("height", target_h as i32)
            .field("pixel-aspect-ratio", gst::Fraction::new(1, 1))
            .build();
        caps_elem.set_property("caps", &target_caps);
        info!(
            room_id,
            src_w, src_h, target_w, target_h, "RTSP video stream linked"
        );

        if let Err(e) = pad.link(&convert_sink) {
            warn!(room_id, "Failed to link decoded video pad: {e:?}");
        }
    });

    let bus = pipeline.bus().context("Video pipeline has no bus")?;

    pipeline
        .set_state(gst::State::Playing)
        .context("Failed to set video pipeline to Playing")?;

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if super::poll_bus(&bus, "rtsp-video").is_some() {
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
    fn resolution_within_bounds_rounds_down_to_even() {
        assert_eq!(compute_target_resolution(640, 480), (640, 480));
        assert_eq!(compute_target_resolution(320, 240), (320, 240));
        assert_eq!(compute_target_resolution(639, 479), (638, 478));
    }

    #[test]
    fn resolution_clamps_preserving_aspect() {
        // 1920x1080 scales by 1/3 to fit the width bound.
        assert_eq!(compute_target_resolution(1920, 1080), (640, 360));
        // Portrait source: height is the binding dimension.
        assert_eq!(compute_target_resolution(1080, 1920), (270 & !1, 480));
    }

    #[test]
    fn resolution_degenerate_input_falls_back() {
        assert_eq!(compute_target_resolution(0, 0), (640, 480));
    }

    #[test]
    fn frame_spacing_matches_ten_fps() {
        assert_eq!(MIN_FRAME_SPACING_NS, 100_000_000);
    }
}
