//! RTSP ingest: one GStreamer pipeline per reader, decoded in-process.
//!
//! Both readers share the same connection discipline: 3 attempts with 5 s
//! between them, reset once a session has delivered frames. A cancellation
//! token stops the pipeline and the task.

pub mod audio;
pub mod video;

pub use audio::RtspAudioReader;
pub use video::RtspVideoReader;

use std::time::Duration;

use anyhow::Context;
use cradle_protocol::CameraCredentials;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory};

pub(crate) const CONNECT_ATTEMPTS: u32 = 3;
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// RTSP jitterbuffer latency in milliseconds.
const RTSP_LATENCY_MS: u32 = 100;

/// How a pipeline session finished.
pub(crate) enum SessionEnd {
    Cancelled,
    /// Stream ended or errored; `delivered` is true if at least one frame
    /// reached the consumer, which resets the retry counter.
    Ended { delivered: bool },
}

/// Create a `uridecodebin` for the camera URL with TCP transport, the
/// low-latency jitterbuffer and optional credentials applied to the
/// underlying `rtspsrc` once it exists.
pub(crate) fn make_decode_source(
    url: &str,
    credentials: Option<&CameraCredentials>,
) -> anyhow::Result<gst::Element> {
    let source = ElementFactory::make("uridecodebin")
        .property("uri", url)
        .build()
        .context("Failed to create uridecodebin")?;

    let creds = credentials.cloned();
    source.connect("source-setup", false, move |values| {
        let Ok(src) = values[1].get::<gst::Element>() else {
            return None;
        };
        // The source for rtsp:// URIs is rtspsrc; force interleaved TCP and
        // keep the jitterbuffer small.
        src.set_property_from_str("protocols", "tcp");
        src.set_property("latency", RTSP_LATENCY_MS);
        if let Some(ref creds) = creds {
            src.set_property("user-id", &creds.username);
            src.set_property("user-pw", &creds.password);
        }
        None
    });

    Ok(source)
}

/// Route an unused decoded pad into a fakesink so the stream drains
/// without not-linked errors.
pub(crate) fn link_to_fakesink(pipeline: &gst::Pipeline, pad: &gst::Pad) {
    let Ok(fakesink) = ElementFactory::make("fakesink")
        .property("sync", false)
        .build()
    else {
        return;
    };
    if pipeline.add(&fakesink).is_err() {
        return;
    }
    let _ = fakesink.sync_state_with_parent();
    if let Some(sink_pad) = fakesink.static_pad("sink") {
        let _ = pad.link(&sink_pad);
    }
}

/// Terminal pipeline events surfaced by [`poll_bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusEvent {
    Error,
    Eos,
}

/// Drain pending bus messages without blocking. The reader tasks call this
/// from their supervision loop; there is no GLib main loop to run a watch.
pub(crate) fn poll_bus(bus: &gst::Bus, label: &'static str) -> Option<BusEvent> {
    use gst::MessageView;
    while let Some(msg) = bus.pop() {
        match msg.view() {
            MessageView::Error(err) => {
                tracing::warn!(
                    label,
                    source = ?err.src().map(|s| s.name().to_string()),
                    error = %err.error(),
                    debug = ?err.debug(),
                    "GStreamer pipeline error"
                );
                return Some(BusEvent::Error);
            }
            MessageView::Eos(_) => {
                tracing::info!(label, "GStreamer pipeline end of stream");
                return Some(BusEvent::Eos);
            }
            MessageView::Warning(warn) => {
                tracing::warn!(
                    label,
                    warning = %warn.error(),
                    "GStreamer pipeline warning"
                );
            }
            _ => {}
        }
    }
    None
}
