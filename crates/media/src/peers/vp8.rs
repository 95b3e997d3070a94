//! Per-peer VP8 encoder for RTSP rooms: a small GStreamer pipeline bridging
//! raw I420 frames in through `appsrc` and encoded VP8 out through
//! `appsink`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};

use anyhow::{Context, bail};
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use tracing::info;

/// Encoder input/output frame rate (matches the reader's 10 fps cap).
const FRAMERATE: i32 = 10;
const TARGET_BITRATE: i32 = 1_000_000;

pub struct Vp8Encoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    encoded_rx: std::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    _bus_watch: gst::bus::BusWatchGuard,
    pipeline_error: Arc<AtomicBool>,
    width: u32,
    height: u32,
}

impl Vp8Encoder {
    pub fn new(width: u32, height: u32) -> anyhow::Result<Self> {
        gst::init().context("Failed to initialize GStreamer")?;
        if width == 0 || height == 0 {
            bail!("Invalid encoder dimensions {width}x{height}");
        }

        let pipeline = gst::Pipeline::new();

        let appsrc_elem = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("Failed to create appsrc")?;
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(FRAMERATE, 1))
            .build();
        let appsrc = appsrc_elem
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSrc"))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // Never let push_buffer() stall the send loop when the encoder
        // falls behind.
        appsrc.set_property("block", false);

        let encoder = ElementFactory::make("vp8enc")
            .property("deadline", 1i64)
            .property("target-bitrate", TARGET_BITRATE)
            .property("cpu-used", 4i32)
            .property("keyframe-max-dist", 30i32)
            .property_from_str("end-usage", "cbr")
            .build()
            .context("Failed to create vp8enc")?;

        let appsink_elem = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 2u32)
            .property("drop", true)
            .build()
            .context("Failed to create appsink")?;
        let appsink = appsink_elem
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .add_many([appsrc.upcast_ref(), &encoder, appsink.upcast_ref()])
            .context("Failed to add elements to VP8 pipeline")?;
        gst::Element::link_many([appsrc.upcast_ref(), &encoder, appsink.upcast_ref()])
            .context("Failed to link VP8 pipeline")?;

        let pipeline_error = Arc::new(AtomicBool::new(false));
        let error_flag = Arc::clone(&pipeline_error);
        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        let _bus_watch = bus
            .add_watch(move |_, msg| {
                if let gst::MessageView::Error(err) = msg.view() {
                    tracing::error!(
                        error = %err.error(),
                        debug = ?err.debug(),
                        "VP8 pipeline error"
                    );
                    error_flag.store(true, Ordering::Relaxed);
                }
                gst::glib::ControlFlow::Continue
            })
            .context("Failed to add bus watch")?;

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set VP8 pipeline to Playing")?;

        info!(width, height, "VP8 encoder pipeline started");

        Ok(Self {
            pipeline,
            appsrc,
            encoded_rx: std::sync::Mutex::new(encoded_rx),
            _bus_watch,
            pipeline_error,
            width,
            height,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn has_error(&self) -> bool {
        self.pipeline_error.load(Ordering::Relaxed)
    }

    /// Push one I420 frame and drain whatever the encoder has finished.
    /// VP8 encoding is not strictly in lockstep; a pushed frame may come
    /// out on a later call.
    pub fn encode(&self, data: &[u8], pts_ns: u64) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
        // No other reference exists yet, so get_mut cannot return None.
        match buffer.get_mut() {
            Some(inner) => inner.set_pts(ClockTime::from_nseconds(pts_ns)),
            None => bail!("VP8 input buffer unexpectedly shared"),
        }
        self.appsrc
            .push_buffer(buffer)
            .context("Failed to push VP8 input buffer")?;

        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        Ok(frames)
    }
}

impl Drop for Vp8Encoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
