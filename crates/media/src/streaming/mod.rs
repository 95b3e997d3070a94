//! Room streaming services: registry of rooms, lazily started readers, and
//! pub/sub fan-out of frames to peer subscribers.

pub mod audio;
pub mod video;

pub use audio::AudioStreamingService;
pub use video::VideoStreamingService;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one subscription. Handlers are removed by id, so the same
/// closure shape can be registered for many peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[derive(Default)]
pub(crate) struct SubscriptionIds(AtomicU64);

impl SubscriptionIds {
    pub(crate) fn next(&self) -> SubscriptionId {
        SubscriptionId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

pub type AudioHandler = Arc<dyn Fn(&cradle_protocol::AudioFrame) + Send + Sync>;
pub type VideoHandler = Arc<dyn Fn(&cradle_protocol::VideoFrame) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("room {0} not found")]
    RoomNotFound(i32),
    #[error("room {0} has this stream disabled or misconfigured")]
    NotStreamable(i32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
