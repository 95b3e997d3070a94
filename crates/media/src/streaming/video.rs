//! Video streaming service: the audio service's shape minus processing.
//! Readers are started lazily per room and frames fan out to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use cradle_protocol::{Room, StreamSourceType, VideoFrame};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{StreamingError, SubscriptionId, SubscriptionIds, VideoHandler};
use crate::nest::{NestDeviceClient, NestStreamReader, NestStreamReaderManager};
use crate::repo::RoomRepository;
use crate::rtsp::RtspVideoReader;

type Subscribers = Arc<RwLock<HashMap<i32, Vec<(SubscriptionId, VideoHandler)>>>>;

enum ReaderKind {
    Rtsp(RtspVideoReader),
    Nest,
}

struct ReaderEntry {
    reader: ReaderKind,
    source_key: String,
    pump: JoinHandle<()>,
    generation: u64,
}

struct VideoState {
    rooms: HashMap<i32, Room>,
    readers: HashMap<i32, ReaderEntry>,
    generation: u64,
}

pub struct VideoStreamingInner {
    rooms_repo: Arc<dyn RoomRepository>,
    nest_manager: Arc<NestStreamReaderManager>,
    nest_client: Option<Arc<NestDeviceClient>>,
    state: Mutex<VideoState>,
    subscribers: Subscribers,
    ids: SubscriptionIds,
}

#[derive(Clone)]
pub struct VideoStreamingService {
    inner: Arc<VideoStreamingInner>,
}

impl VideoStreamingService {
    pub fn new(
        rooms_repo: Arc<dyn RoomRepository>,
        nest_manager: Arc<NestStreamReaderManager>,
        nest_client: Option<Arc<NestDeviceClient>>,
    ) -> Self {
        Self {
            inner: Arc::new(VideoStreamingInner {
                rooms_repo,
                nest_manager,
                nest_client,
                state: Mutex::new(VideoState {
                    rooms: HashMap::new(),
                    readers: HashMap::new(),
                    generation: 0,
                }),
                subscribers: Arc::new(RwLock::new(HashMap::new())),
                ids: SubscriptionIds::default(),
            }),
        }
    }

    pub async fn room(&self, room_id: i32) -> Option<Room> {
        self.inner.state.lock().await.rooms.get(&room_id).cloned()
    }

    pub async fn active_reader_count(&self) -> usize {
        self.inner.state.lock().await.readers.len()
    }

    pub async fn has_reader(&self, room_id: i32) -> bool {
        self.inner.state.lock().await.readers.contains_key(&room_id)
    }

    pub async fn subscribe(
        &self,
        room_id: i32,
        handler: VideoHandler,
    ) -> Result<SubscriptionId, StreamingError> {
        let mut state = self.inner.state.lock().await;
        let room = state
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(StreamingError::RoomNotFound(room_id))?;
        if !room.video_ready() {
            return Err(StreamingError::NotStreamable(room_id));
        }

        let id = self.inner.ids.next();
        {
            let mut subs = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            subs.entry(room_id).or_default().push((id, handler));
        }

        if !state.readers.contains_key(&room_id)
            && let Err(e) = self.start_reader(&mut state, &room).await
        {
            self.remove_handler(room_id, id);
            return Err(StreamingError::Other(e));
        }
        debug!(room_id, ?id, "Video subscriber added");
        Ok(id)
    }

    pub async fn unsubscribe(&self, room_id: i32, id: SubscriptionId) {
        let mut state = self.inner.state.lock().await;
        let remaining = self.remove_handler(room_id, id);
        if remaining == 0 {
            self.stop_reader(&mut state, room_id).await;
        }
        debug!(room_id, ?id, remaining, "Video subscriber removed");
    }

    fn remove_handler(&self, room_id: i32, id: SubscriptionId) -> usize {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(handlers) = subs.get_mut(&room_id) {
            handlers.retain(|(sid, _)| *sid != id);
            let len = handlers.len();
            if len == 0 {
                subs.remove(&room_id);
            }
            len
        } else {
            0
        }
    }

    pub async fn refresh_rooms(&self) -> anyhow::Result<()> {
        let fresh: HashMap<i32, Room> = self
            .inner
            .rooms_repo
            .list()
            .await
            .context("Failed to list rooms")?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let mut state = self.inner.state.lock().await;
        let running: Vec<i32> = state.readers.keys().copied().collect();
        for room_id in running {
            match fresh.get(&room_id) {
                None => {
                    info!(room_id, "Room removed, stopping video reader");
                    self.stop_reader(&mut state, room_id).await;
                }
                Some(room) if !room.video_ready() => {
                    info!(room_id, "Video disabled, stopping reader");
                    self.stop_reader(&mut state, room_id).await;
                }
                Some(room) => {
                    let source_key = room.source_key().unwrap_or_default().to_string();
                    let changed = state
                        .readers
                        .get(&room_id)
                        .is_some_and(|entry| entry.source_key != source_key);
                    if changed {
                        info!(room_id, "Source changed, restarting video reader");
                        self.stop_reader(&mut state, room_id).await;
                        let room = room.clone();
                        if let Err(e) = self.start_reader(&mut state, &room).await {
                            error!(room_id, "Failed to restart video reader: {e:#}");
                        }
                    }
                }
            }
        }
        state.rooms = fresh;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        let running: Vec<i32> = state.readers.keys().copied().collect();
        for room_id in running {
            self.stop_reader(&mut state, room_id).await;
        }
    }

    async fn start_reader(&self, state: &mut VideoState, room: &Room) -> anyhow::Result<()> {
        state.generation += 1;
        let generation = state.generation;
        let subscribers = Arc::clone(&self.inner.subscribers);

        let entry = match room.stream_source_type {
            StreamSourceType::Rtsp => {
                let url = room
                    .camera_stream_url
                    .clone()
                    .context("RTSP room without camera URL")?;
                let (tx, rx) = mpsc::channel(8);
                let reader = RtspVideoReader::spawn(
                    room.id,
                    url.clone(),
                    room.camera_credentials.clone(),
                    tx,
                );
                let pump = tokio::spawn(run_rtsp_pump(room.id, rx, subscribers));
                ReaderEntry {
                    reader: ReaderKind::Rtsp(reader),
                    source_key: url,
                    pump,
                    generation,
                }
            }
            StreamSourceType::GoogleNest => {
                let client = self
                    .inner
                    .nest_client
                    .clone()
                    .context("Nest room configured but no SDM client available")?;
                let device_id = room
                    .nest_device_id
                    .clone()
                    .context("Nest room without device id")?;
                let room_id = room.id;
                let spawn_device = device_id.clone();
                let reader = self
                    .inner
                    .nest_manager
                    .get_or_create(room_id, || {
                        NestStreamReader::spawn(room_id, spawn_device, client)
                    })
                    .await;
                let rx = reader.subscribe_video();
                let pump = tokio::spawn(run_nest_pump(room.id, rx, subscribers));
                ReaderEntry {
                    reader: ReaderKind::Nest,
                    source_key: device_id,
                    pump,
                    generation,
                }
            }
        };

        info!(room_id = room.id, source = %entry.source_key, "Video reader started");
        state.readers.insert(room.id, entry);
        Ok(())
    }

    async fn stop_reader(&self, state: &mut VideoState, room_id: i32) {
        if let Some(entry) = state.readers.remove(&room_id) {
            match entry.reader {
                ReaderKind::Rtsp(reader) => reader.stop(),
                ReaderKind::Nest => self.inner.nest_manager.release(room_id).await,
            }
            entry.pump.abort();
            info!(room_id, "Video reader stopped");
        }
    }

    #[cfg(test)]
    async fn reader_generation(&self, room_id: i32) -> Option<u64> {
        self.inner
            .state
            .lock()
            .await
            .readers
            .get(&room_id)
            .map(|e| e.generation)
    }

    #[cfg(test)]
    fn subscriber_count(&self, room_id: i32) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&room_id)
            .map(|h| h.len())
            .unwrap_or(0)
    }
}

async fn run_rtsp_pump(room_id: i32, mut rx: mpsc::Receiver<VideoFrame>, subscribers: Subscribers) {
    while let Some(frame) = rx.recv().await {
        dispatch(&subscribers, room_id, &frame);
    }
    debug!(room_id, "RTSP video pump ended");
}

async fn run_nest_pump(
    room_id: i32,
    mut rx: broadcast::Receiver<VideoFrame>,
    subscribers: Subscribers,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => dispatch(&subscribers, room_id, &frame),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(room_id, skipped = n, "Video pump lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(room_id, "Nest video pump ended");
}

fn dispatch(subscribers: &Subscribers, room_id: i32, frame: &VideoFrame) {
    let handlers: Vec<(SubscriptionId, VideoHandler)> = {
        let subs = subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(&room_id).cloned().unwrap_or_default()
    };
    for (id, handler) in handlers {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(frame))).is_err() {
            error!(room_id, ?id, "Video subscriber panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRoomRepository;

    fn video_room(id: i32, url: &str) -> Room {
        Room {
            id,
            name: format!("room-{id}"),
            stream_source_type: StreamSourceType::Rtsp,
            enable_audio_stream: false,
            enable_video_stream: true,
            camera_stream_url: Some(url.to_string()),
            camera_credentials: None,
            nest_device_id: None,
        }
    }

    async fn service_with(rooms: Vec<Room>) -> (VideoStreamingService, Arc<MemoryRoomRepository>) {
        let repo = Arc::new(MemoryRoomRepository::new(rooms));
        let service = VideoStreamingService::new(
            repo.clone(),
            Arc::new(NestStreamReaderManager::new()),
            None,
        );
        service.refresh_rooms().await.unwrap();
        (service, repo)
    }

    fn noop_handler() -> VideoHandler {
        Arc::new(|_frame: &VideoFrame| {})
    }

    #[tokio::test]
    async fn subscribe_lifecycle_mirrors_audio_service() {
        let (service, _) = service_with(vec![video_room(1, "rtsp://127.0.0.1:1/none")]).await;
        let err = service.subscribe(9, noop_handler()).await.unwrap_err();
        assert!(matches!(err, StreamingError::RoomNotFound(9)));

        let id = service.subscribe(1, noop_handler()).await.unwrap();
        assert!(service.has_reader(1).await);
        service.unsubscribe(1, id).await;
        assert!(!service.has_reader(1).await);
    }

    #[tokio::test]
    async fn audio_only_room_is_not_video_streamable() {
        let mut room = video_room(1, "rtsp://127.0.0.1:1/none");
        room.enable_video_stream = false;
        room.enable_audio_stream = true;
        let (service, _) = service_with(vec![room]).await;
        let err = service.subscribe(1, noop_handler()).await.unwrap_err();
        assert!(matches!(err, StreamingError::NotStreamable(1)));
    }

    #[tokio::test]
    async fn refresh_restarts_on_source_change_only() {
        let (service, repo) = service_with(vec![video_room(1, "rtsp://127.0.0.1:1/old")]).await;
        let _id = service.subscribe(1, noop_handler()).await.unwrap();
        let before = service.reader_generation(1).await.unwrap();

        service.refresh_rooms().await.unwrap();
        assert_eq!(service.reader_generation(1).await, Some(before));

        repo.update(video_room(1, "rtsp://127.0.0.1:1/new"))
            .await
            .unwrap();
        service.refresh_rooms().await.unwrap();
        assert_ne!(service.reader_generation(1).await, Some(before));
        assert_eq!(service.subscriber_count(1), 1);
    }
}
