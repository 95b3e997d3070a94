//! Audio streaming service: per-room reader + processor lifecycle and frame
//! fan-out to subscribers, plus the process-wide sound-alert stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::Context;
use cradle_protocol::{
    AudioFrame, GlobalSettings, RawAudioFrame, Room, SoundAlert, StreamSourceType,
};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{AudioHandler, StreamingError, SubscriptionId, SubscriptionIds};
use crate::audio::AudioProcessor;
use crate::nest::{NestAudioPacket, NestDeviceClient, NestStreamReader, NestStreamReaderManager};
use crate::repo::{RoomRepository, SettingsRepository};
use crate::rtsp::RtspAudioReader;
use crate::unix_ms;

type Subscribers = Arc<RwLock<HashMap<i32, Vec<(SubscriptionId, AudioHandler)>>>>;

enum ReaderKind {
    Rtsp(RtspAudioReader),
    /// Lifetime managed by the shared reader manager; stopping releases the
    /// reference instead of dropping a reader we own.
    Nest,
}

struct ReaderEntry {
    reader: ReaderKind,
    source_key: String,
    pump: JoinHandle<()>,
    generation: u64,
}

struct AudioState {
    rooms: HashMap<i32, Room>,
    readers: HashMap<i32, ReaderEntry>,
    processors: HashMap<i32, Arc<AudioProcessor>>,
    settings: GlobalSettings,
    generation: u64,
}

pub struct AudioStreamingInner {
    rooms_repo: Arc<dyn RoomRepository>,
    settings_repo: Arc<dyn SettingsRepository>,
    nest_manager: Arc<NestStreamReaderManager>,
    nest_client: Option<Arc<NestDeviceClient>>,
    state: Mutex<AudioState>,
    subscribers: Subscribers,
    alerts_tx: broadcast::Sender<SoundAlert>,
    ids: SubscriptionIds,
}

#[derive(Clone)]
pub struct AudioStreamingService {
    inner: Arc<AudioStreamingInner>,
}

impl AudioStreamingService {
    pub fn new(
        rooms_repo: Arc<dyn RoomRepository>,
        settings_repo: Arc<dyn SettingsRepository>,
        nest_manager: Arc<NestStreamReaderManager>,
        nest_client: Option<Arc<NestDeviceClient>>,
        initial_settings: GlobalSettings,
    ) -> Self {
        let (alerts_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(AudioStreamingInner {
                rooms_repo,
                settings_repo,
                nest_manager,
                nest_client,
                state: Mutex::new(AudioState {
                    rooms: HashMap::new(),
                    readers: HashMap::new(),
                    processors: HashMap::new(),
                    settings: initial_settings,
                    generation: 0,
                }),
                subscribers: Arc::new(RwLock::new(HashMap::new())),
                alerts_tx,
                ids: SubscriptionIds::default(),
            }),
        }
    }

    /// Process-wide sound alert stream (one subscription per consumer).
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SoundAlert> {
        self.inner.alerts_tx.subscribe()
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

    /// Register a frame handler for the room, starting the reader if this
    /// is the first subscriber.
    pub async fn subscribe(
        &self,
        room_id: i32,
        handler: AudioHandler,
    ) -> Result<SubscriptionId, StreamingError> {
        let mut state = self.inner.state.lock().await;
        let room = state
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(StreamingError::RoomNotFound(room_id))?;
        if !room.audio_ready() {
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
        debug!(room_id, ?id, "Audio subscriber added");
        Ok(id)
    }

    /// Remove the handler; the reader stops once no subscribers remain.
    pub async fn unsubscribe(&self, room_id: i32, id: SubscriptionId) {
        let mut state = self.inner.state.lock().await;
        let remaining = self.remove_handler(room_id, id);
        if remaining == 0 {
            self.stop_reader(&mut state, room_id).await;
        }
        debug!(room_id, ?id, remaining, "Audio subscriber removed");
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

    /// Reload the room list and reconcile readers: stop rooms that vanished
    /// or lost audio, restart rooms whose source changed, refresh processor
    /// settings in place.
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
        let settings = self
            .inner
            .settings_repo
            .get()
            .await
            .context("Failed to load settings")?;

        let mut state = self.inner.state.lock().await;

        let running: Vec<i32> = state.readers.keys().copied().collect();
        for room_id in running {
            match fresh.get(&room_id) {
                None => {
                    info!(room_id, "Room removed, stopping audio reader");
                    self.stop_reader(&mut state, room_id).await;
                }
                Some(room) if !room.audio_ready() => {
                    info!(room_id, "Audio disabled, stopping reader");
                    self.stop_reader(&mut state, room_id).await;
                }
                Some(room) => {
                    let source_key = room.source_key().unwrap_or_default().to_string();
                    let changed = state
                        .readers
                        .get(&room_id)
                        .is_some_and(|entry| entry.source_key != source_key);
                    if changed {
                        info!(room_id, "Source changed, restarting audio reader");
                        self.stop_reader(&mut state, room_id).await;
                        let room = room.clone();
                        if let Err(e) = self.start_reader(&mut state, &room).await {
                            error!(room_id, "Failed to restart audio reader: {e:#}");
                        }
                    }
                }
            }
        }

        state.rooms = fresh;
        state.settings = settings.clone();
        for processor in state.processors.values() {
            processor.update_settings(settings.clone());
        }
        Ok(())
    }

    /// Push new settings into every live processor without a repository
    /// round trip (hub hot-reload path).
    pub async fn update_settings(&self, settings: GlobalSettings) {
        let mut state = self.inner.state.lock().await;
        state.settings = settings.clone();
        for processor in state.processors.values() {
            processor.update_settings(settings.clone());
        }
        info!("Audio settings updated");
    }

    /// Stop every reader (graceful shutdown).
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        let running: Vec<i32> = state.readers.keys().copied().collect();
        for room_id in running {
            self.stop_reader(&mut state, room_id).await;
        }
    }

    async fn start_reader(&self, state: &mut AudioState, room: &Room) -> anyhow::Result<()> {
        // Resolve the source configuration before committing any state, so
        // a misconfigured room leaves nothing behind.
        enum Source {
            Rtsp {
                url: String,
                credentials: Option<cradle_protocol::CameraCredentials>,
            },
            Nest {
                client: Arc<NestDeviceClient>,
                device_id: String,
            },
        }
        let source = match room.stream_source_type {
            StreamSourceType::Rtsp => Source::Rtsp {
                url: room
                    .camera_stream_url
                    .clone()
                    .context("RTSP room without camera URL")?,
                credentials: room.camera_credentials.clone(),
            },
            StreamSourceType::GoogleNest => Source::Nest {
                client: self
                    .inner
                    .nest_client
                    .clone()
                    .context("Nest room configured but no SDM client available")?,
                device_id: room
                    .nest_device_id
                    .clone()
                    .context("Nest room without device id")?,
            },
        };

        let settings = state.settings.clone();
        let processor = Arc::new(AudioProcessor::new(room.id, settings));
        state.processors.insert(room.id, Arc::clone(&processor));
        state.generation += 1;
        let generation = state.generation;

        let subscribers = Arc::clone(&self.inner.subscribers);
        let alerts_tx = self.inner.alerts_tx.clone();

        let entry = match source {
            Source::Rtsp { url, credentials } => {
                let (tx, rx) = mpsc::channel(32);
                let reader = RtspAudioReader::spawn(room.id, url.clone(), credentials, tx);
                let pump = tokio::spawn(run_rtsp_pump(
                    room.id, rx, processor, subscribers, alerts_tx,
                ));
                ReaderEntry {
                    reader: ReaderKind::Rtsp(reader),
                    source_key: url,
                    pump,
                    generation,
                }
            }
            Source::Nest { client, device_id } => {
                let room_id = room.id;
                let spawn_device = device_id.clone();
                let reader = self
                    .inner
                    .nest_manager
                    .get_or_create(room_id, || {
                        NestStreamReader::spawn(room_id, spawn_device, client)
                    })
                    .await;
                let rx = reader.subscribe_audio();
                let pump = tokio::spawn(run_nest_pump(
                    room.id, rx, processor, subscribers, alerts_tx,
                ));
                ReaderEntry {
                    reader: ReaderKind::Nest,
                    source_key: device_id,
                    pump,
                    generation,
                }
            }
        };

        info!(room_id = room.id, source = %entry.source_key, "Audio reader started");
        state.readers.insert(room.id, entry);
        Ok(())
    }

    async fn stop_reader(&self, state: &mut AudioState, room_id: i32) {
        if let Some(entry) = state.readers.remove(&room_id) {
            match entry.reader {
                ReaderKind::Rtsp(reader) => reader.stop(),
                ReaderKind::Nest => self.inner.nest_manager.release(room_id).await,
            }
            entry.pump.abort();
            state.processors.remove(&room_id);
            info!(room_id, "Audio reader stopped");
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

async fn run_rtsp_pump(
    room_id: i32,
    mut rx: mpsc::Receiver<RawAudioFrame>,
    processor: Arc<AudioProcessor>,
    subscribers: Subscribers,
    alerts_tx: broadcast::Sender<SoundAlert>,
) {
    while let Some(raw) = rx.recv().await {
        let timestamp_ms = unix_ms();
        let processed = processor.process_raw(&raw, Instant::now(), timestamp_ms);
        if let Some(alert) = processed.alert {
            info!(room_id, level_db = alert.level_db, "Sound threshold exceeded");
            let _ = alerts_tx.send(alert);
        }
        let frame = AudioFrame {
            room_id,
            pcm_data: processed.pcm,
            audio_level_db: processed.level_db,
            sample_rate: raw.sample_rate,
            channels: raw.channels,
            timestamp_ms,
            raw_opus: None,
            duration_rtp_units: None,
        };
        dispatch(&subscribers, room_id, &frame);
    }
    debug!(room_id, "RTSP audio pump ended");
}

async fn run_nest_pump(
    room_id: i32,
    mut rx: broadcast::Receiver<NestAudioPacket>,
    processor: Arc<AudioProcessor>,
    subscribers: Subscribers,
    alerts_tx: broadcast::Sender<SoundAlert>,
) {
    loop {
        match rx.recv().await {
            Ok(packet) => {
                let timestamp_ms = unix_ms();
                let processed = processor.process_pcm_s16(&packet.pcm, Instant::now(), timestamp_ms);
                if let Some(alert) = processed.alert {
                    info!(room_id, level_db = alert.level_db, "Sound threshold exceeded");
                    let _ = alerts_tx.send(alert);
                }
                let frame = AudioFrame {
                    room_id,
                    pcm_data: packet.pcm,
                    audio_level_db: processed.level_db,
                    sample_rate: 48_000,
                    channels: 2,
                    timestamp_ms,
                    raw_opus: Some(packet.raw_opus),
                    duration_rtp_units: Some(packet.duration_rtp_units),
                };
                dispatch(&subscribers, room_id, &frame);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(room_id, skipped = n, "Audio pump lagged, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(room_id, "Nest audio pump ended");
}

/// Deliver the frame to every subscriber, isolating panics so one broken
/// handler cannot starve the rest.
fn dispatch(subscribers: &Subscribers, room_id: i32, frame: &AudioFrame) {
    let handlers: Vec<(SubscriptionId, AudioHandler)> = {
        let subs = subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(&room_id).cloned().unwrap_or_default()
    };
    for (id, handler) in handlers {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(frame))).is_err() {
            error!(room_id, ?id, "Audio subscriber panicked");
        }
    }
}
