//! Repository contracts for the external configuration store, plus in-memory
//! implementations used at startup (seeded from the TOML config) and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use cradle_protocol::{GlobalSettings, Room};
use tokio::sync::RwLock;

#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Room>>;
    async fn find(&self, id: i32) -> anyhow::Result<Option<Room>>;
    async fn create(&self, room: Room) -> anyhow::Result<Room>;
    /// Returns the updated room, or None if no room with that id exists.
    async fn update(&self, room: Room) -> anyhow::Result<Option<Room>>;
    async fn delete(&self, id: i32) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self) -> anyhow::Result<GlobalSettings>;
    async fn update(&self, settings: GlobalSettings) -> anyhow::Result<()>;
}

pub struct MemoryRoomRepository {
    rooms: RwLock<HashMap<i32, Room>>,
    next_id: AtomicI32,
}

impl MemoryRoomRepository {
    pub fn new(seed: Vec<Room>) -> Self {
        let max_id = seed.iter().map(|r| r.id).max().unwrap_or(0);
        let rooms = seed.into_iter().map(|r| (r.id, r)).collect();
        Self {
            rooms: RwLock::new(rooms),
            next_id: AtomicI32::new(max_id + 1),
        }
    }
}

#[async_trait]
impl RoomRepository for MemoryRoomRepository {
    async fn list(&self) -> anyhow::Result<Vec<Room>> {
        let rooms = self.rooms.read().await;
        let mut list: Vec<Room> = rooms.values().cloned().collect();
        list.sort_by_key(|r| r.id);
        Ok(list)
    }

    async fn find(&self, id: i32) -> anyhow::Result<Option<Room>> {
        Ok(self.rooms.read().await.get(&id).cloned())
    }

    async fn create(&self, mut room: Room) -> anyhow::Result<Room> {
        let mut rooms = self.rooms.write().await;
        if room.id <= 0 || rooms.contains_key(&room.id) {
            room.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }
        rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn update(&self, room: Room) -> anyhow::Result<Option<Room>> {
        let mut rooms = self.rooms.write().await;
        if !rooms.contains_key(&room.id) {
            return Ok(None);
        }
        rooms.insert(room.id, room.clone());
        Ok(Some(room))
    }

    async fn delete(&self, id: i32) -> anyhow::Result<bool> {
        Ok(self.rooms.write().await.remove(&id).is_some())
    }
}

pub struct MemorySettingsRepository {
    settings: RwLock<GlobalSettings>,
}

impl MemorySettingsRepository {
    pub fn new(initial: GlobalSettings) -> Self {
        Self {
            settings: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn get(&self) -> anyhow::Result<GlobalSettings> {
        Ok(self.settings.read().await.clone())
    }

    async fn update(&self, settings: GlobalSettings) -> anyhow::Result<()> {
        *self.settings.write().await = settings;
        Ok(())
    }
}
