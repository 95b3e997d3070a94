//! Reference-counted registry of shared Nest readers, keyed by room.
//!
//! The audio and video streaming services both pull from the same camera
//! session; the manager makes sure exactly one reader exists per room and
//! that it is disposed when the last reference is released. A single mutex
//! serializes get/release/stop per key, so double-dispose is impossible.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::reader::NestStreamReader;

struct Entry {
    reader: Arc<NestStreamReader>,
    refs: usize,
}

#[derive(Default)]
pub struct NestStreamReaderManager {
    entries: Mutex<HashMap<i32, Entry>>,
}

impl NestStreamReaderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the room's reader, creating it with `make` if absent, and
    /// take a reference on it.
    pub async fn get_or_create<F>(&self, room_id: i32, make: F) -> Arc<NestStreamReader>
    where
        F: FnOnce() -> Arc<NestStreamReader>,
    {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(room_id).or_insert_with(|| {
            info!(room_id, "Creating shared Nest reader");
            Entry {
                reader: make(),
                refs: 0,
            }
        });
        entry.refs += 1;
        debug!(room_id, refs = entry.refs, "Nest reader reference acquired");
        Arc::clone(&entry.reader)
    }

    /// Drop one reference; the reader is stopped and removed when the count
    /// reaches zero.
    pub async fn release(&self, room_id: i32) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&room_id) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        debug!(room_id, refs = entry.refs, "Nest reader reference released");
        if entry.refs == 0 {
            let entry = entries.remove(&room_id).expect("entry present");
            entry.reader.stop();
            info!(room_id, "Shared Nest reader disposed");
        }
    }

    /// Dispose the reader regardless of outstanding references (room
    /// removed or reconfigured).
    pub async fn stop(&self, room_id: i32) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&room_id) {
            entry.reader.stop();
            info!(room_id, "Shared Nest reader force-stopped");
        }
    }

    pub async fn ref_count(&self, room_id: i32) -> usize {
        let entries = self.entries.lock().await;
        entries.get(&room_id).map(|e| e.refs).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_get_reuses_reader_and_bumps_count() {
        let manager = NestStreamReaderManager::new();
        let first = manager
            .get_or_create(1, || NestStreamReader::detached(1))
            .await;
        let second = manager
            .get_or_create(1, || panic!("factory must not run twice"))
            .await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.ref_count(1).await, 2);
    }

    #[tokio::test]
    async fn release_to_zero_disposes_reader() {
        let manager = NestStreamReaderManager::new();
        let reader = manager
            .get_or_create(2, || NestStreamReader::detached(2))
            .await;
        manager
            .get_or_create(2, || NestStreamReader::detached(2))
            .await;

        manager.release(2).await;
        assert_eq!(manager.ref_count(2).await, 1);
        assert!(!reader.is_stopped());

        manager.release(2).await;
        assert_eq!(manager.ref_count(2).await, 0);
        assert!(reader.is_stopped());
    }

    #[tokio::test]
    async fn release_of_unknown_room_is_a_noop() {
        let manager = NestStreamReaderManager::new();
        manager.release(99).await;
        assert_eq!(manager.ref_count(99).await, 0);
    }

    #[tokio::test]
    async fn force_stop_ignores_reference_count() {
        let manager = NestStreamReaderManager::new();
        let reader = manager
            .get_or_create(3, || NestStreamReader::detached(3))
            .await;
        manager
            .get_or_create(3, || NestStreamReader::detached(3))
            .await;

        manager.stop(3).await;
        assert!(reader.is_stopped());
        assert_eq!(manager.ref_count(3).await, 0);
    }

    #[tokio::test]
    async fn rooms_are_independent() {
        let manager = NestStreamReaderManager::new();
        let a = manager
            .get_or_create(1, || NestStreamReader::detached(1))
            .await;
        let b = manager
            .get_or_create(2, || NestStreamReader::detached(2))
            .await;
        manager.release(1).await;
        assert!(a.is_stopped());
        assert!(!b.is_stopped());
    }
}
