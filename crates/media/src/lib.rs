pub mod audio;
pub mod nest;
pub mod peers;
pub mod repo;
pub mod rtsp;
pub mod streaming;

/// Unix epoch milliseconds. Frame and telemetry timestamps all use this.
pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
