//! Google Nest integration: SDM REST client, WebRTC stream reader with
//! keep-alive and reconnect, RTP depacketization, and the reference-counted
//! reader registry.

pub mod candidate;
pub mod client;
pub mod depacketize;
pub mod manager;
pub mod reader;

pub use client::{
    FileTokenProvider, NestApiError, NestDevice, NestDeviceClient, StaticTokenProvider,
    TokenProvider, WebRtcSession,
};
pub use manager::NestStreamReaderManager;
pub use reader::{NestAudioPacket, NestStreamReader};
