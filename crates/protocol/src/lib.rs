pub mod config;
pub mod frame;
pub mod messages;
pub mod room;

pub use config::*;
pub use frame::*;
pub use messages::*;
pub use room::*;
