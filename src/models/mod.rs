//! Data models for rooms, connections, presence, voice and wire events.

pub mod connection;
pub mod event;
pub mod presence;
pub mod room;
pub mod voice;

pub use connection::*;
pub use event::*;
pub use presence::*;
pub use room::*;
pub use voice::*;
