//! Coordination services: registry, rooms, presence, voice, signaling.

pub mod gateway;
pub mod presence;
pub mod registry;
pub mod room;
pub mod signaling;
pub mod voice;

pub use gateway::Gateway;
pub use presence::PresenceService;
pub use registry::{ConnectionRegistry, Outbound, RegistryStats};
pub use room::RoomService;
pub use signaling::SignalingRelay;
pub use voice::VoiceService;
