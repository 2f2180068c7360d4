//! Database layer: pool and the voice-session store.

mod memory;
mod pool;
mod repositories;

pub use memory::MemoryVoiceSessionStore;
pub use pool::{create_pool, run_migrations, DbPool};
pub use repositories::*;
