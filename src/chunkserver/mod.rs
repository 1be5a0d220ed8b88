//! The Chunk Server: owns an address, a data directory, and a byte budget
//! (§4.2).

pub mod handlers;
pub mod state;

pub use state::{default_server_id, ChunkServerState};
