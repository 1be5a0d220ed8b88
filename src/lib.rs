pub mod chunk;
pub mod chunkserver;
pub mod client;
pub mod config;
pub mod error;
pub mod file_store;
pub mod location;
pub mod logging;
pub mod master;
pub mod protocol;
pub mod wire;
