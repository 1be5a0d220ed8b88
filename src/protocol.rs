//! Wire types shared by Master, Chunk Server, and Client.
//!
//! Every exchange is one [`Request`] followed by one [`Response`], framed by
//! [`crate::wire`]. `heartbeat` and `client_heartbeat` are one-way in
//! principle but still receive an ack `Response` for uniformity.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::HashMap;

pub type Location = (f64, f64);

/// Per-path metadata held by the Master. Field shapes match §3 exactly;
/// `pending_replication` is an explicit field here (in the Python original
/// it was attached dynamically after construction).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FileMetadata {
    pub file_path: String,
    pub total_size: u64,
    pub chunk_ids: Vec<String>,
    pub chunk_locations: HashMap<String, Vec<String>>,
    pub chunk_offsets: HashMap<String, u64>,
    pub last_chunk_id: Option<String>,
    pub last_chunk_offset: u64,
    pub pending_replication: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct SpaceInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    ChunkServer,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub node_type: NodeType,
    pub location: Location,
    pub space_info: Option<SpaceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub active_clients: Vec<String>,
    /// Present only when the request named a `client_id`: that client's
    /// priority-ranked server ids.
    pub client_priorities: Option<Vec<String>>,
}

/// Every request carries a `command` discriminant plus command-specific
/// fields, matching the `{command: <string>, ...}` envelope from §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    // --- Master operations ---
    RegisterChunkServer {
        address: String,
        location: Location,
    },
    Heartbeat {
        address: String,
        space_info: SpaceInfo,
    },
    RegisterClient {
        client_id: String,
        location: Location,
    },
    ClientHeartbeat {
        client_id: String,
    },
    GetChunkServers {
        client_id: Option<String>,
    },
    GetReplicaLocations {
        client_id: Option<String>,
        excluding: Vec<String>,
        needed: usize,
    },
    AddFile {
        file_path: String,
        total_size: u64,
        chunk_ids: Vec<String>,
    },
    UpdateFileMetadata {
        file_path: String,
        chunk_id: String,
        locations: Vec<String>,
        chunk_size: u64,
        pending_replication: bool,
    },
    UpdateChunkLocations {
        file_path: String,
        chunk_id: String,
        locations: Vec<String>,
    },
    UpdateChunkOffset {
        file_path: String,
        chunk_id: String,
        chunk_index: u64,
        offset: u64,
    },
    GetChunkLocations {
        file_path: String,
        chunk_id: String,
    },
    GetFileMetadata {
        file_path: String,
    },
    ListFiles,
    GetGraphData {
        client_id: Option<String>,
    },

    // --- Chunk Server operations ---
    StoreChunk {
        chunk_id: String,
        file_path: String,
        chunk_index: u64,
        data: ByteBuf,
        client_id: Option<String>,
        is_replica: bool,
    },
    RetrieveChunk {
        chunk_id: String,
    },
    DeleteChunk {
        chunk_id: String,
    },
    CheckSpace {
        size: u64,
    },
    PrepareAppend {
        chunk_id: String,
        data: ByteBuf,
        offset: u64,
        txid: String,
    },
    CommitAppend {
        chunk_id: String,
        txid: String,
    },
    RollbackAppend {
        chunk_id: String,
        txid: String,
    },
    AppendChunk {
        chunk_id: String,
        file_path: String,
        data: ByteBuf,
        offset: u64,
        is_replica: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// The `{status: "ok" | "error", message?, ...}` response envelope. Unused
/// fields for a given command are simply `None`; this keeps one concrete
/// type for every reply instead of one enum variant per command times two
/// (ok/error) outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub status: Status,
    pub message: Option<String>,
    pub servers: Option<Vec<String>>,
    pub locations: Option<Vec<String>>,
    pub metadata: Option<FileMetadata>,
    pub files: Option<Vec<String>>,
    pub graph_data: Option<GraphData>,
    pub chunk_id: Option<String>,
    pub replicas: Option<usize>,
    pub data: Option<ByteBuf>,
    pub available_space: Option<u64>,
    pub new_offset: Option<u64>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn insufficient_space(available: u64) -> Self {
        Self {
            status: Status::Error,
            message: Some("insufficient_space".to_string()),
            available_space: Some(available),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}
