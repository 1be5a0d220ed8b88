//! The Master's process-global state, made explicit as an owner object
//! (§9: "re-architect as an explicit owner object passed to each request
//! handler"). Each registry keeps its own lock; the lock order required
//! when more than one is held is always **chunk-server → client →
//! replication-queue → file-metadata** (§5), enforced by always acquiring
//! locks in that textual order at call sites.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::file_store::FileStore;
use crate::location::{ClientPriorityTable, LocationGraph};
use crate::protocol::{Location, SpaceInfo};

#[derive(Debug, Clone)]
pub struct ChunkServerRegistration {
    pub last_heartbeat: u64,
    pub location: Location,
    pub space_info: Option<SpaceInfo>,
}

#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub last_heartbeat: u64,
    pub location: Location,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

pub struct MasterState {
    pub config: Config,
    pub chunk_servers: RwLock<HashMap<String, ChunkServerRegistration>>,
    pub clients: RwLock<HashMap<String, ClientRegistration>>,
    pub replication_queue: RwLock<HashSet<(String, String)>>,
    pub file_store: FileStore,
    pub location_graph: LocationGraph,
    pub client_priorities: ClientPriorityTable,
}

impl MasterState {
    pub async fn new(config: Config) -> crate::error::Result<Self> {
        let file_store = FileStore::load(
            std::path::Path::new(&config.master.metadata_dir),
            config.master.chunk_size,
        )
        .await?;
        Ok(Self {
            config,
            chunk_servers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            replication_queue: RwLock::new(HashSet::new()),
            file_store,
            location_graph: LocationGraph::new(),
            client_priorities: ClientPriorityTable::new(),
        })
    }

    /// Recomputes the priority table for every currently-registered client
    /// against every currently-registered chunk server. Called after a
    /// chunk server registers or heartbeats with fresh space info (§3).
    pub async fn refresh_all_client_priorities(&self) {
        let chunk_servers = self.chunk_servers.read().await;
        let clients = self.clients.read().await;

        let mut server_info = Vec::new();
        for (addr, reg) in chunk_servers.iter() {
            let space = reg.space_info.unwrap_or_default();
            server_info.push((addr.clone(), reg.location, space));
        }

        for (client_id, reg) in clients.iter() {
            self.client_priorities
                .update_priorities(client_id, reg.location, &server_info)
                .await;
        }
    }

    /// Active chunk-server addresses, in no particular order.
    pub async fn active_chunk_servers(&self) -> Vec<String> {
        self.chunk_servers.read().await.keys().cloned().collect()
    }
}
