//! The 14 Master operations (§4.1), dispatched from one [`Request`] to one
//! [`Response`]. Ported one-to-one from the source's `_handle_*` methods,
//! generalized onto the typed wire protocol and the explicit `MasterState`
//! owner object.

use std::collections::HashSet;
use std::sync::Arc;

use crate::location::ServerDistance;
use crate::protocol::{NodeType, Request, Response};

use super::state::{now_secs, ChunkServerRegistration, ClientRegistration, MasterState};

pub async fn dispatch(state: &Arc<MasterState>, request: Request) -> Response {
    match request {
        Request::RegisterChunkServer { address, location } => {
            handle_register_chunk_server(state, address, location).await
        }
        Request::Heartbeat {
            address,
            space_info,
        } => handle_heartbeat(state, address, space_info).await,
        Request::RegisterClient { client_id, location } => {
            handle_register_client(state, client_id, location).await
        }
        Request::ClientHeartbeat { client_id } => handle_client_heartbeat(state, client_id).await,
        Request::GetChunkServers { client_id } => handle_get_chunk_servers(state, client_id).await,
        Request::GetReplicaLocations {
            client_id,
            excluding,
            needed,
        } => handle_get_replica_locations(state, client_id, excluding, needed).await,
        Request::AddFile {
            file_path,
            total_size,
            chunk_ids,
        } => handle_add_file(state, file_path, total_size, chunk_ids).await,
        Request::UpdateFileMetadata {
            file_path,
            chunk_id,
            locations,
            chunk_size,
            pending_replication,
        } => {
            handle_update_file_metadata(
                state,
                file_path,
                chunk_id,
                locations,
                chunk_size,
                pending_replication,
            )
            .await
        }
        Request::UpdateChunkLocations {
            file_path,
            chunk_id,
            locations,
        } => {
            let _ = state
                .file_store
                .update_chunk_locations(&file_path, &chunk_id, locations)
                .await;
            Response::ok()
        }
        Request::UpdateChunkOffset {
            file_path,
            chunk_id,
            chunk_index,
            offset,
        } => {
            match state
                .file_store
                .update_chunk_offset(&file_path, &chunk_id, chunk_index, offset)
                .await
            {
                Ok(()) => Response::ok(),
                Err(e) => Response::error(e.to_string()),
            }
        }
        Request::GetChunkLocations { file_path, chunk_id } => {
            let locations = state
                .file_store
                .get_chunk_locations(&file_path, &chunk_id)
                .await;
            Response {
                locations: Some(locations),
                ..Response::ok()
            }
        }
        Request::GetFileMetadata { file_path } => {
            let metadata = state.file_store.get_file_metadata(&file_path).await;
            Response {
                metadata,
                ..Response::ok()
            }
        }
        Request::ListFiles => {
            let files = state.file_store.list_files().await;
            Response {
                files: Some(files),
                ..Response::ok()
            }
        }
        Request::GetGraphData { client_id } => handle_get_graph_data(state, client_id).await,

        // Chunk-server-to-chunk-server / client-to-chunk-server commands
        // never land here; a chunk server and the Master are distinct
        // listeners. Present so the match stays exhaustive.
        Request::StoreChunk { .. }
        | Request::RetrieveChunk { .. }
        | Request::DeleteChunk { .. }
        | Request::CheckSpace { .. }
        | Request::PrepareAppend { .. }
        | Request::CommitAppend { .. }
        | Request::RollbackAppend { .. }
        | Request::AppendChunk { .. } => {
            Response::error("not a master operation".to_string())
        }
    }
}

async fn handle_register_chunk_server(
    state: &Arc<MasterState>,
    address: String,
    location: crate::protocol::Location,
) -> Response {
    {
        let mut chunk_servers = state.chunk_servers.write().await;
        chunk_servers.insert(
            address.clone(),
            ChunkServerRegistration {
                last_heartbeat: now_secs(),
                location,
                space_info: None,
            },
        );
    }
    state
        .location_graph
        .add_node(&address, location, NodeType::ChunkServer)
        .await;
    tracing::info!(%address, ?location, "registered chunk server");
    Response::ok()
}

async fn handle_heartbeat(
    state: &Arc<MasterState>,
    address: String,
    space_info: crate::protocol::SpaceInfo,
) -> Response {
    {
        let mut chunk_servers = state.chunk_servers.write().await;
        if let Some(reg) = chunk_servers.get_mut(&address) {
            reg.last_heartbeat = now_secs();
            reg.space_info = Some(space_info);
        } else {
            // A heartbeat from a server the Master doesn't know about yet
            // (e.g. restarted before its first registration landed) is
            // treated as an implicit registration at the origin.
            chunk_servers.insert(
                address.clone(),
                ChunkServerRegistration {
                    last_heartbeat: now_secs(),
                    location: (0.0, 0.0),
                    space_info: Some(space_info),
                },
            );
        }
    }
    state.location_graph.update_space_info(&address, space_info).await;
    state.refresh_all_client_priorities().await;
    Response::ok()
}

async fn handle_register_client(
    state: &Arc<MasterState>,
    client_id: String,
    location: crate::protocol::Location,
) -> Response {
    {
        let mut clients = state.clients.write().await;
        clients.insert(
            client_id.clone(),
            ClientRegistration {
                last_heartbeat: now_secs(),
                location,
            },
        );
    }
    state
        .location_graph
        .add_node(&client_id, location, NodeType::Client)
        .await;
    tracing::info!(%client_id, ?location, "registered client");
    Response::ok()
}

async fn handle_client_heartbeat(state: &Arc<MasterState>, client_id: String) -> Response {
    let mut clients = state.clients.write().await;
    if let Some(reg) = clients.get_mut(&client_id) {
        reg.last_heartbeat = now_secs();
    }
    Response::ok()
}

async fn handle_get_chunk_servers(state: &Arc<MasterState>, client_id: Option<String>) -> Response {
    let active = state.active_chunk_servers().await;
    let servers = match client_id {
        Some(client_id) => {
            let ranked = state
                .location_graph
                .get_nearest_chunk_servers(&client_id, active.len().max(1))
                .await;
            let active_set: HashSet<&String> = active.iter().collect();
            ranked
                .into_iter()
                .map(|sd: ServerDistance| sd.server_id)
                .filter(|id| active_set.contains(id))
                .collect()
        }
        None => active,
    };
    Response {
        servers: Some(servers),
        ..Response::ok()
    }
}

async fn handle_get_replica_locations(
    state: &Arc<MasterState>,
    client_id: Option<String>,
    excluding: Vec<String>,
    needed: usize,
) -> Response {
    let exclude: HashSet<String> = excluding.into_iter().collect();
    let locations = match client_id {
        Some(client_id) => {
            state
                .client_priorities
                .get_priority_servers(&client_id, &exclude, needed)
                .await
        }
        None => {
            let chunk_servers = state.chunk_servers.read().await;
            chunk_servers
                .keys()
                .filter(|id| !exclude.contains(*id))
                .take(needed)
                .cloned()
                .collect()
        }
    };
    Response {
        locations: Some(locations),
        ..Response::ok()
    }
}

async fn handle_add_file(
    state: &Arc<MasterState>,
    file_path: String,
    total_size: u64,
    chunk_ids: Vec<String>,
) -> Response {
    match state
        .file_store
        .add_file(&file_path, total_size, chunk_ids)
        .await
    {
        Ok(()) => Response::ok(),
        Err(e) => Response::error(e.to_string()),
    }
}

async fn handle_update_file_metadata(
    state: &Arc<MasterState>,
    file_path: String,
    chunk_id: String,
    locations: Vec<String>,
    chunk_size: u64,
    _pending_replication_hint: bool,
) -> Response {
    let existing = state.file_store.get_file_metadata(&file_path).await;
    let chunk_index = match &existing {
        Some(meta) => meta
            .chunk_ids
            .iter()
            .position(|id| id == &chunk_id)
            .unwrap_or(meta.chunk_ids.len()) as u64,
        None => 0,
    };

    let replication_factor = state.config.master.replication_factor;
    let still_pending = match state
        .file_store
        .update_file_metadata(
            &file_path,
            &chunk_id,
            chunk_index,
            locations,
            chunk_size,
            replication_factor,
        )
        .await
    {
        Ok(pending) => pending,
        Err(e) => return Response::error(e.to_string()),
    };

    if still_pending {
        let mut queue = state.replication_queue.write().await;
        queue.insert((file_path, chunk_id));
    }
    Response::ok()
}

async fn handle_get_graph_data(state: &Arc<MasterState>, client_id: Option<String>) -> Response {
    let active_clients = {
        let clients = state.clients.read().await;
        clients.keys().cloned().collect::<Vec<_>>()
    };
    let mut graph_data = state.location_graph.get_graph_data(&active_clients).await;
    if let Some(client_id) = client_id {
        graph_data.client_priorities = state.client_priorities.snapshot_ids(&client_id).await;
    }
    Response {
        graph_data: Some(graph_data),
        ..Response::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkServerConfig, ClientConfig, Config, MasterConfig};

    fn test_config(metadata_dir: &std::path::Path) -> Config {
        Config {
            master: MasterConfig {
                host: "127.0.0.1".into(),
                port: 0,
                chunk_size: 4,
                replication_factor: 2,
                log_dir: "logs".into(),
                metadata_dir: metadata_dir.to_string_lossy().into_owned(),
            },
            chunk_server: ChunkServerConfig {
                data_dir: "data".into(),
                heartbeat_interval: 5,
                log_dir: "logs".into(),
            },
            client: ClientConfig {
                upload_chunk_size: 4,
                log_dir: "logs".into(),
            },
        }
    }

    #[tokio::test]
    async fn register_then_get_chunk_servers_ranks_by_distance() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(MasterState::new(test_config(dir.path())).await.unwrap());

        dispatch(
            &state,
            Request::RegisterChunkServer {
                address: "a".into(),
                location: (1.0, 0.0),
            },
        )
        .await;
        dispatch(
            &state,
            Request::RegisterChunkServer {
                address: "b".into(),
                location: (100.0, 99.0),
            },
        )
        .await;
        dispatch(
            &state,
            Request::RegisterClient {
                client_id: "c1".into(),
                location: (0.0, 0.0),
            },
        )
        .await;

        let resp = dispatch(
            &state,
            Request::GetChunkServers {
                client_id: Some("c1".into()),
            },
        )
        .await;
        assert_eq!(resp.servers.unwrap()[0], "a");
    }

    #[tokio::test]
    async fn update_file_metadata_queues_pending_replication_when_short() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(MasterState::new(test_config(dir.path())).await.unwrap());

        let resp = dispatch(
            &state,
            Request::UpdateFileMetadata {
                file_path: "/f".into(),
                chunk_id: "c0".into(),
                locations: vec!["a".into()],
                chunk_size: 4,
                pending_replication: true,
            },
        )
        .await;
        assert!(resp.is_ok());
        assert_eq!(state.replication_queue.read().await.len(), 1);
    }
}
