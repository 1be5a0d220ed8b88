//! The Chunk Server's wire commands: chain-store, two-phase append, the
//! legacy one-phase append, and plain retrieve/delete/check_space (§4.2).
//! Ported from `_handle_store_chunk`/`_handle_prepare_append`/
//! `_handle_commit_append`/`_handle_rollback_append`/`_handle_append_chunk`/
//! `_handle_retrieve_chunk`/`_handle_delete_chunk`/`_handle_check_space`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_bytes::ByteBuf;
use tokio::net::TcpStream;

use crate::chunk::Chunk;
use crate::protocol::{Request, Response};
use crate::wire::{receive_message, send_message};

use super::state::ChunkServerState;

pub async fn dispatch(state: &Arc<ChunkServerState>, request: Request) -> Response {
    match request {
        Request::StoreChunk {
            chunk_id,
            file_path,
            chunk_index,
            data,
            client_id,
            is_replica,
        } => {
            handle_store_chunk(state, chunk_id, file_path, chunk_index, data, client_id, is_replica)
                .await
        }
        Request::RetrieveChunk { chunk_id } => handle_retrieve_chunk(state, chunk_id).await,
        Request::DeleteChunk { chunk_id } => handle_delete_chunk(state, chunk_id).await,
        Request::CheckSpace { size } => handle_check_space(state, size).await,
        Request::PrepareAppend {
            chunk_id,
            data,
            offset,
            txid,
        } => handle_prepare_append(state, chunk_id, data, offset, txid).await,
        Request::CommitAppend { chunk_id, txid } => handle_commit_append(state, chunk_id, txid).await,
        Request::RollbackAppend { chunk_id, txid } => {
            handle_rollback_append(state, chunk_id, txid).await
        }
        Request::AppendChunk {
            chunk_id,
            file_path,
            data,
            offset,
            is_replica,
        } => handle_append_chunk(state, chunk_id, file_path, data, offset, is_replica).await,

        // Master-only commands never land on a chunk server's listener.
        Request::RegisterChunkServer { .. }
        | Request::Heartbeat { .. }
        | Request::RegisterClient { .. }
        | Request::ClientHeartbeat { .. }
        | Request::GetChunkServers { .. }
        | Request::GetReplicaLocations { .. }
        | Request::AddFile { .. }
        | Request::UpdateFileMetadata { .. }
        | Request::UpdateChunkLocations { .. }
        | Request::UpdateChunkOffset { .. }
        | Request::GetChunkLocations { .. }
        | Request::GetFileMetadata { .. }
        | Request::ListFiles
        | Request::GetGraphData { .. } => Response::error("not a chunk server operation".to_string()),
    }
}

fn new_txid() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis();
    millis.to_string()
}

async fn connect_to_master(state: &ChunkServerState) -> crate::error::Result<TcpStream> {
    Ok(TcpStream::connect(&state.master_addr).await?)
}

async fn connect_to_chunk_server(address: &str) -> crate::error::Result<TcpStream> {
    Ok(TcpStream::connect(address).await?)
}

async fn handle_store_chunk(
    state: &Arc<ChunkServerState>,
    chunk_id: String,
    file_path: String,
    chunk_index: u64,
    data: ByteBuf,
    client_id: Option<String>,
    is_replica: bool,
) -> Response {
    let chunk_size = data.len() as u64;

    match state.can_store_chunk(chunk_size).await {
        Ok(true) => {}
        Ok(false) => {
            let available = state.available_space().await.unwrap_or(0);
            return Response::insufficient_space(available);
        }
        Err(e) => return Response::error(e.to_string()),
    }

    if is_replica {
        let chunk = Chunk {
            chunk_id: chunk_id.clone(),
            file_path,
            chunk_index,
            data: data.into_vec(),
        };
        return match chunk.save_to_disk(&state.data_dir).await {
            Ok(()) => Response {
                chunk_id: Some(chunk_id),
                ..Response::ok()
            },
            Err(e) => Response::error(e.to_string()),
        };
    }

    // Primary path: fan out to replicas, then commit locally.
    let txid = new_txid();
    let data = data.into_vec();

    let needed = state.replication_factor.saturating_sub(1);
    let mut available_replicas = Vec::new();
    if needed > 0 {
        match request_replica_locations(state, client_id.as_deref(), needed).await {
            Ok(candidates) => {
                for replica in candidates {
                    if check_replica_space(&replica, chunk_size).await {
                        available_replicas.push(replica);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch replica locations from master");
            }
        }
    }

    let temp_path = Chunk::temp_path_for(&state.data_dir, &chunk_id, &txid);
    let final_path = Chunk::path_for(&state.data_dir, &chunk_id);

    if let Err(e) = tokio::fs::write(&temp_path, &data).await {
        return Response::error(e.to_string());
    }

    let mut successful_replicas = Vec::new();
    for replica in available_replicas {
        match store_on_replica(&replica, &chunk_id, &file_path, chunk_index, &data).await {
            Ok(()) => successful_replicas.push(replica),
            Err(e) => tracing::error!(%replica, error = %e, "failed to replicate chunk"),
        }
    }

    if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        let _ = tokio::fs::remove_file(&final_path).await;
        return Response::error(e.to_string());
    }

    let mut successful_servers = vec![state.address.clone()];
    successful_servers.extend(successful_replicas.iter().cloned());

    let pending_replication = successful_servers.len() < state.replication_factor;
    if let Err(e) = notify_master_update(
        state,
        &file_path,
        &chunk_id,
        successful_servers.clone(),
        chunk_size,
        pending_replication,
    )
    .await
    {
        tracing::error!(error = %e, "failed to notify master of new chunk metadata");
    }

    Response {
        chunk_id: Some(chunk_id),
        replicas: Some(successful_replicas.len()),
        ..Response::ok()
    }
}

async fn request_replica_locations(
    state: &ChunkServerState,
    client_id: Option<&str>,
    needed: usize,
) -> crate::error::Result<Vec<String>> {
    let mut conn = connect_to_master(state).await?;
    send_message(
        &mut conn,
        &Request::GetReplicaLocations {
            client_id: client_id.map(str::to_string),
            excluding: vec![state.address.clone()],
            needed,
        },
    )
    .await?;
    let response: Response = receive_message(&mut conn)
        .await?
        .ok_or(crate::error::GfsError::ConnectionClosed)?;
    Ok(response.locations.unwrap_or_default())
}

async fn check_replica_space(replica: &str, size: u64) -> bool {
    async {
        let mut conn = connect_to_chunk_server(replica).await?;
        send_message(&mut conn, &Request::CheckSpace { size }).await?;
        let response: Response = receive_message(&mut conn)
            .await?
            .ok_or(crate::error::GfsError::ConnectionClosed)?;
        Ok::<bool, crate::error::GfsError>(response.is_ok())
    }
    .await
    .unwrap_or(false)
}

async fn store_on_replica(
    replica: &str,
    chunk_id: &str,
    file_path: &str,
    chunk_index: u64,
    data: &[u8],
) -> crate::error::Result<()> {
    let mut conn = connect_to_chunk_server(replica).await?;
    send_message(
        &mut conn,
        &Request::StoreChunk {
            chunk_id: chunk_id.to_string(),
            file_path: file_path.to_string(),
            chunk_index,
            data: ByteBuf::from(data.to_vec()),
            client_id: None,
            is_replica: true,
        },
    )
    .await?;
    let response: Response = receive_message(&mut conn)
        .await?
        .ok_or(crate::error::GfsError::ConnectionClosed)?;
    if response.is_ok() {
        Ok(())
    } else {
        Err(crate::error::GfsError::Remote(
            response.message.unwrap_or_default(),
        ))
    }
}

async fn notify_master_update(
    state: &ChunkServerState,
    file_path: &str,
    chunk_id: &str,
    locations: Vec<String>,
    chunk_size: u64,
    pending_replication: bool,
) -> crate::error::Result<()> {
    let mut conn = connect_to_master(state).await?;
    send_message(
        &mut conn,
        &Request::UpdateFileMetadata {
            file_path: file_path.to_string(),
            chunk_id: chunk_id.to_string(),
            locations,
            chunk_size,
            pending_replication,
        },
    )
    .await?;
    let _: Option<Response> = receive_message(&mut conn).await?;
    Ok(())
}

async fn handle_retrieve_chunk(state: &Arc<ChunkServerState>, chunk_id: String) -> Response {
    match Chunk::load_from_disk(&state.data_dir, &chunk_id).await {
        Ok(data) => Response {
            data: Some(ByteBuf::from(data)),
            ..Response::ok()
        },
        Err(e) => Response::error(e.to_string()),
    }
}

async fn handle_delete_chunk(state: &Arc<ChunkServerState>, chunk_id: String) -> Response {
    let path = Chunk::path_for(&state.data_dir, &chunk_id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Response::ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Response::ok(),
        Err(e) => Response::error(e.to_string()),
    }
}

async fn handle_check_space(state: &Arc<ChunkServerState>, size: u64) -> Response {
    match state.can_store_chunk(size).await {
        Ok(true) => Response::ok(),
        Ok(false) => {
            let available = state.available_space().await.unwrap_or(0);
            Response::insufficient_space(available)
        }
        Err(e) => Response::error(e.to_string()),
    }
}

async fn handle_prepare_append(
    state: &Arc<ChunkServerState>,
    chunk_id: String,
    data: ByteBuf,
    offset: u64,
    txid: String,
) -> Response {
    let data = data.into_vec();
    let chunk_path = Chunk::path_for(&state.data_dir, &chunk_id);
    let temp_path = Chunk::temp_path_for(&state.data_dir, &chunk_id, &txid);

    let result = async {
        let mut buf = match tokio::fs::read(&chunk_path).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(crate::error::GfsError::from(e)),
        };
        let offset = offset as usize;
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(&data);
        tokio::fs::write(&temp_path, &buf).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => Response::ok(),
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Response::error(e.to_string())
        }
    }
}

async fn handle_commit_append(state: &Arc<ChunkServerState>, chunk_id: String, txid: String) -> Response {
    let chunk_path = Chunk::path_for(&state.data_dir, &chunk_id);
    let temp_path = Chunk::temp_path_for(&state.data_dir, &chunk_id, &txid);
    match tokio::fs::rename(&temp_path, &chunk_path).await {
        Ok(()) => Response::ok(),
        Err(e) => Response::error(format!("no prepared data found for commit: {e}")),
    }
}

async fn handle_rollback_append(state: &Arc<ChunkServerState>, chunk_id: String, txid: String) -> Response {
    let temp_path = Chunk::temp_path_for(&state.data_dir, &chunk_id, &txid);
    let _ = tokio::fs::remove_file(&temp_path).await;
    Response::ok()
}

async fn handle_append_chunk(
    state: &Arc<ChunkServerState>,
    chunk_id: String,
    file_path: String,
    data: ByteBuf,
    offset: u64,
    is_replica: bool,
) -> Response {
    let data = data.into_vec();
    let chunk_path = Chunk::path_for(&state.data_dir, &chunk_id);

    let new_offset = match tokio::fs::read(&chunk_path).await {
        Ok(mut existing) => {
            let current_size = existing.len() as u64;
            if offset != current_size {
                tracing::warn!(%chunk_id, expected = current_size, got = offset, "append offset mismatch");
            }
            existing.extend_from_slice(&data);
            if let Err(e) = tokio::fs::write(&chunk_path, &existing).await {
                return Response::error(e.to_string());
            }
            existing.len() as u64
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Err(e) = tokio::fs::write(&chunk_path, &data).await {
                return Response::error(e.to_string());
            }
            data.len() as u64
        }
        Err(e) => return Response::error(e.to_string()),
    };

    if !is_replica {
        if let Ok(replicas) = request_replica_locations(state, None, state.replication_factor.saturating_sub(1)).await {
            for replica in replicas {
                if let Err(e) = forward_append(&replica, &chunk_id, &file_path, &data, offset).await {
                    tracing::error!(%replica, error = %e, "failed to propagate append to replica");
                }
            }
        }
    }

    Response {
        new_offset: Some(new_offset),
        ..Response::ok()
    }
}

async fn forward_append(
    replica: &str,
    chunk_id: &str,
    file_path: &str,
    data: &[u8],
    offset: u64,
) -> crate::error::Result<()> {
    let mut conn = connect_to_chunk_server(replica).await?;
    send_message(
        &mut conn,
        &Request::AppendChunk {
            chunk_id: chunk_id.to_string(),
            file_path: file_path.to_string(),
            data: ByteBuf::from(data.to_vec()),
            offset,
            is_replica: true,
        },
    )
    .await?;
    let response: Response = receive_message(&mut conn)
        .await?
        .ok_or(crate::error::GfsError::ConnectionClosed)?;
    if response.is_ok() {
        Ok(())
    } else {
        Err(crate::error::GfsError::Remote(
            response.message.unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(dir: &std::path::Path) -> Arc<ChunkServerState> {
        Arc::new(ChunkServerState {
            server_id: "cs1".into(),
            address: "127.0.0.1:0".into(),
            data_dir: dir.to_path_buf(),
            space_limit: 1024,
            location: (0.0, 0.0),
            master_addr: "127.0.0.1:1".into(),
            replication_factor: 1,
        })
    }

    #[tokio::test]
    async fn prepare_then_commit_append_lands_the_new_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        tokio::fs::write(dir.path().join("c0"), b"HELL").await.unwrap();

        let resp = handle_prepare_append(
            &state,
            "c0".into(),
            ByteBuf::from(b"O".to_vec()),
            4,
            "tx1".into(),
        )
        .await;
        assert!(resp.is_ok());

        let resp = handle_commit_append(&state, "c0".into(), "tx1".into()).await;
        assert!(resp.is_ok());

        let data = tokio::fs::read(dir.path().join("c0")).await.unwrap();
        assert_eq!(data, b"HELLO");
    }

    #[tokio::test]
    async fn rollback_removes_the_temp_file_and_leaves_original_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        tokio::fs::write(dir.path().join("c0"), b"HELL").await.unwrap();

        handle_prepare_append(&state, "c0".into(), ByteBuf::from(b"O".to_vec()), 4, "tx1".into()).await;
        handle_rollback_append(&state, "c0".into(), "tx1".into()).await;

        assert!(!dir.path().join("c0.tx1.temp").exists());
        let data = tokio::fs::read(dir.path().join("c0")).await.unwrap();
        assert_eq!(data, b"HELL");
    }

    #[tokio::test]
    async fn check_space_reports_insufficient_when_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = handle_check_space(&state, 2048).await;
        assert!(!resp.is_ok());
        assert_eq!(resp.available_space, Some(1024));
    }

    #[tokio::test]
    async fn retrieve_missing_chunk_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = handle_retrieve_chunk(&state, "missing".into()).await;
        assert!(!resp.is_ok());
    }
}
