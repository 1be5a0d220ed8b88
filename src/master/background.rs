//! The Master's three long-lived background tasks: chunk-server liveness,
//! client liveness, and pending-replication repair (§4.1). Each is spawned
//! once from `src/bin/master.rs` and runs for the life of the process.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::time::interval;

use crate::protocol::{Request, Response};
use crate::wire::{receive_message, send_message};

use super::state::{now_secs, MasterState};

const CLIENT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
const CLIENT_LIVENESS_SWEEP_INTERVAL_SECS: u64 = 30;
const PENDING_REPLICATION_INTERVAL_SECS: u64 = 10;

/// Scans `chunk_servers` every `heartbeat_interval` seconds, evicting any
/// server whose last heartbeat is older than `2 * heartbeat_interval`.
/// Eviction removes the node from the registry and the location graph
/// under the same lock acquisition (§5: "atomic with respect to concurrent
/// placement queries").
pub async fn run_chunk_server_liveness_loop(state: Arc<MasterState>) {
    let heartbeat_interval = state.config.chunk_server.heartbeat_interval.max(1);
    let timeout = heartbeat_interval * 2;
    let mut ticker = interval(Duration::from_secs(heartbeat_interval));
    loop {
        ticker.tick().await;
        let now = now_secs();
        let dead: Vec<String> = {
            let mut chunk_servers = state.chunk_servers.write().await;
            let dead: Vec<String> = chunk_servers
                .iter()
                .filter(|(_, reg)| now.saturating_sub(reg.last_heartbeat) > timeout)
                .map(|(addr, _)| addr.clone())
                .collect();
            for addr in &dead {
                chunk_servers.remove(addr);
            }
            dead
        };
        for addr in dead {
            tracing::warn!(address = %addr, "chunk server heartbeat timed out, evicting");
            state.location_graph.remove_node(&addr).await;
        }
    }
}

/// Scans `clients` every 30 seconds, evicting any client whose last
/// heartbeat is older than 60 seconds (§4.1).
pub async fn run_client_liveness_loop(state: Arc<MasterState>) {
    let mut ticker = interval(Duration::from_secs(CLIENT_LIVENESS_SWEEP_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let now = now_secs();
        let dead: Vec<String> = {
            let mut clients = state.clients.write().await;
            let dead: Vec<String> = clients
                .iter()
                .filter(|(_, reg)| now.saturating_sub(reg.last_heartbeat) > CLIENT_HEARTBEAT_TIMEOUT_SECS)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dead {
                clients.remove(id);
            }
            dead
        };
        for client_id in dead {
            tracing::warn!(%client_id, "client heartbeat timed out, evicting");
            state.location_graph.remove_node(&client_id).await;
            state.client_priorities.remove_client(&client_id).await;
        }
    }
}

/// Every 10 seconds, walks the replication queue and tries to bring each
/// under-replicated chunk back up to `replication_factor` (§4.1).
pub async fn run_pending_replication_loop(state: Arc<MasterState>) {
    let mut ticker = interval(Duration::from_secs(PENDING_REPLICATION_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let pending: Vec<(String, String)> = state.replication_queue.read().await.iter().cloned().collect();
        for (file_path, chunk_id) in pending {
            if let Err(e) = repair_one(&state, &file_path, &chunk_id).await {
                tracing::error!(%file_path, %chunk_id, error = %e, "pending replication attempt failed");
            }
        }
    }
}

async fn repair_one(state: &Arc<MasterState>, file_path: &str, chunk_id: &str) -> crate::error::Result<()> {
    let metadata = state.file_store.get_file_metadata(file_path).await;
    let Some(metadata) = metadata else {
        state.replication_queue.write().await.remove(&(file_path.to_string(), chunk_id.to_string()));
        return Ok(());
    };
    if !metadata.pending_replication.contains_key(chunk_id) {
        state.replication_queue.write().await.remove(&(file_path.to_string(), chunk_id.to_string()));
        return Ok(());
    }

    let replication_factor = state.config.master.replication_factor;
    let current_locations = metadata.chunk_locations.get(chunk_id).cloned().unwrap_or_default();
    if current_locations.len() >= replication_factor {
        state.file_store.clear_pending_replication(file_path, chunk_id).await?;
        state.replication_queue.write().await.remove(&(file_path.to_string(), chunk_id.to_string()));
        return Ok(());
    }
    let needed_replicas = replication_factor - current_locations.len();

    let Some(source) = current_locations.choose(&mut rand::thread_rng()).cloned() else {
        tracing::error!(%chunk_id, "no source locations for pending replication");
        return Ok(());
    };

    let active = state.active_chunk_servers().await;
    let current_set: std::collections::HashSet<&String> = current_locations.iter().collect();
    let mut candidates: Vec<String> = active
        .into_iter()
        .filter(|addr| !current_set.contains(addr))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(needed_replicas);

    if candidates.is_empty() {
        return Ok(());
    }

    let mut new_locations = current_locations.clone();
    for target in candidates {
        match fetch_and_forward(&source, &target, chunk_id, file_path).await {
            Ok(()) => {
                tracing::info!(%chunk_id, %source, %target, "repaired replica");
                new_locations.push(target);
            }
            Err(e) => {
                tracing::warn!(%chunk_id, %source, %target, error = %e, "replica repair attempt failed");
            }
        }
    }

    if new_locations.len() != current_locations.len() {
        state
            .file_store
            .update_chunk_locations(file_path, chunk_id, new_locations.clone())
            .await?;
        let still_needed = replication_factor.saturating_sub(new_locations.len());
        state
            .file_store
            .mark_pending_replication(file_path, chunk_id, still_needed)
            .await?;
        if still_needed == 0 {
            state.replication_queue.write().await.remove(&(file_path.to_string(), chunk_id.to_string()));
        }
    }

    Ok(())
}

async fn fetch_and_forward(
    source: &str,
    target: &str,
    chunk_id: &str,
    file_path: &str,
) -> crate::error::Result<()> {
    let mut source_conn = TcpStream::connect(source).await?;
    send_message(
        &mut source_conn,
        &Request::RetrieveChunk {
            chunk_id: chunk_id.to_string(),
        },
    )
    .await?;
    let response: Response = receive_message(&mut source_conn)
        .await?
        .ok_or(crate::error::GfsError::ConnectionClosed)?;
    if !response.is_ok() {
        return Err(crate::error::GfsError::Remote(
            response.message.unwrap_or_default(),
        ));
    }
    let data = response.data.ok_or_else(|| {
        crate::error::GfsError::Protocol("retrieve_chunk response missing data".to_string())
    })?;

    let mut target_conn = TcpStream::connect(target).await?;
    send_message(
        &mut target_conn,
        &Request::StoreChunk {
            chunk_id: chunk_id.to_string(),
            file_path: file_path.to_string(),
            chunk_index: 0,
            data,
            client_id: None,
            is_replica: true,
        },
    )
    .await?;
    let response: Response = receive_message(&mut target_conn)
        .await?
        .ok_or(crate::error::GfsError::ConnectionClosed)?;
    if !response.is_ok() {
        return Err(crate::error::GfsError::Remote(
            response.message.unwrap_or_default(),
        ));
    }
    Ok(())
}
