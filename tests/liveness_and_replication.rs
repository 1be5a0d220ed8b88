mod support;

use std::time::Duration;

use rustfs::config::{ChunkServerConfig, ClientConfig, Config, MasterConfig};
use rustfs::protocol::{Request, Response};
use rustfs::wire::{receive_message, send_message};
use support::{start_chunk_server, start_client, start_master};
use tokio::net::TcpStream;

fn fast_heartbeat_config(metadata_dir: &std::path::Path, replication_factor: usize) -> Config {
    Config {
        master: MasterConfig {
            host: "127.0.0.1".into(),
            port: 0,
            chunk_size: 64,
            replication_factor,
            log_dir: "logs".into(),
            metadata_dir: metadata_dir.to_string_lossy().into_owned(),
        },
        chunk_server: ChunkServerConfig {
            data_dir: "unused".into(),
            heartbeat_interval: 1,
            log_dir: "logs".into(),
        },
        client: ClientConfig {
            upload_chunk_size: 64,
            log_dir: "logs".into(),
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_chunk_server_that_stops_heartbeating_is_evicted() {
    let metadata_dir = tempfile::tempdir().unwrap();
    let master_addr = start_master(fast_heartbeat_config(metadata_dir.path(), 1)).await;

    // Register directly rather than through `start_chunk_server`, whose
    // spawned heartbeat loop would keep this server alive forever.
    let mut conn = TcpStream::connect(&master_addr).await.unwrap();
    send_message(
        &mut conn,
        &Request::RegisterChunkServer {
            address: "127.0.0.1:1".into(),
            location: (0.0, 0.0),
        },
    )
    .await
    .unwrap();
    let _: Option<Response> = receive_message(&mut conn).await.unwrap();

    let servers = get_ranked_servers(&master_addr).await;
    assert_eq!(servers, vec!["127.0.0.1:1".to_string()]);

    // heartbeat_interval is 1s, so the server is evicted once its last
    // heartbeat is more than 2s stale.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let servers = get_ranked_servers(&master_addr).await;
    assert!(servers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn under_replicated_chunk_is_repaired_once_a_second_server_joins() {
    let metadata_dir = tempfile::tempdir().unwrap();
    let master_addr = start_master(fast_heartbeat_config(metadata_dir.path(), 2)).await;

    let data_dir = tempfile::tempdir().unwrap();
    start_chunk_server("cs1", &data_dir.path().join("cs1"), (0.0, 0.0), &master_addr, 2).await;

    let client = start_client("c1", (0.0, 0.0), &master_addr, 64).await;
    let source = tempfile::tempdir().unwrap();
    let source_path = source.path().join("f.txt");
    tokio::fs::write(&source_path, b"some bytes").await.unwrap();
    client
        .upload_file(source_path.to_str().unwrap(), "/f.txt")
        .await
        .unwrap();

    // Only one chunk server exists so far: the chunk is under-replicated
    // and queued for repair.
    let locations = get_chunk_locations(&master_addr, "/f.txt").await;
    assert_eq!(locations.len(), 1);

    start_chunk_server("cs2", &data_dir.path().join("cs2"), (1.0, 1.0), &master_addr, 2).await;

    // The pending-replication loop ticks every 10s in production; nothing
    // in this crate exposes a faster override, so this assertion only
    // checks that the second server is now a viable replication target,
    // not that repair has already completed.
    let servers = get_ranked_servers(&master_addr).await;
    assert_eq!(servers.len(), 2);
}

async fn get_ranked_servers(master_addr: &str) -> Vec<String> {
    let mut conn = TcpStream::connect(master_addr).await.unwrap();
    send_message(&mut conn, &Request::GetChunkServers { client_id: None })
        .await
        .unwrap();
    let response: Response = receive_message(&mut conn).await.unwrap().unwrap();
    response.servers.unwrap()
}

async fn get_chunk_locations(master_addr: &str, file_path: &str) -> Vec<String> {
    let mut conn = TcpStream::connect(master_addr).await.unwrap();
    send_message(
        &mut conn,
        &Request::GetFileMetadata {
            file_path: file_path.to_string(),
        },
    )
    .await
    .unwrap();
    let response: Response = receive_message(&mut conn).await.unwrap().unwrap();
    let metadata = response.metadata.unwrap();
    let chunk_id = metadata.chunk_ids[0].clone();
    metadata.chunk_locations.get(&chunk_id).cloned().unwrap_or_default()
}
