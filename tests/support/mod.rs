use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustfs::chunkserver::{self, ChunkServerState};
use rustfs::client::Client;
use rustfs::config::{ChunkServerConfig, ClientConfig, Config, MasterConfig};
use rustfs::master::{self, background, MasterState};
use rustfs::protocol::{Location, Request, Response};
use rustfs::wire::{receive_message, send_message};
use tokio::net::TcpListener;

pub fn test_config(metadata_dir: &Path, chunk_size: u64, replication_factor: usize) -> Config {
    Config {
        master: MasterConfig {
            host: "127.0.0.1".into(),
            port: 0,
            chunk_size,
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
            upload_chunk_size: chunk_size,
            log_dir: "logs".into(),
        },
    }
}

/// Starts an in-process Master bound to an ephemeral port, with all three
/// background loops running, and returns its address.
pub async fn start_master(config: Config) -> String {
    let state = Arc::new(MasterState::new(config.clone()).await.unwrap());
    tokio::spawn(background::run_chunk_server_liveness_loop(state.clone()));
    tokio::spawn(background::run_client_liveness_loop(state.clone()));
    tokio::spawn(background::run_pending_replication_loop(state.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    let request = match receive_message(&mut socket).await {
                        Ok(Some(request)) => request,
                        _ => break,
                    };
                    let response = master::handlers::dispatch(&state, request).await;
                    if send_message(&mut socket, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    address
}

/// A running Chunk Server's address plus the handles needed to kill it
/// mid-test (for simulating a replica going down).
pub struct RunningChunkServer {
    pub address: String,
    heartbeat: tokio::task::JoinHandle<()>,
    listener: tokio::task::JoinHandle<()>,
}

impl RunningChunkServer {
    pub fn kill(&self) {
        self.heartbeat.abort();
        self.listener.abort();
    }
}

/// Starts an in-process Chunk Server bound to an ephemeral port, registers
/// it with `master_addr`, and starts its heartbeat loop.
pub async fn start_chunk_server(
    server_id: &str,
    data_dir: &Path,
    location: Location,
    master_addr: &str,
    replication_factor: usize,
) -> RunningChunkServer {
    tokio::fs::create_dir_all(data_dir).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let state = Arc::new(ChunkServerState {
        server_id: server_id.to_string(),
        address: address.clone(),
        data_dir: data_dir.to_path_buf(),
        space_limit: 64 * 1024 * 1024,
        location,
        master_addr: master_addr.to_string(),
        replication_factor,
    });

    {
        let mut conn = tokio::net::TcpStream::connect(master_addr).await.unwrap();
        send_message(
            &mut conn,
            &Request::RegisterChunkServer {
                address: state.address.clone(),
                location,
            },
        )
        .await
        .unwrap();
        let _: Option<Response> = receive_message(&mut conn).await.unwrap();
    }

    let heartbeat = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            loop {
                ticker.tick().await;
                let used = state.used_space().await.unwrap_or(0);
                let space_info = ChunkServerState::space_info(state.space_limit, used);
                let request = Request::Heartbeat {
                    address: state.address.clone(),
                    space_info,
                };
                if let Ok(mut conn) = tokio::net::TcpStream::connect(&state.master_addr).await {
                    let _ = send_message(&mut conn, &request).await;
                    let _: Result<Option<Response>, _> = receive_message(&mut conn).await;
                }
            }
        })
    };

    let listener_task = tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    let request = match receive_message(&mut socket).await {
                        Ok(Some(request)) => request,
                        _ => break,
                    };
                    let response = chunkserver::handlers::dispatch(&state, request).await;
                    if send_message(&mut socket, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    RunningChunkServer {
        address,
        heartbeat,
        listener: listener_task,
    }
}

pub async fn start_client(client_id: &str, location: Location, master_addr: &str, upload_chunk_size: u64) -> Arc<Client> {
    let client = Arc::new(Client::new(
        client_id.to_string(),
        location,
        master_addr.to_string(),
        upload_chunk_size,
    ));
    client.register().await.unwrap();
    client
}
