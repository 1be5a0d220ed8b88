use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;

use rustfs::chunkserver::{default_server_id, handlers, ChunkServerState};
use rustfs::config::load_config;
use rustfs::logging;
use rustfs::protocol::{Request, Response};
use rustfs::wire::{receive_message, send_message};

#[derive(Parser, Debug)]
#[command(name = "chunkserver", about = "Runs a GFS-style Chunk Server")]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
    #[arg(long)]
    server_id: Option<String>,
    #[arg(long, default_value_t = 0.0)]
    x: f64,
    #[arg(long, default_value_t = 0.0)]
    y: f64,
    #[arg(long, default_value_t = 1024)]
    space_limit_mb: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let _guard = logging::init("chunk_server", &config.chunk_server.log_dir);

    let server_id = args.server_id.unwrap_or_else(default_server_id);
    let shared_data_dir = PathBuf::from(&config.chunk_server.data_dir);
    let data_dir = shared_data_dir.join(&server_id);
    tokio::fs::create_dir_all(&data_dir).await?;

    let port = ChunkServerState::existing_port(&shared_data_dir, &server_id)
        .await
        .unwrap_or(0);
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let port = listener.local_addr()?.port();
    let address = format!("127.0.0.1:{port}");

    ChunkServerState::persist_server_info(&shared_data_dir, &server_id, port, &data_dir).await?;

    let state = Arc::new(ChunkServerState {
        server_id: server_id.clone(),
        address: address.clone(),
        data_dir,
        space_limit: args.space_limit_mb * 1024 * 1024,
        location: (args.x, args.y),
        master_addr: config.master.address(),
        replication_factor: config.master.replication_factor,
    });

    register_with_master(&state).await?;
    tokio::spawn(run_heartbeat_loop(state.clone(), config.chunk_server.heartbeat_interval));

    tracing::info!(%server_id, %address, "chunk server listening");

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                let request = match receive_message(&mut socket).await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "failed to read request");
                        break;
                    }
                };
                let response = handlers::dispatch(&state, request).await;
                if let Err(e) = send_message(&mut socket, &response).await {
                    tracing::warn!(%peer, error = %e, "failed to write response");
                    break;
                }
            }
        });
    }
}

async fn register_with_master(state: &ChunkServerState) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = TcpStream::connect(&state.master_addr).await?;
    send_message(
        &mut conn,
        &Request::RegisterChunkServer {
            address: state.address.clone(),
            location: state.location,
        },
    )
    .await?;
    let _: Option<Response> = receive_message(&mut conn).await?;
    Ok(())
}

async fn run_heartbeat_loop(state: Arc<ChunkServerState>, heartbeat_interval: u64) {
    let mut ticker = interval(Duration::from_secs(heartbeat_interval.max(1)));
    loop {
        ticker.tick().await;
        let used = state.used_space().await.unwrap_or(0);
        let space_info = ChunkServerState::space_info(state.space_limit, used);
        let request = Request::Heartbeat {
            address: state.address.clone(),
            space_info,
        };
        let result: Result<(), Box<dyn std::error::Error>> = async {
            let mut conn = TcpStream::connect(&state.master_addr).await?;
            send_message(&mut conn, &request).await?;
            let _: Option<Response> = receive_message(&mut conn).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to send heartbeat to master");
        }
    }
}
