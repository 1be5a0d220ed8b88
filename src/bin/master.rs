use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use rustfs::config::load_config;
use rustfs::logging;
use rustfs::master::{background, handlers, MasterState};
use rustfs::wire::{receive_message, send_message};

#[derive(Parser, Debug)]
#[command(name = "master", about = "Runs the GFS-style Master")]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let _guard = logging::init("master", &config.master.log_dir);

    let state = Arc::new(MasterState::new(config.clone()).await?);

    tokio::spawn(background::run_chunk_server_liveness_loop(state.clone()));
    tokio::spawn(background::run_client_liveness_loop(state.clone()));
    tokio::spawn(background::run_pending_replication_loop(state.clone()));

    let address = config.master.address();
    let listener = TcpListener::bind(&address).await?;
    tracing::info!(%address, "master listening");

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
