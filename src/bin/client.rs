use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

use rustfs::client::Client;
use rustfs::config::load_config;
use rustfs::logging;

#[derive(Parser, Debug)]
#[command(name = "client", about = "GFS-style client")]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long, default_value_t = 0.0)]
    x: f64,
    #[arg(long, default_value_t = 0.0)]
    y: f64,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Upload a local file to the given GFS path.
    Upload { local_path: String, gfs_path: String },
    /// Download a GFS path to a local file.
    Download { gfs_path: String, local_path: String },
    /// Append the contents of a local file to a GFS path.
    Append { gfs_path: String, local_path: String },
    /// List every known file path.
    ListFiles,
}

fn default_client_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();
    format!("client_{now}")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let _guard = logging::init("client", &config.client.log_dir);

    let client_id = args.client_id.unwrap_or_else(default_client_id);
    let client = Arc::new(Client::new(
        client_id,
        (args.x, args.y),
        config.master.address(),
        config.client.upload_chunk_size,
    ));
    client.register().await?;

    match args.command {
        Cmd::Upload { local_path, gfs_path } => {
            client.upload_file(&local_path, &gfs_path).await?;
            println!("uploaded {local_path} to {gfs_path}");
        }
        Cmd::Download { gfs_path, local_path } => {
            client.download_file(&gfs_path, &local_path).await?;
            println!("downloaded {gfs_path} to {local_path}");
        }
        Cmd::Append { gfs_path, local_path } => {
            let data = tokio::fs::read(&local_path).await?;
            client.append(&gfs_path, &data).await?;
            println!("appended {local_path} to {gfs_path}");
        }
        Cmd::ListFiles => {
            for file in client.list_files().await? {
                println!("{file}");
            }
        }
    }

    Ok(())
}
