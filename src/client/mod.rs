//! The Client: chunks a local file, selects primaries via Master advice,
//! drives the two-phase append, and assembles downloads (§4.3). Ported
//! from `GFSClient`.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_bytes::ByteBuf;
use tokio::net::TcpStream;
use tokio::time::interval;

use crate::chunk::Chunk;
use crate::error::{GfsError, Result};
use crate::protocol::{Location, Request, Response};
use crate::wire::{receive_message, send_message};

const CLIENT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

pub struct Client {
    pub client_id: String,
    pub location: Location,
    pub master_addr: String,
    pub upload_chunk_size: u64,
}

impl Client {
    pub fn new(client_id: String, location: Location, master_addr: String, upload_chunk_size: u64) -> Self {
        Self {
            client_id,
            location,
            master_addr,
            upload_chunk_size,
        }
    }

    async fn connect_to_master(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(&self.master_addr).await?)
    }

    async fn connect_to_chunk_server(&self, address: &str) -> Result<TcpStream> {
        Ok(TcpStream::connect(address).await?)
    }

    async fn call_master(&self, request: &Request) -> Result<Response> {
        let mut conn = self.connect_to_master().await?;
        send_message(&mut conn, request).await?;
        receive_message(&mut conn)
            .await?
            .ok_or(GfsError::ConnectionClosed)
    }

    async fn call_chunk_server(&self, address: &str, request: &Request) -> Result<Response> {
        let mut conn = self.connect_to_chunk_server(address).await?;
        send_message(&mut conn, request).await?;
        receive_message(&mut conn)
            .await?
            .ok_or(GfsError::ConnectionClosed)
    }

    /// Registers this client with the Master, then starts the 30-second
    /// heartbeat loop in the background so the Master's 60-second
    /// client-liveness timeout has something to observe (§4.3 — a
    /// registered-but-silent client is a latent bug, not intentional).
    pub async fn register(self: &Arc<Self>) -> Result<()> {
        let response = self
            .call_master(&Request::RegisterClient {
                client_id: self.client_id.clone(),
                location: self.location,
            })
            .await?;
        if !response.is_ok() {
            return Err(GfsError::Remote(
                response.message.unwrap_or_else(|| "registration failed".to_string()),
            ));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_heartbeat_loop().await });
        Ok(())
    }

    async fn run_heartbeat_loop(&self) {
        let mut ticker = interval(Duration::from_secs(CLIENT_HEARTBEAT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let request = Request::ClientHeartbeat {
                client_id: self.client_id.clone(),
            };
            if let Err(e) = self.call_master(&request).await {
                tracing::warn!(error = %e, "failed to send client heartbeat");
            }
        }
    }

    async fn available_chunk_servers(&self) -> Result<Vec<String>> {
        let response = self
            .call_master(&Request::GetChunkServers {
                client_id: Some(self.client_id.clone()),
            })
            .await?;
        let servers = response.servers.unwrap_or_default();
        if servers.is_empty() {
            return Err(GfsError::Metadata("no chunk servers available".to_string()));
        }
        Ok(servers)
    }

    /// Tries each candidate server as primary for `chunk`, in order,
    /// falling through on `insufficient_space` or any transport error.
    async fn store_chunk_with_fallback(&self, chunk: &Chunk, candidates: &[String]) -> Option<String> {
        for server in candidates {
            let request = Request::StoreChunk {
                chunk_id: chunk.chunk_id.clone(),
                file_path: chunk.file_path.clone(),
                chunk_index: chunk.chunk_index,
                data: ByteBuf::from(chunk.data.clone()),
                client_id: Some(self.client_id.clone()),
                is_replica: false,
            };
            match self.call_chunk_server(server, &request).await {
                Ok(response) if response.is_ok() => return Some(server.clone()),
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        None
    }

    /// Splits `data` into fixed-size chunks and stores each through a
    /// primary chosen from the Master's ranked candidate list (§4.3).
    pub async fn upload_bytes(&self, data: &[u8], gfs_path: &str) -> Result<()> {
        let chunks = Chunk::split(data, gfs_path, self.upload_chunk_size);
        for chunk in &chunks {
            let candidates = self.available_chunk_servers().await?;
            let stored = self.store_chunk_with_fallback(chunk, &candidates).await;
            if stored.is_none() {
                return Err(GfsError::Metadata(format!(
                    "no servers available with sufficient space for chunk {}",
                    chunk.chunk_id
                )));
            }
        }
        Ok(())
    }

    pub async fn upload_file(&self, local_path: &str, gfs_path: &str) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        self.upload_bytes(&data, gfs_path).await
    }

    /// Downloads `gfs_path` by fetching metadata then, for each chunk in
    /// order, trying replicas in the order the Master returns them until
    /// one retrieval succeeds (§4.3).
    pub async fn download_file(&self, gfs_path: &str, local_path: &str) -> Result<()> {
        let response = self
            .call_master(&Request::GetFileMetadata {
                file_path: gfs_path.to_string(),
            })
            .await?;
        let metadata = response
            .metadata
            .ok_or_else(|| GfsError::Metadata(format!("unknown file: {gfs_path}")))?;

        let mut out = Vec::with_capacity(metadata.total_size as usize);
        for chunk_id in &metadata.chunk_ids {
            let response = self
                .call_master(&Request::GetChunkLocations {
                    file_path: gfs_path.to_string(),
                    chunk_id: chunk_id.clone(),
                })
                .await?;
            let locations = response.locations.unwrap_or_default();

            let mut data = None;
            for server in &locations {
                let request = Request::RetrieveChunk {
                    chunk_id: chunk_id.clone(),
                };
                match self.call_chunk_server(server, &request).await {
                    Ok(resp) if resp.is_ok() => {
                        data = resp.data.map(ByteBuf::into_vec);
                        break;
                    }
                    _ => continue,
                }
            }

            let data = data.ok_or_else(|| GfsError::Metadata(format!("no live replica for chunk {chunk_id}")))?;
            out.extend_from_slice(&data);
        }

        tokio::fs::write(local_path, &out).await?;
        Ok(())
    }

    pub async fn list_files(&self) -> Result<Vec<String>> {
        let response = self.call_master(&Request::ListFiles).await?;
        Ok(response.files.unwrap_or_default())
    }

    /// Appends `data` to `gfs_path`, creating the file via a fresh upload
    /// if it doesn't exist yet, splitting into a new chunk if the data
    /// would overflow the current last chunk, or else driving the
    /// two-phase append protocol on the last chunk (§4.3).
    pub async fn append(&self, gfs_path: &str, data: &[u8]) -> Result<()> {
        let response = self
            .call_master(&Request::GetFileMetadata {
                file_path: gfs_path.to_string(),
            })
            .await?;

        let Some(metadata) = response.metadata else {
            return self.upload_bytes(data, gfs_path).await;
        };

        let last_offset = metadata.last_chunk_offset;
        if last_offset + data.len() as u64 > self.upload_chunk_size {
            let chunk_index = metadata.chunk_ids.len() as u64;
            let chunk = Chunk::new(data.to_vec(), gfs_path, chunk_index);
            let candidates = self.available_chunk_servers().await?;
            let stored = self.store_chunk_with_fallback(&chunk, &candidates).await;
            if stored.is_none() {
                return Err(GfsError::Metadata(format!(
                    "no servers available with sufficient space for chunk {}",
                    chunk.chunk_id
                )));
            }
            return Ok(());
        }

        let Some(last_chunk_id) = metadata.last_chunk_id.clone() else {
            return self.upload_bytes(data, gfs_path).await;
        };
        let chunk_index = metadata.chunk_ids.len() as u64 - 1;
        self.append_to_chunk(gfs_path, &last_chunk_id, chunk_index, data, last_offset)
            .await
    }

    async fn append_to_chunk(
        &self,
        file_path: &str,
        chunk_id: &str,
        chunk_index: u64,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        let response = self
            .call_master(&Request::GetChunkLocations {
                file_path: file_path.to_string(),
                chunk_id: chunk_id.to_string(),
            })
            .await?;
        let locations = response.locations.unwrap_or_default();
        if locations.is_empty() {
            return Err(GfsError::Metadata(format!("no locations found for chunk {chunk_id}")));
        }

        let committed = self.two_phase_append(chunk_id, data, offset, &locations).await?;
        if !committed {
            return Err(GfsError::Protocol("two-phase append failed".to_string()));
        }

        let new_offset = offset + data.len() as u64;
        self.call_master(&Request::UpdateChunkOffset {
            file_path: file_path.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_index,
            offset: new_offset,
        })
        .await?;
        Ok(())
    }

    /// Drives prepare-then-commit across `locations[0]` (primary) and
    /// `locations[1..]` (replicas). Returns whether every participant
    /// committed; on any prepare failure, issues best-effort rollback to
    /// whichever participants did prepare (§4.3).
    async fn two_phase_append(
        &self,
        chunk_id: &str,
        data: &[u8],
        offset: u64,
        locations: &[String],
    ) -> Result<bool> {
        let txid = new_txid();
        let mut prepared = Vec::new();

        for server in locations {
            let request = Request::PrepareAppend {
                chunk_id: chunk_id.to_string(),
                data: ByteBuf::from(data.to_vec()),
                offset,
                txid: txid.clone(),
            };
            match self.call_chunk_server(server, &request).await {
                Ok(response) if response.is_ok() => prepared.push(server.clone()),
                Ok(response) => {
                    tracing::warn!(%server, message = ?response.message, "prepare_append failed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%server, error = %e, "prepare_append transport error");
                    break;
                }
            }
        }

        if prepared.len() != locations.len() {
            self.rollback(chunk_id, &txid, &prepared).await;
            return Ok(false);
        }

        let mut committed = Vec::new();
        for server in &prepared {
            let request = Request::CommitAppend {
                chunk_id: chunk_id.to_string(),
                txid: txid.clone(),
            };
            match self.call_chunk_server(server, &request).await {
                Ok(response) if response.is_ok() => committed.push(server.clone()),
                Ok(response) => {
                    tracing::error!(%server, message = ?response.message, "commit_append failed");
                }
                Err(e) => {
                    tracing::error!(%server, error = %e, "commit_append transport error");
                }
            }
        }

        Ok(committed.len() == locations.len())
    }

    async fn rollback(&self, chunk_id: &str, txid: &str, prepared: &[String]) {
        for server in prepared {
            let request = Request::RollbackAppend {
                chunk_id: chunk_id.to_string(),
                txid: txid.to_string(),
            };
            if let Err(e) = self.call_chunk_server(server, &request).await {
                tracing::warn!(%server, error = %e, "rollback_append transport error");
            }
        }
    }
}

fn new_txid() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis();
    millis.to_string()
}
