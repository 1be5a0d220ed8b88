//! Per-instance Chunk Server state: identity, data directory, and space
//! accounting (§4.2). Port reuse and `server_info.json` persistence are
//! ported from `_get_or_create_port`/`_save_server_info`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::Location;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfoEntry {
    pub port: u16,
    pub data_dir: String,
    pub last_start: u64,
}

pub struct ChunkServerState {
    pub server_id: String,
    pub address: String,
    pub data_dir: PathBuf,
    pub space_limit: u64,
    pub location: Location,
    pub master_addr: String,
    pub replication_factor: usize,
}

impl ChunkServerState {
    /// Reuses the port persisted for `server_id` in
    /// `<shared_data_dir>/server_info.json` if present; otherwise binds an
    /// ephemeral port by letting the caller pass 0 and reads back the
    /// actually-bound port. Persists the (possibly new) mapping either way,
    /// matching §4.2's restart-rebind guarantee.
    pub async fn server_info_path(shared_data_dir: &Path) -> PathBuf {
        shared_data_dir.join("server_info.json")
    }

    pub async fn existing_port(shared_data_dir: &Path, server_id: &str) -> Option<u16> {
        let path = Self::server_info_path(shared_data_dir).await;
        let bytes = tokio::fs::read(&path).await.ok()?;
        let info: HashMap<String, ServerInfoEntry> = serde_json::from_slice(&bytes).ok()?;
        info.get(server_id).map(|entry| entry.port)
    }

    pub async fn persist_server_info(
        shared_data_dir: &Path,
        server_id: &str,
        port: u16,
        data_dir: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(shared_data_dir).await?;
        let path = Self::server_info_path(shared_data_dir).await;
        let mut info: HashMap<String, ServerInfoEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or_default(),
            _ => HashMap::new(),
        };
        let last_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        info.insert(
            server_id.to_string(),
            ServerInfoEntry {
                port,
                data_dir: data_dir.to_string_lossy().into_owned(),
                last_start,
            },
        );
        let json = serde_json::to_vec_pretty(&info)
            .map_err(|e| crate::error::GfsError::Metadata(e.to_string()))?;
        tokio::fs::write(&path, json).await?;
        Ok(())
    }

    /// Sums the size of every regular file directly under `data_dir`
    /// (chunks and in-flight temp files both count against the budget,
    /// matching the source's unconditional `os.walk`-and-sum).
    pub async fn used_space(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    pub async fn available_space(&self) -> Result<u64> {
        let used = self.used_space().await?;
        Ok(self.space_limit.saturating_sub(used))
    }

    pub async fn can_store_chunk(&self, size: u64) -> Result<bool> {
        Ok(self.available_space().await? >= size)
    }

    pub fn space_info(total: u64, used: u64) -> crate::protocol::SpaceInfo {
        crate::protocol::SpaceInfo {
            total,
            used,
            available: total.saturating_sub(used),
        }
    }
}

pub fn default_server_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();
    format!("chunk_server_{now}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_and_recalls_the_same_port() {
        let dir = tempfile::tempdir().unwrap();
        ChunkServerState::persist_server_info(dir.path(), "cs1", 4242, dir.path())
            .await
            .unwrap();
        let port = ChunkServerState::existing_port(dir.path(), "cs1").await;
        assert_eq!(port, Some(4242));
    }

    #[tokio::test]
    async fn used_space_sums_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a"), b"1234").await.unwrap();
        tokio::fs::write(dir.path().join("b"), b"123").await.unwrap();
        let state = ChunkServerState {
            server_id: "cs1".into(),
            address: "127.0.0.1:0".into(),
            data_dir: dir.path().to_path_buf(),
            space_limit: 1024,
            location: (0.0, 0.0),
            master_addr: "127.0.0.1:1".into(),
            replication_factor: 2,
        };
        assert_eq!(state.used_space().await.unwrap(), 7);
        assert_eq!(state.available_space().await.unwrap(), 1017);
    }
}
