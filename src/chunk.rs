//! The on-disk unit of storage. A chunk's identity is an opaque handle
//! generated once at creation, never recomputed from content — appends
//! mutate the bytes on disk in place without changing `chunk_id` (§9).

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub file_path: String,
    pub chunk_index: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(data: Vec<u8>, file_path: impl Into<String>, chunk_index: u64) -> Self {
        Self {
            chunk_id: Uuid::new_v4().to_string(),
            file_path: file_path.into(),
            chunk_index,
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn path_for(data_dir: &Path, chunk_id: &str) -> PathBuf {
        data_dir.join(chunk_id)
    }

    pub fn temp_path_for(data_dir: &Path, chunk_id: &str, txid: &str) -> PathBuf {
        data_dir.join(format!("{chunk_id}.{txid}.temp"))
    }

    pub async fn save_to_disk(&self, data_dir: &Path) -> Result<()> {
        let path = Self::path_for(data_dir, &self.chunk_id);
        tokio::fs::write(path, &self.data).await?;
        Ok(())
    }

    pub async fn load_from_disk(data_dir: &Path, chunk_id: &str) -> Result<Vec<u8>> {
        let path = Self::path_for(data_dir, chunk_id);
        let data = tokio::fs::read(path).await?;
        Ok(data)
    }

    /// Splits `data` into fixed-size chunks of `chunk_size` bytes, in order.
    /// The empty file splits into zero chunks.
    pub fn split(data: &[u8], file_path: &str, chunk_size: u64) -> Vec<Chunk> {
        if data.is_empty() {
            return Vec::new();
        }
        let chunk_size = chunk_size.max(1) as usize;
        data.chunks(chunk_size)
            .enumerate()
            .map(|(index, bytes)| Chunk::new(bytes.to_vec(), file_path, index as u64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_into_chunk_size_pieces_with_a_short_final_chunk() {
        let chunks = Chunk::split(b"HELLOWORLD", "/f", 4);
        let sizes: Vec<u64> = chunks.iter().map(Chunk::size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks[0].data, b"HELL");
        assert_eq!(chunks[2].data, b"LD");
    }

    #[test]
    fn empty_input_splits_into_no_chunks() {
        assert!(Chunk::split(b"", "/f", 4).is_empty());
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = Chunk::new(b"abc".to_vec(), "/f", 0);
        chunk.save_to_disk(dir.path()).await.unwrap();
        let loaded = Chunk::load_from_disk(dir.path(), &chunk.chunk_id)
            .await
            .unwrap();
        assert_eq!(loaded, b"abc");
    }
}
