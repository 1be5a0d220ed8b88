//! TOML configuration, one struct per `[section]`, matching §6/§10.6 of the
//! specification. Fields are exactly those the three binaries need; no
//! authentication, sharding, or shadow-master fields are carried forward.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub chunk_size: u64,
    pub replication_factor: usize,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChunkServerConfig {
    pub data_dir: String,
    pub heartbeat_interval: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    pub upload_chunk_size: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub master: MasterConfig,
    pub chunk_server: ChunkServerConfig,
    pub client: ClientConfig,
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_metadata_dir() -> String {
    "data/metadata".to_string()
}

impl MasterConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}
