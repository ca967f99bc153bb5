use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub daemon: DaemonConfig,
    pub engine: EngineConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub bind_address: String,
    pub access_token: String,
    pub data_dir: PathBuf,
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("bind_address", &self.bind_address)
            .field("access_token", &"[REDACTED]")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    pub socket_path: PathBuf,
    /// In-container mount point for every server volume.
    #[serde(default = "default_container_root")]
    pub container_root: String,
}

fn default_container_root() -> String {
    "/home/container".to_string()
}

#[derive(Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            daemon: DaemonConfig {
                bind_address: std::env::var("PYLON_BIND")
                    .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
                access_token: std::env::var("PYLON_TOKEN")
                    .map_err(|_| "PYLON_TOKEN not set".to_string())?,
                data_dir: PathBuf::from(
                    std::env::var("PYLON_DATA_DIR")
                        .unwrap_or_else(|_| "/var/lib/pylon/volumes".to_string()),
                ),
            },
            engine: EngineConfig {
                socket_path: PathBuf::from(
                    std::env::var("PYLON_ENGINE_SOCKET")
                        .unwrap_or_else(|_| "/var/run/docker.sock".to_string()),
                ),
                container_root: default_container_root(),
            },
            remote: RemoteConfig {
                base_url: std::env::var("PYLON_REMOTE_URL")
                    .map_err(|_| "PYLON_REMOTE_URL not set".to_string())?,
                token: std::env::var("PYLON_REMOTE_TOKEN")
                    .map_err(|_| "PYLON_REMOTE_TOKEN not set".to_string())?,
            },
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
        })
    }
}
