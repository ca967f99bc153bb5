use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::errors::{AgentError, AgentResult};
use crate::variables::VariableDefinition;

const CONFIG_FETCH_ATTEMPTS: u32 = 3;

/// Client for the control plane: token validation for console sessions
/// and the unit-configuration fetch that drives installs.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateResponse {
    pub validated: bool,
    pub server: Option<ValidatedServer>,
}

#[derive(Debug, Deserialize)]
pub struct ValidatedServer {
    pub id: u64,
    pub name: String,
    #[serde(rename = "internalId")]
    pub internal_id: String,
    pub node: NodeInfo,
}

#[derive(Debug, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub fqdn: String,
}

/// Everything the daemon needs to install and run one server, fetched
/// fresh per request and never persisted locally.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    pub unit: UnitDefinition,
    pub limits: ResourceLimits,
    pub allocation: Allocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitDefinition {
    pub image: String,
    #[serde(default)]
    pub install_image: Option<String>,
    pub install_script: String,
    pub startup: String,
    #[serde(default)]
    pub config_files: Vec<ConfigFile>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
}

impl UnitDefinition {
    /// Units may run their install stage on a dedicated image; most just
    /// reuse the runtime image.
    pub fn install_image(&self) -> &str {
        self.install_image.as_deref().unwrap_or(&self.image)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub disk_mb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Allocation {
    pub ip: String,
    pub port: u16,
}

impl RemoteClient {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Validate a client-supplied token for a server. A reachable control
    /// plane that says no is a validation failure, not a transient error.
    pub async fn validate(&self, internal_id: &str, token: &str) -> AgentResult<ValidatedServer> {
        let url = format!("{}/servers/{}/validate", self.base_url, internal_id);
        let response = self.http.get(&url).bearer_auth(token).send().await?;

        if !response.status().is_success() {
            return Err(AgentError::ValidationError(format!(
                "Control plane rejected token for {} ({})",
                internal_id,
                response.status()
            )));
        }

        let payload: ValidateResponse = response.json().await?;
        if !payload.validated {
            return Err(AgentError::ValidationError(format!(
                "Token not valid for server {}",
                internal_id
            )));
        }

        payload.server.ok_or_else(|| {
            AgentError::RemoteError("Validate response missing server record".to_string())
        })
    }

    /// Fetch the unit configuration for a server, retrying transient
    /// failures with linear backoff before giving up.
    pub async fn fetch_install_config(&self, internal_id: &str) -> AgentResult<InstallConfig> {
        let url = format!("{}/servers/{}/configuration", self.base_url, internal_id);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_fetch(&url).await {
                Ok(config) => return Ok(config),
                Err(err) if attempt < CONFIG_FETCH_ATTEMPTS => {
                    warn!(
                        "Configuration fetch for {} failed (attempt {}/{}): {}",
                        internal_id, attempt, CONFIG_FETCH_ATTEMPTS, err
                    );
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(err) => {
                    return Err(AgentError::RemoteError(format!(
                        "Configuration fetch for {} failed after {} attempts: {}",
                        internal_id, attempt, err
                    )));
                }
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> AgentResult<InstallConfig> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AgentError::RemoteError(e.to_string()))?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_response_deserializes() {
        let body = r#"{
            "validated": true,
            "server": {
                "id": 7,
                "name": "lobby",
                "internalId": "a1b2c3",
                "node": {"id": 1, "name": "node-01", "fqdn": "n1.example.net", "port": 8080}
            }
        }"#;
        let parsed: ValidateResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.validated);
        let server = parsed.server.unwrap();
        assert_eq!(server.id, 7);
        assert_eq!(server.internal_id, "a1b2c3");
        assert_eq!(server.node.name, "node-01");
        assert_eq!(server.node.fqdn, "n1.example.net");
    }

    #[test]
    fn install_config_defaults_optional_sections() {
        let body = r#"{
            "unit": {
                "image": "ghcr.io/units/java:17",
                "install_script": "echo hi",
                "startup": "java -jar %server_jar%"
            },
            "limits": {"memory_mb": 2048, "cpu_shares": 512, "disk_mb": 10240},
            "allocation": {"ip": "0.0.0.0", "port": 25565}
        }"#;
        let config: InstallConfig = serde_json::from_str(body).unwrap();
        assert!(config.unit.config_files.is_empty());
        assert!(config.unit.variables.is_empty());
        assert_eq!(config.unit.install_image(), "ghcr.io/units/java:17");
    }
}
