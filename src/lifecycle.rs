use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::engine::EngineClient;
use crate::errors::AgentResult;
use crate::remote::{Allocation, ResourceLimits};
use crate::state::ServerState;

const STOP_TIMEOUT_SECS: u64 = 10;

/// Create and drive the long-lived server container. Containers are
/// named by internal id, so the name doubles as the daemon's handle.
pub struct LifecycleManager {
    engine: Arc<EngineClient>,
    container_root: String,
}

impl LifecycleManager {
    pub fn new(engine: Arc<EngineClient>, container_root: String) -> Self {
        Self {
            engine,
            container_root,
        }
    }

    pub async fn create(
        &self,
        internal_id: &str,
        image: &str,
        startup_command: &str,
        limits: &ResourceLimits,
        allocation: &Allocation,
        volume: &Path,
    ) -> AgentResult<String> {
        info!(
            "Creating container {} from {} ({}MB mem, {} cpu shares, {}MB disk, {}:{})",
            internal_id,
            image,
            limits.memory_mb,
            limits.cpu_shares,
            limits.disk_mb,
            allocation.ip,
            allocation.port
        );

        let spec = container_spec(
            image,
            startup_command,
            limits,
            allocation,
            volume,
            &self.container_root,
        );
        let container_id = self.engine.create_container(internal_id, &spec).await?;

        info!("Container created: {}", container_id);
        Ok(container_id)
    }

    pub async fn start(&self, container_id: &str) -> AgentResult<()> {
        info!("Starting container: {}", container_id);
        self.engine.start_container(container_id).await
    }

    pub async fn stop(&self, container_id: &str) -> AgentResult<()> {
        info!("Stopping container: {}", container_id);
        self.engine
            .stop_container(container_id, STOP_TIMEOUT_SECS)
            .await
    }

    pub async fn restart(&self, container_id: &str) -> AgentResult<()> {
        info!("Restarting container: {}", container_id);
        self.engine
            .restart_container(container_id, STOP_TIMEOUT_SECS)
            .await
    }

    pub async fn remove(&self, container_id: &str, force: bool) -> AgentResult<()> {
        info!("Removing container: {}", container_id);
        self.engine.remove_container(container_id, force).await
    }

    /// Engine-reported state, mapped onto the shared state space. A
    /// container the engine no longer knows is stopped for our purposes.
    pub async fn current_state(&self, container_id: &str) -> ServerState {
        match self.engine.inspect_container(container_id).await {
            Ok(details) => ServerState::from_engine_status(&details.state.status),
            Err(_) => ServerState::Stopped,
        }
    }
}

/// Engine-side container description: volume bound at the fixed
/// in-container root, memory and memory+swap pinned to the same limit so
/// swap is off the table, and the allocation published for both tcp and
/// udp on the bound address.
fn container_spec(
    image: &str,
    startup_command: &str,
    limits: &ResourceLimits,
    allocation: &Allocation,
    volume: &Path,
    container_root: &str,
) -> serde_json::Value {
    let memory_bytes = limits.memory_mb * 1024 * 1024;
    let tcp = format!("{}/tcp", allocation.port);
    let udp = format!("{}/udp", allocation.port);
    let binding = json!([{
        "HostIp": allocation.ip,
        "HostPort": allocation.port.to_string(),
    }]);

    let mut exposed = serde_json::Map::new();
    let mut port_bindings = serde_json::Map::new();
    for proto in [tcp, udp] {
        exposed.insert(proto.clone(), json!({}));
        port_bindings.insert(proto, binding.clone());
    }

    json!({
        "Image": image,
        "Cmd": ["sh", "-c", startup_command],
        "WorkingDir": container_root,
        "ExposedPorts": exposed,
        "HostConfig": {
            "Binds": [format!("{}:{}", volume.display(), container_root)],
            "Memory": memory_bytes,
            "MemorySwap": memory_bytes,
            "CpuShares": limits.cpu_shares,
            "PortBindings": port_bindings,
        },
    })
}
