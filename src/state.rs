use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Every state a server can be in, shared by the installer, the
/// lifecycle manager and the session layer so transitions are matched
/// exhaustively instead of compared as loose strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Creating,
    Installing,
    Installed,
    InstallFailed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl ServerState {
    /// Map an engine-reported container status onto our state space.
    pub fn from_engine_status(status: &str) -> Self {
        match status {
            "running" => ServerState::Running,
            "restarting" => ServerState::Starting,
            "removing" | "exited" | "created" | "dead" => ServerState::Stopped,
            "paused" => ServerState::Stopped,
            _ => ServerState::Stopped,
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Creating => "creating",
            ServerState::Installing => "installing",
            ServerState::Installed => "installed",
            ServerState::InstallFailed => "install_failed",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::Errored => "errored",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ServerEntry {
    /// Engine-side handle. Containers are named by internal id, so this
    /// doubles as the container name once installation has produced one.
    pub container_id: Option<String>,
    pub state: ServerState,
}

/// The one table mapping internal server ids to their container handle
/// and state. All mutation goes through here; nothing else holds server
/// state.
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, ServerEntry>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, internal_id: &str) -> Option<ServerEntry> {
        self.servers.read().get(internal_id).cloned()
    }

    /// Begin tracking a server. Idempotent; an existing entry keeps its
    /// state.
    pub fn track(&self, internal_id: &str) {
        self.servers
            .write()
            .entry(internal_id.to_string())
            .or_insert(ServerEntry {
                container_id: None,
                state: ServerState::Creating,
            });
    }

    /// Update the state of a tracked server. A server that was deleted
    /// mid-operation stays deleted; late state writes must not
    /// resurrect it.
    pub fn set_state(&self, internal_id: &str, state: ServerState) {
        if let Some(entry) = self.servers.write().get_mut(internal_id) {
            entry.state = state;
        }
    }

    pub fn bind_container(&self, internal_id: &str, container_id: &str) {
        if let Some(entry) = self.servers.write().get_mut(internal_id) {
            entry.container_id = Some(container_id.to_string());
        }
    }

    /// Drop the entry entirely, freeing the allocation for reuse.
    pub fn remove(&self, internal_id: &str) -> Option<ServerEntry> {
        self.servers.write().remove(internal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_to_wire_strings() {
        assert_eq!(
            serde_json::to_string(&ServerState::InstallFailed).unwrap(),
            "\"install_failed\""
        );
        assert_eq!(ServerState::Running.to_string(), "running");
    }

    #[test]
    fn engine_status_maps_onto_state() {
        assert_eq!(
            ServerState::from_engine_status("running"),
            ServerState::Running
        );
        assert_eq!(
            ServerState::from_engine_status("exited"),
            ServerState::Stopped
        );
    }

    #[test]
    fn registry_binds_and_frees() {
        let registry = ServerRegistry::new();
        registry.track("s1");
        registry.set_state("s1", ServerState::Installing);
        registry.bind_container("s1", "s1");

        let entry = registry.get("s1").unwrap();
        assert_eq!(entry.container_id.as_deref(), Some("s1"));
        assert_eq!(entry.state, ServerState::Installing);

        registry.remove("s1");
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn late_state_writes_do_not_resurrect_deleted_servers() {
        let registry = ServerRegistry::new();
        registry.track("s1");
        registry.remove("s1");

        registry.set_state("s1", ServerState::InstallFailed);
        assert!(registry.get("s1").is_none());
    }
}
