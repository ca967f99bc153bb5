use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::engine::EngineClient;
use crate::errors::{AgentError, AgentResult};
use crate::frames::{FrameDecoder, LogOrigin};
use crate::lifecycle::LifecycleManager;
use crate::remote::RemoteClient;
use crate::session::ConsoleGateway;
use crate::state::{ServerRegistry, ServerState};
use crate::variables;

const SCRIPT_PREAMBLE: &str = "#!/bin/sh\nset -e\nset -x\n\n";
const SCRIPT_NAME: &str = "install.sh";

/// Everything needed to turn a unit definition into an installed
/// container: image pulls, volume materialization, the ephemeral install
/// container, and the resulting runtime container.
pub struct Installer {
    config: Arc<AgentConfig>,
    engine: Arc<EngineClient>,
    remote: Arc<RemoteClient>,
    registry: Arc<ServerRegistry>,
    gateway: Arc<ConsoleGateway>,
    lifecycle: Arc<LifecycleManager>,
}

/// Ephemeral per-attempt bookkeeping. The backing install container is
/// force-removed whatever happens to the job.
struct InstallationJob {
    id: Uuid,
    started_at: DateTime<Utc>,
    output: Vec<String>,
}

impl InstallationJob {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            output: Vec::new(),
        }
    }

    fn diagnostic_tail(&self) -> String {
        let start = self.output.len().saturating_sub(20);
        self.output[start..].join("\n")
    }
}

impl Installer {
    pub fn new(
        config: Arc<AgentConfig>,
        engine: Arc<EngineClient>,
        remote: Arc<RemoteClient>,
        registry: Arc<ServerRegistry>,
        gateway: Arc<ConsoleGateway>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            config,
            engine,
            remote,
            registry,
            gateway,
            lifecycle,
        }
    }

    pub async fn install(&self, internal_id: &str) -> AgentResult<()> {
        self.run(internal_id, false).await
    }

    pub async fn reinstall(&self, internal_id: &str) -> AgentResult<()> {
        self.run(internal_id, true).await
    }

    async fn run(&self, internal_id: &str, reinstall: bool) -> AgentResult<()> {
        self.registry.track(internal_id);
        self.registry.set_state(internal_id, ServerState::Installing);
        self.gateway
            .publish(internal_id, "[Pylon] Starting installation...");

        let result = self.run_pipeline(internal_id).await;

        match &result {
            Ok(()) => {
                self.registry.set_state(internal_id, ServerState::Installed);
                self.gateway
                    .publish(internal_id, "[Pylon] Installation completed.");
            }
            Err(err) => {
                let failed_state = if reinstall {
                    ServerState::Errored
                } else {
                    ServerState::InstallFailed
                };
                self.registry.set_state(internal_id, failed_state);
                self.gateway
                    .publish(internal_id, &format!("[Pylon] Installation failed: {}", err));
            }
        }

        result
    }

    async fn run_pipeline(&self, internal_id: &str) -> AgentResult<()> {
        let config = self.remote.fetch_install_config(internal_id).await?;
        let mut job = InstallationJob::new();
        info!(
            "Install job {} for {} ({})",
            job.id,
            internal_id,
            config.unit.image
        );

        // Both images up front; either failure aborts before anything is
        // materialized on disk.
        tokio::try_join!(
            self.engine.pull_image(config.unit.install_image()),
            self.engine.pull_image(&config.unit.image),
        )?;

        let volume = self.config.daemon.data_dir.join(internal_id);
        tokio::fs::create_dir_all(&volume).await?;

        for file in &config.unit.config_files {
            write_config_file(&volume, &file.path, &file.content).await?;
        }

        let script = variables::process(&config.unit.install_script, &config.unit.variables)?;
        write_install_script(&volume, &script).await?;

        let installer_name = installer_container_name(internal_id);
        let spec = install_container_spec(
            config.unit.install_image(),
            &volume,
            &self.config.engine.container_root,
        );
        self.engine.create_container(&installer_name, &spec).await?;

        let run_result = self.run_install_container(internal_id, &installer_name, &mut job).await;

        // Always. Auto-remove may have beaten us to it, which is fine;
        // anything else is logged and swallowed because future jobs do
        // not depend on this container being gone.
        if let Err(err) = self.engine.remove_container(&installer_name, true).await {
            warn!(
                "Failed to remove install container {}: {}",
                installer_name, err
            );
        }

        run_result?;

        let startup = variables::process(&config.unit.startup, &config.unit.variables)?;
        let container_id = self
            .lifecycle
            .create(
                internal_id,
                &config.unit.image,
                &startup,
                &config.limits,
                &config.allocation,
                &volume,
            )
            .await?;
        self.registry.bind_container(internal_id, &container_id);

        info!(
            "Install job {} for {} finished in {}s",
            job.id,
            internal_id,
            (Utc::now() - job.started_at).num_seconds()
        );
        Ok(())
    }

    /// Attach, start, drain the multiplexed output, then judge the exit
    /// code. Attaching happens before start so no early output is lost,
    /// and the wait runs alongside the drain so an auto-removing
    /// container cannot vanish before its exit code is observed.
    async fn run_install_container(
        &self,
        internal_id: &str,
        installer_name: &str,
        job: &mut InstallationJob,
    ) -> AgentResult<()> {
        let mut stream = self.engine.attach_container(installer_name).await?;
        self.engine.start_container(installer_name).await?;

        let drain = async {
            let mut decoder = FrameDecoder::new();
            while let Some(chunk) = stream.next_chunk().await? {
                for line in decoder.feed(&chunk) {
                    if line.origin == LogOrigin::Primary {
                        self.gateway.publish(internal_id, &line.text);
                    }
                    job.output.push(line.text);
                }
            }
            Ok::<(), AgentError>(())
        };

        let (drained, exit_code) = tokio::join!(drain, self.engine.wait_container(installer_name));
        drained?;
        let exit_code = exit_code?;

        if exit_code != 0 {
            return Err(AgentError::InstallationError(format!(
                "Install script exited with code {}: {}",
                exit_code,
                job.diagnostic_tail()
            )));
        }

        Ok(())
    }

    /// Tear a server down completely: runtime container, any in-flight
    /// install container, the volume, and the registry entry (which
    /// frees the allocation). Safe to call mid-install.
    pub async fn delete(&self, internal_id: &str) -> AgentResult<()> {
        if let Err(err) = self.lifecycle.remove(internal_id, true).await {
            warn!("Failed to remove container {}: {}", internal_id, err);
        }

        let installer_name = installer_container_name(internal_id);
        if let Err(err) = self.engine.remove_container(&installer_name, true).await {
            warn!(
                "Failed to remove install container {}: {}",
                installer_name, err
            );
        }

        let volume = self.config.daemon.data_dir.join(internal_id);
        if let Err(err) = tokio::fs::remove_dir_all(&volume).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove volume {}: {}", volume.display(), err);
            }
        }

        self.gateway.remove(internal_id);
        if let Some(entry) = self.registry.remove(internal_id) {
            info!("Server {} deleted (was {})", internal_id, entry.state);
        } else {
            info!("Server {} deleted", internal_id);
        }
        Ok(())
    }
}

fn installer_container_name(internal_id: &str) -> String {
    format!("{}_installer", internal_id)
}

/// Ephemeral install container: auto-removing, non-interactive, volume
/// bound at the same root the runtime container will use, running the
/// persisted install script.
fn install_container_spec(
    image: &str,
    volume: &Path,
    container_root: &str,
) -> serde_json::Value {
    json!({
        "Image": image,
        "Cmd": ["sh", format!("{}/{}", container_root, SCRIPT_NAME)],
        "WorkingDir": container_root,
        "AttachStdin": false,
        "OpenStdin": false,
        "Tty": false,
        "HostConfig": {
            "Binds": [format!("{}:{}", volume.display(), container_root)],
            "AutoRemove": true,
        },
    })
}

/// Collapse a declared config-file path onto the volume root, dropping
/// every parent/root component so `../../etc/passwd` cannot escape.
fn sanitize_relative_path(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

async fn write_config_file(volume: &Path, declared_path: &str, content: &str) -> AgentResult<()> {
    let relative = sanitize_relative_path(declared_path);
    if relative.as_os_str().is_empty() {
        return Err(AgentError::ValidationError(format!(
            "Config file path {} resolves to nothing inside the volume",
            declared_path
        )));
    }

    let target = volume.join(&relative);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, content).await?;
    Ok(())
}

async fn write_install_script(volume: &Path, processed: &str) -> AgentResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let target = volume.join(SCRIPT_NAME);
    tokio::fs::write(&target, wrap_script(processed)).await?;

    let mut perms = tokio::fs::metadata(&target).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(&target, perms).await?;
    Ok(())
}

fn wrap_script(processed: &str) -> String {
    format!("{}{}\n", SCRIPT_PREAMBLE, processed.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_components_are_neutralized() {
        assert_eq!(
            sanitize_relative_path("../../etc/passwd"),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            sanitize_relative_path("/absolute/server.properties"),
            PathBuf::from("absolute/server.properties")
        );
        assert_eq!(
            sanitize_relative_path("configs/../configs/eula.txt"),
            PathBuf::from("configs/configs/eula.txt")
        );
    }

    #[test]
    fn sanitized_paths_stay_inside_the_volume() {
        let volume = PathBuf::from("/var/lib/pylon/volumes/abc");
        let target = volume.join(sanitize_relative_path("../../etc/passwd"));
        assert!(target.starts_with(&volume));
    }

    #[test]
    fn wrapped_script_keeps_echo_and_abort_flags() {
        let wrapped = wrap_script("curl -o server.jar %jar_url%\n");
        assert!(wrapped.starts_with("#!/bin/sh\nset -e\nset -x\n"));
        assert!(wrapped.ends_with("curl -o server.jar %jar_url%\n"));
    }

    #[test]
    fn install_spec_is_auto_removing_and_non_interactive() {
        let spec = install_container_spec(
            "alpine:3.19",
            &PathBuf::from("/var/lib/pylon/volumes/abc"),
            "/home/container",
        );
        assert_eq!(spec["HostConfig"]["AutoRemove"], true);
        assert_eq!(spec["OpenStdin"], false);
        assert_eq!(spec["Cmd"][1], "/home/container/install.sh");
        assert_eq!(
            spec["HostConfig"]["Binds"][0],
            "/var/lib/pylon/volumes/abc:/home/container"
        );
    }

    #[tokio::test]
    async fn config_files_land_inside_the_volume() {
        let dir = tempfile::tempdir().unwrap();
        write_config_file(dir.path(), "../../outside.txt", "data")
            .await
            .unwrap();

        assert!(dir.path().join("outside.txt").exists());
        assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    }

    #[tokio::test]
    async fn empty_sanitized_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_config_file(dir.path(), "../..", "data").await.unwrap_err();
        assert!(matches!(err, AgentError::ValidationError(_)));
    }

    #[tokio::test]
    async fn install_script_is_written_executable() {
        let dir = tempfile::tempdir().unwrap();
        write_install_script(dir.path(), "echo done").await.unwrap();

        let target = dir.path().join(SCRIPT_NAME);
        let content = tokio::fs::read_to_string(&target).await.unwrap();
        assert!(content.contains("set -e"));
        assert!(content.ends_with("echo done\n"));

        use std::os::unix::fs::PermissionsExt;
        let mode = tokio::fs::metadata(&target).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
