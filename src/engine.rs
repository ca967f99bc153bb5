use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::errors::{AgentError, AgentResult};
use crate::frames::FrameDecoder;

/// Minimal client for the container engine's HTTP API over its unix
/// socket. One connection per request; streaming endpoints hand the
/// hijacked connection back to the caller as an [`EngineStream`].
pub struct EngineClient {
    socket_path: PathBuf,
}

struct EngineResponse {
    status: u16,
    body: String,
}

/// A hijacked engine connection: raw multiplexed output on the read
/// side, stdin on the write side. Bytes that arrived together with the
/// response headers are replayed before anything new is read.
pub struct EngineStream {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    leftover: Vec<u8>,
}

impl EngineStream {
    /// Next chunk of raw stream bytes, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> AgentResult<Option<Vec<u8>>> {
        if !self.leftover.is_empty() {
            return Ok(Some(std::mem::take(&mut self.leftover)));
        }

        let mut buf = vec![0u8; 8192];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    pub async fn write_all(&mut self, data: &[u8]) -> AgentResult<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl EngineClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> AgentResult<EngineResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            AgentError::EngineError(format!("Failed to connect to engine socket: {}", e))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        let request = build_request(method, path, body);
        writer.write_all(request.as_bytes()).await?;
        writer.flush().await?;

        // HTTP/1.0 keeps the framing trivial: the engine streams the body
        // and closes the connection when it is done.
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;

        let (status, body_start) = parse_response_head(&raw).ok_or_else(|| {
            AgentError::EngineError("Malformed response from engine".to_string())
        })?;
        let body = String::from_utf8_lossy(&raw[body_start..]).to_string();

        debug!("engine {} {} -> {}", method, path, status);
        Ok(EngineResponse { status, body })
    }

    /// Open a streaming endpoint and return the connection once the
    /// response headers have been consumed. Hijacked endpoints (attach,
    /// exec start) upgrade to a raw tcp stream; follow-mode logs are
    /// requested as HTTP/1.0 instead so the body arrives unchunked and
    /// can be fed straight into the frame decoder.
    async fn open_stream(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
        upgrade: bool,
    ) -> AgentResult<EngineStream> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            AgentError::EngineError(format!("Failed to connect to engine socket: {}", e))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        let request = if upgrade {
            build_upgrade_request(method, path, body)
        } else {
            build_request(method, path, body)
        };
        writer.write_all(request.as_bytes()).await?;
        writer.flush().await?;

        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        let (status, leftover) = loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(AgentError::EngineError(
                    "Engine closed the connection before the stream started".to_string(),
                ));
            }
            head.extend_from_slice(&buf[..n]);
            if let Some((status, body_start)) = parse_response_head(&head) {
                break (status, head.split_off(body_start));
            }
        };

        if status != 101 && status != 200 {
            let message = String::from_utf8_lossy(&leftover);
            return Err(AgentError::EngineError(format!(
                "Engine stream request failed ({}): {}",
                status,
                error_message(message.trim())
            )));
        }

        Ok(EngineStream {
            reader,
            writer,
            leftover,
        })
    }

    // ---- images ------------------------------------------------------

    pub async fn pull_image(&self, reference: &str) -> AgentResult<()> {
        let path = format!("/images/create?fromImage={}", reference);
        let response = self.request("POST", &path, Some("")).await?;
        if response.status >= 300 {
            return Err(AgentError::EngineError(format!(
                "Failed to pull {}: {}",
                reference,
                error_message(&response.body)
            )));
        }

        // Progress comes back as one JSON document per line; a pull that
        // fails mid-stream still reports 200 up front.
        for line in response.body.lines() {
            if let Ok(progress) = serde_json::from_str::<PullProgress>(line) {
                if let Some(error) = progress.error {
                    return Err(AgentError::EngineError(format!(
                        "Failed to pull {}: {}",
                        reference, error
                    )));
                }
            }
        }

        Ok(())
    }

    // ---- containers --------------------------------------------------

    pub async fn create_container(
        &self,
        name: &str,
        spec: &serde_json::Value,
    ) -> AgentResult<String> {
        let path = format!("/containers/create?name={}", name);
        let body = spec.to_string();
        let response = self.request("POST", &path, Some(&body)).await?;
        if response.status != 201 {
            return Err(AgentError::EngineError(format!(
                "Failed to create container {}: {}",
                name,
                error_message(&response.body)
            )));
        }

        let created: CreatedContainer = serde_json::from_str(&response.body)?;
        Ok(created.id)
    }

    /// Start a container. A 304 means it is already running, which is
    /// not an error for us.
    pub async fn start_container(&self, id: &str) -> AgentResult<()> {
        let response = self
            .request("POST", &format!("/containers/{}/start", id), Some(""))
            .await?;
        match response.status {
            204 | 304 => Ok(()),
            _ => Err(AgentError::EngineError(format!(
                "Failed to start container {}: {}",
                id,
                error_message(&response.body)
            ))),
        }
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> AgentResult<()> {
        let path = format!("/containers/{}/stop?t={}", id, timeout_secs);
        let response = self.request("POST", &path, Some("")).await?;
        match response.status {
            204 | 304 => Ok(()),
            _ => Err(AgentError::EngineError(format!(
                "Failed to stop container {}: {}",
                id,
                error_message(&response.body)
            ))),
        }
    }

    pub async fn restart_container(&self, id: &str, timeout_secs: u64) -> AgentResult<()> {
        let path = format!("/containers/{}/restart?t={}", id, timeout_secs);
        let response = self.request("POST", &path, Some("")).await?;
        match response.status {
            204 => Ok(()),
            _ => Err(AgentError::EngineError(format!(
                "Failed to restart container {}: {}",
                id,
                error_message(&response.body)
            ))),
        }
    }

    /// Remove a container. An already-gone container (404) counts as
    /// removed.
    pub async fn remove_container(&self, id: &str, force: bool) -> AgentResult<()> {
        let path = format!("/containers/{}?force={}&v=true", id, force);
        let response = self.request("DELETE", &path, None).await?;
        match response.status {
            204 | 404 => Ok(()),
            _ => Err(AgentError::EngineError(format!(
                "Failed to remove container {}: {}",
                id,
                error_message(&response.body)
            ))),
        }
    }

    pub async fn inspect_container(&self, id: &str) -> AgentResult<ContainerDetails> {
        let response = self
            .request("GET", &format!("/containers/{}/json", id), None)
            .await?;
        match response.status {
            200 => Ok(serde_json::from_str(&response.body)?),
            404 => Err(AgentError::NotFound(format!("Container {}", id))),
            _ => Err(AgentError::EngineError(format!(
                "Failed to inspect container {}: {}",
                id,
                error_message(&response.body)
            ))),
        }
    }

    pub async fn container_exists(&self, id: &str) -> bool {
        self.inspect_container(id).await.is_ok()
    }

    /// Block until the container exits and return its exit code.
    pub async fn wait_container(&self, id: &str) -> AgentResult<i64> {
        let response = self
            .request("POST", &format!("/containers/{}/wait", id), Some(""))
            .await?;
        if response.status != 200 {
            return Err(AgentError::EngineError(format!(
                "Failed to wait for container {}: {}",
                id,
                error_message(&response.body)
            )));
        }
        let exit: WaitResult = serde_json::from_str(&response.body)?;
        Ok(exit.status_code)
    }

    pub async fn container_stats(&self, id: &str) -> AgentResult<EngineStats> {
        let path = format!("/containers/{}/stats?stream=false", id);
        let response = self.request("GET", &path, None).await?;
        if response.status != 200 {
            return Err(AgentError::EngineError(format!(
                "Failed to read stats for {}: {}",
                id,
                error_message(&response.body)
            )));
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    /// Attach to a container's multiplexed output before it starts.
    pub async fn attach_container(&self, id: &str) -> AgentResult<EngineStream> {
        let path = format!(
            "/containers/{}/attach?stream=true&stdout=true&stderr=true",
            id
        );
        self.open_stream("POST", &path, Some(""), true).await
    }

    /// Follow a running container's log output, replaying `tail` lines.
    pub async fn follow_logs(&self, id: &str, tail: usize) -> AgentResult<EngineStream> {
        let path = format!(
            "/containers/{}/logs?follow=true&stdout=true&stderr=true&tail={}",
            id, tail
        );
        self.open_stream("GET", &path, None, false).await
    }

    /// Run a command in the container and capture its demultiplexed
    /// output as one string.
    pub async fn exec_capture(&self, id: &str, cmd: &[&str]) -> AgentResult<String> {
        let exec_id = self.exec_create(id, cmd, false).await?;
        let mut stream = self.exec_start(&exec_id).await?;

        let mut decoder = FrameDecoder::new();
        let mut output = String::new();
        while let Some(chunk) = stream.next_chunk().await? {
            for line in decoder.feed(&chunk) {
                output.push_str(&line.text);
                output.push('\n');
            }
        }
        Ok(output)
    }

    /// Start a command with stdin attached and hand the hijacked stream
    /// to the caller. Used for the per-session interactive shell.
    pub async fn exec_shell(&self, id: &str, cmd: &[&str]) -> AgentResult<EngineStream> {
        let exec_id = self.exec_create(id, cmd, true).await?;
        self.exec_start(&exec_id).await
    }

    async fn exec_create(&self, id: &str, cmd: &[&str], stdin: bool) -> AgentResult<String> {
        let body = serde_json::json!({
            "AttachStdin": stdin,
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": false,
            "Cmd": cmd,
        })
        .to_string();

        let response = self
            .request("POST", &format!("/containers/{}/exec", id), Some(&body))
            .await?;
        if response.status != 201 {
            return Err(AgentError::EngineError(format!(
                "Failed to create exec in {}: {}",
                id,
                error_message(&response.body)
            )));
        }

        let created: CreatedContainer = serde_json::from_str(&response.body)?;
        Ok(created.id)
    }

    async fn exec_start(&self, exec_id: &str) -> AgentResult<EngineStream> {
        let body = "{\"Detach\":false,\"Tty\":false}";
        self.open_stream("POST", &format!("/exec/{}/start", exec_id), Some(body), true)
            .await
    }
}

fn build_request(method: &str, path: &str, body: Option<&str>) -> String {
    match body {
        Some(body) => format!(
            "{} {} HTTP/1.0\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        ),
        None => format!("{} {} HTTP/1.0\r\nHost: localhost\r\n\r\n", method, path),
    }
}

fn build_upgrade_request(method: &str, path: &str, body: Option<&str>) -> String {
    let body = body.unwrap_or("");
    format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    )
}

/// Split a raw HTTP response into (status code, body offset). Returns
/// `None` while the header section is still incomplete.
fn parse_response_head(raw: &[u8]) -> Option<(u16, usize)> {
    let header_end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..header_end]).ok()?;
    let status = head
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse::<u16>()
        .ok()?;
    Some((status, header_end + 4))
}

/// Engine errors carry `{"message": "..."}` bodies; fall back to the
/// raw text when they do not.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }
    serde_json::from_str::<ErrorBody>(body.trim())
        .map(|e| e.message)
        .unwrap_or_else(|_| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no error detail".to_string()
            } else {
                trimmed.to_string()
            }
        })
}

// ---- API payload types ------------------------------------------------

#[derive(Deserialize)]
struct CreatedContainer {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct WaitResult {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    pub state: ContainerState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
}

/// Raw counters from `GET /containers/{id}/stats?stream=false`. The
/// engine includes the previous sample so percentages can be derived
/// from one response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineStats {
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkCounters>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkCounters {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_and_body_offset() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"Id\":\"abc\"}";
        let (status, offset) = parse_response_head(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(&raw[offset..], b"{\"Id\":\"abc\"}");
    }

    #[test]
    fn incomplete_head_returns_none() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nContent-").is_none());
    }

    #[test]
    fn error_message_prefers_engine_payload() {
        assert_eq!(
            error_message("{\"message\":\"No such container: x\"}"),
            "No such container: x"
        );
        assert_eq!(error_message("plain text"), "plain text");
        assert_eq!(error_message("  "), "no error detail");
    }

    #[test]
    fn stats_counters_deserialize() {
        let body = r#"{
            "cpu_stats": {"cpu_usage": {"total_usage": 1200}, "system_cpu_usage": 9000, "online_cpus": 4},
            "precpu_stats": {"cpu_usage": {"total_usage": 1000}, "system_cpu_usage": 8000},
            "memory_stats": {"usage": 512, "limit": 1024},
            "networks": {"eth0": {"rx_bytes": 10, "tx_bytes": 20}}
        }"#;
        let stats: EngineStats = serde_json::from_str(body).unwrap();
        assert_eq!(stats.cpu_stats.cpu_usage.total_usage, 1200);
        assert_eq!(stats.precpu_stats.system_cpu_usage, Some(8000));
        assert_eq!(stats.memory_stats.limit, 1024);
        assert_eq!(stats.networks.unwrap()["eth0"].tx_bytes, 20);
    }

    #[test]
    fn inspect_payload_deserializes() {
        let body = r#"{"Id":"abc","State":{"Running":true,"Status":"running","ExitCode":0}}"#;
        let details: ContainerDetails = serde_json::from_str(body).unwrap();
        assert!(details.state.running);
        assert_eq!(details.state.status, "running");
    }
}
