use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{EngineClient, EngineStream};
use crate::frames::FrameDecoder;
use crate::monitor::{spawn_session_monitor, ResourceUsage};
use crate::state::ServerState;
use crate::PylonAgent;

const LOG_BACKLOG_LINES: usize = 100;
const BROADCAST_BUFFER: usize = 256;

/// Close codes for refused or failed connections.
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;

// ---- wire events ------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    AuthSuccess {
        logs: Vec<String>,
        state: ServerState,
    },
    ConsoleOutput {
        message: String,
    },
    Stats(ResourceUsage),
    PowerStatus {
        status: PowerOutcome,
        action: PowerAction,
        state: ServerState,
        error: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum InboundEvent {
    SendCommand(String),
    PowerAction(PowerRequest),
}

#[derive(Debug, Clone, Deserialize)]
struct PowerRequest {
    action: PowerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerAction::Start => f.write_str("start"),
            PowerAction::Stop => f.write_str("stop"),
            PowerAction::Restart => f.write_str("restart"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOutcome {
    Completed,
    Failed,
}

// ---- log buffer -------------------------------------------------------

/// Bounded ring of the most recent console lines for one server, fed to
/// newly attached sessions as backlog.
pub struct LogBuffer {
    lines: VecDeque<String>,
}

impl LogBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(LOG_BACKLOG_LINES),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == LOG_BACKLOG_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

// ---- per-server hub ---------------------------------------------------

/// Fan-out point for one server: the backlog ring plus a broadcast
/// channel every attached session subscribes to. One engine log reader
/// feeds it no matter how many sessions are watching.
pub struct ServerHub {
    server_id: String,
    lines_tx: broadcast::Sender<String>,
    backlog: Mutex<LogBuffer>,
    sessions: AtomicUsize,
    log_reader: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHub {
    fn new(server_id: String) -> Self {
        let (lines_tx, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            server_id,
            lines_tx,
            backlog: Mutex::new(LogBuffer::new()),
            sessions: AtomicUsize::new(0),
            log_reader: Mutex::new(None),
        }
    }

    /// Append to the backlog and push to every subscribed session. Safe
    /// under interleaving: the ring is locked for the append only, and
    /// the broadcast channel handles delivery.
    pub fn publish(&self, line: String) {
        self.backlog.lock().push(line.clone());
        let _ = self.lines_tx.send(line);
    }

    pub fn backlog_snapshot(&self) -> Vec<String> {
        self.backlog.lock().snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.lines_tx.subscribe()
    }
}

// ---- gateway ----------------------------------------------------------

/// Owns every hub and the engine-side log readers, keyed by server. The
/// reader for a server exists only while at least one session is
/// attached to it.
pub struct ConsoleGateway {
    hubs: DashMap<String, Arc<ServerHub>>,
    engine: Arc<EngineClient>,
}

impl ConsoleGateway {
    pub fn new(engine: Arc<EngineClient>) -> Self {
        Self {
            hubs: DashMap::new(),
            engine,
        }
    }

    pub fn hub(&self, server_id: &str) -> Arc<ServerHub> {
        self.hubs
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(ServerHub::new(server_id.to_string())))
            .clone()
    }

    /// Broadcast one console line to whoever is watching the server.
    /// Also used by the installer to surface install output.
    pub fn publish(&self, server_id: &str, line: &str) {
        self.hub(server_id).publish(line.to_string());
    }

    /// Drop a server's hub entirely, killing its log reader. Sessions
    /// still holding the hub see their subscription end and close out
    /// normally.
    pub fn remove(&self, server_id: &str) {
        if let Some((_, hub)) = self.hubs.remove(server_id) {
            if let Some(handle) = hub.log_reader.lock().take() {
                handle.abort();
            }
        }
    }

    fn attach(&self, server_id: &str, container_id: &str) -> (Arc<ServerHub>, broadcast::Receiver<String>) {
        let hub = self.hub(server_id);
        hub.sessions.fetch_add(1, Ordering::SeqCst);
        self.ensure_log_reader(&hub, container_id);
        let rx = hub.subscribe();
        (hub, rx)
    }

    fn detach(&self, hub: &Arc<ServerHub>) {
        let remaining = hub.sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            if let Some(handle) = hub.log_reader.lock().take() {
                handle.abort();
                debug!("Released log reader for {}", hub.server_id);
            }
        }
    }

    /// Start the single engine log reader for a server if it is not
    /// already running. Called on attach and again after power actions
    /// that restart the container, since the engine ends the stream when
    /// the container stops.
    pub fn ensure_log_reader(&self, hub: &Arc<ServerHub>, container_id: &str) {
        let mut reader = hub.log_reader.lock();
        if reader.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let engine = self.engine.clone();
        let hub_ref = hub.clone();
        let container_id = container_id.to_string();
        *reader = Some(tokio::spawn(async move {
            let mut stream = match engine.follow_logs(&container_id, 0).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to open log stream for {}: {}", container_id, err);
                    return;
                }
            };

            let mut decoder = FrameDecoder::new();
            loop {
                match stream.next_chunk().await {
                    Ok(Some(chunk)) => {
                        for line in decoder.feed(&chunk) {
                            hub_ref.publish(line.text);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("Log stream error for {}: {}", container_id, err);
                        break;
                    }
                }
            }
            debug!("Log stream ended for {}", container_id);
        }));
    }
}

// ---- session ----------------------------------------------------------

#[derive(Deserialize)]
pub struct ConsoleParams {
    server: Option<String>,
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConsoleParams>,
    State(agent): State<Arc<PylonAgent>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, params, agent))
}

async fn handle_session(socket: WebSocket, params: ConsoleParams, agent: Arc<PylonAgent>) {
    let (server_id, token) = match (params.server, params.token) {
        (Some(server), Some(token)) => (server, token),
        _ => {
            close_with(socket, CLOSE_POLICY, "Missing server or token parameter").await;
            return;
        }
    };

    let validated = match agent.remote.validate(&server_id, &token).await {
        Ok(server) => server,
        Err(err) => {
            debug!("Console auth failed for {}: {}", server_id, err);
            close_with(socket, CLOSE_POLICY, "Token validation failed").await;
            return;
        }
    };

    if validated.internal_id != server_id {
        close_with(socket, CLOSE_POLICY, "Token validated for a different server").await;
        return;
    }

    // The handle must resolve to a live engine container or the session
    // is torn down right here.
    let container_id = agent
        .registry
        .get(&server_id)
        .and_then(|entry| entry.container_id)
        .unwrap_or_else(|| server_id.clone());
    if !agent.engine.container_exists(&container_id).await {
        close_with(socket, CLOSE_INTERNAL, "Server container does not exist").await;
        return;
    }

    let session_id = Uuid::new_v4();
    info!(
        "Console session {} attached to {} (#{} / {}) via {} ({})",
        session_id,
        validated.name,
        validated.id,
        server_id,
        validated.node.name,
        validated.node.fqdn
    );

    let (hub, lines_rx) = agent.gateway.attach(&server_id, &container_id);

    let (stats_tx, stats_rx) = mpsc::channel(8);
    let stats_task = spawn_session_monitor(agent.engine.clone(), container_id.clone(), stats_tx);

    let mut session = ConsoleSession {
        id: session_id,
        server_id: server_id.clone(),
        container_id,
        agent: agent.clone(),
        hub: hub.clone(),
        shell: None,
    };

    session.run(socket, lines_rx, stats_rx).await;

    // Teardown: the stats timer dies with the session, the shared log
    // reader is released via the hub's session count, and dropping the
    // shell closes its engine connection.
    stats_task.abort();
    agent.gateway.detach(&hub);
    info!("Console session {} closed", session_id);
}

struct ConsoleSession {
    id: Uuid,
    server_id: String,
    container_id: String,
    agent: Arc<PylonAgent>,
    hub: Arc<ServerHub>,
    shell: Option<EngineStream>,
}

impl ConsoleSession {
    async fn run(
        &mut self,
        socket: WebSocket,
        lines_rx: broadcast::Receiver<String>,
        mut stats_rx: mpsc::Receiver<ResourceUsage>,
    ) {
        let (mut sink, mut inbound) = socket.split();

        let state = self.agent.lifecycle.current_state(&self.container_id).await;
        let hello = OutboundEvent::AuthSuccess {
            logs: self.hub.backlog_snapshot(),
            state,
        };
        if send_event(&mut sink, &hello).await.is_err() {
            return;
        }

        let mut lines = BroadcastStream::new(lines_rx);

        loop {
            tokio::select! {
                message = inbound.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_text(&text).await {
                                if send_event(&mut sink, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            debug!("Socket error on session {}: {}", self.id, err);
                            break;
                        }
                    }
                }
                line = lines.next() => {
                    match line {
                        Some(Ok(message)) => {
                            let event = OutboundEvent::ConsoleOutput { message };
                            if send_event(&mut sink, &event).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                            warn!("Session {} dropped {} console lines", self.id, missed);
                        }
                        None => break,
                    }
                }
                usage = stats_rx.recv() => {
                    match usage {
                        Some(usage) => {
                            if send_event(&mut sink, &OutboundEvent::Stats(usage)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// One inbound frame. Malformed JSON is logged and dropped; the
    /// connection stays up.
    async fn handle_text(&mut self, text: &str) -> Option<OutboundEvent> {
        let event: InboundEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                warn!("Session {} sent malformed event: {}", self.id, err);
                return None;
            }
        };

        match event {
            InboundEvent::SendCommand(command) => self.send_command(&command).await,
            InboundEvent::PowerAction(request) => Some(self.power_action(request.action).await),
        }
    }

    /// Relay one command into the server. Successful writes produce no
    /// direct reply; the command's output comes back through the shared
    /// log stream like any other console line.
    async fn send_command(&mut self, command: &str) -> Option<OutboundEvent> {
        let running = match self.agent.engine.inspect_container(&self.container_id).await {
            Ok(details) => details.state.running,
            Err(_) => false,
        };
        if !running {
            return Some(OutboundEvent::Error {
                message: "Server is not running".to_string(),
            });
        }

        if self.shell.is_none() {
            match self.open_shell().await {
                Ok(shell) => self.shell = Some(shell),
                Err(err) => {
                    return Some(OutboundEvent::Error {
                        message: format!("Failed to open console channel: {}", err),
                    });
                }
            }
        }

        if let Some(shell) = self.shell.as_mut() {
            let payload = format!("{}\n", command);
            if let Err(err) = shell.write_all(payload.as_bytes()).await {
                // A dead shell (container restarted underneath us) is
                // re-established on the next command.
                self.shell = None;
                return Some(OutboundEvent::Error {
                    message: format!("Failed to write command: {}", err),
                });
            }
            debug!("Session {} injected command into {}", self.id, self.server_id);
        }

        None
    }

    /// One persistent shell per session, created on first use. Its
    /// output is redirected onto the main server process's own stdout
    /// and stderr so injected commands answer in the regular log stream
    /// instead of a side channel.
    async fn open_shell(&self) -> crate::errors::AgentResult<EngineStream> {
        let pid = find_main_process(&self.agent.engine, &self.container_id)
            .await
            .unwrap_or(1);
        let redirect = format!(
            "exec > /proc/{}/fd/1 2> /proc/{}/fd/2; exec /bin/sh",
            pid, pid
        );
        self.agent
            .engine
            .exec_shell(&self.container_id, &["/bin/sh", "-c", &redirect])
            .await
    }

    async fn power_action(&mut self, action: PowerAction) -> OutboundEvent {
        self.hub
            .publish(format!("[Pylon] Power action received: {}", action));

        let transition = match action {
            PowerAction::Start | PowerAction::Restart => ServerState::Starting,
            PowerAction::Stop => ServerState::Stopping,
        };
        self.agent.registry.set_state(&self.server_id, transition);

        let result = match action {
            PowerAction::Start => self.agent.lifecycle.start(&self.container_id).await,
            PowerAction::Stop => self.agent.lifecycle.stop(&self.container_id).await,
            PowerAction::Restart => self.agent.lifecycle.restart(&self.container_id).await,
        };

        // The engine ends the shared log stream when a container stops,
        // so anything that (re)starts it needs the reader back.
        if matches!(action, PowerAction::Start | PowerAction::Restart) && result.is_ok() {
            self.agent
                .gateway
                .ensure_log_reader(&self.hub, &self.container_id);
        }

        let state = self.agent.lifecycle.current_state(&self.container_id).await;
        self.agent.registry.set_state(&self.server_id, state);

        match result {
            Ok(()) => OutboundEvent::PowerStatus {
                status: PowerOutcome::Completed,
                action,
                state,
                error: None,
            },
            Err(err) => OutboundEvent::PowerStatus {
                status: PowerOutcome::Failed,
                action,
                state,
                error: Some(err.to_string()),
            },
        }
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &OutboundEvent,
) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            error!("Failed to serialize outbound event: {}", err);
            return Ok(());
        }
    };
    sink.send(Message::Text(payload.into())).await
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Find the server's main process inside the container: the first entry
/// whose parent is pid 0 or 1 and whose command line is not a plain
/// shell. Best-effort — unusual entrypoints can defeat it, in which case
/// injected-command output lands outside the log stream.
async fn find_main_process(engine: &EngineClient, container_id: &str) -> Option<u32> {
    let output = engine
        .exec_capture(container_id, &["ps", "-eo", "pid,ppid,args"])
        .await
        .ok()?;
    parse_main_process(&output)
}

fn parse_main_process(ps_output: &str) -> Option<u32> {
    for line in ps_output.lines().skip(1) {
        let mut parts = line.split_whitespace();
        let pid = match parts.next().and_then(|v| v.parse::<u32>().ok()) {
            Some(value) => value,
            None => continue,
        };
        let ppid = match parts.next().and_then(|v| v.parse::<u32>().ok()) {
            Some(value) => value,
            None => continue,
        };
        let args = parts.collect::<Vec<_>>().join(" ");

        if (ppid == 0 || ppid == 1) && !is_plain_shell(&args) {
            return Some(pid);
        }
    }
    None
}

fn is_plain_shell(args: &str) -> bool {
    let first = args.split_whitespace().next().unwrap_or("");
    let base = first.rsplit('/').next().unwrap_or(first);
    matches!(base, "sh" | "bash" | "ash" | "dash" | "zsh")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest_beyond_capacity() {
        let mut buffer = LogBuffer::new();
        for i in 0..150 {
            buffer.push(format!("line {}", i));
        }
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), LOG_BACKLOG_LINES);
        assert_eq!(snapshot.first().unwrap(), "line 50");
        assert_eq!(snapshot.last().unwrap(), "line 149");
    }

    #[test]
    fn outbound_events_match_wire_shape() {
        let event = OutboundEvent::AuthSuccess {
            logs: vec!["a".to_string()],
            state: ServerState::Running,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "auth_success");
        assert_eq!(json["data"]["logs"][0], "a");
        assert_eq!(json["data"]["state"], "running");

        let event = OutboundEvent::ConsoleOutput {
            message: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "console_output");
        assert_eq!(json["data"]["message"], "hi");

        let event = OutboundEvent::PowerStatus {
            status: PowerOutcome::Failed,
            action: PowerAction::Stop,
            state: ServerState::Running,
            error: Some("engine said no".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "power_status");
        assert_eq!(json["data"]["status"], "failed");
        assert_eq!(json["data"]["action"], "stop");
    }

    #[test]
    fn stats_event_nests_usage_as_data() {
        let usage = ResourceUsage::state_only(ServerState::Stopped);
        let json = serde_json::to_value(OutboundEvent::Stats(usage)).unwrap();
        assert_eq!(json["event"], "stats");
        assert_eq!(json["data"]["state"], "stopped");
    }

    #[test]
    fn inbound_events_parse() {
        let event: InboundEvent =
            serde_json::from_str(r#"{"event":"send_command","data":"say hello"}"#).unwrap();
        assert!(matches!(event, InboundEvent::SendCommand(cmd) if cmd == "say hello"));

        let event: InboundEvent =
            serde_json::from_str(r#"{"event":"power_action","data":{"action":"restart"}}"#)
                .unwrap();
        assert!(
            matches!(event, InboundEvent::PowerAction(req) if req.action == PowerAction::Restart)
        );
    }

    #[test]
    fn malformed_inbound_event_is_a_parse_error() {
        assert!(serde_json::from_str::<InboundEvent>(r#"{"event":"unknown","data":1}"#).is_err());
        assert!(serde_json::from_str::<InboundEvent>("not json").is_err());
    }

    #[test]
    fn main_process_scan_skips_shells() {
        let ps = "\
PID   PPID  ARGS
    1     0 /bin/sh -c java -jar server.jar
   12     1 java -jar server.jar
   40    12 ps -eo pid,ppid,args";
        assert_eq!(parse_main_process(ps), Some(12));
    }

    #[test]
    fn main_process_scan_handles_no_match() {
        let ps = "\
PID   PPID  ARGS
    1     0 /bin/sh
   40     1 bash";
        assert_eq!(parse_main_process(ps), None);
    }

    #[test]
    fn hub_publish_feeds_backlog_and_subscribers() {
        let hub = ServerHub::new("s1".to_string());
        let mut rx = hub.subscribe();
        hub.publish("hello".to_string());

        assert_eq!(hub.backlog_snapshot(), vec!["hello".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }
}
