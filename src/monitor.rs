use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::{EngineClient, EngineStats};
use crate::state::ServerState;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// One derived sample pushed to a console session. Metrics are omitted
/// entirely while the container is not running.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub limit: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl ResourceUsage {
    pub fn state_only(state: ServerState) -> Self {
        Self {
            state,
            cpu_percent: None,
            memory: None,
            network: None,
        }
    }
}

/// CPU percentage from two consecutive counter readings. Non-positive
/// deltas (first sample, counter resets) clamp to zero.
pub fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u32) -> f64 {
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }
    (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
}

pub fn memory_percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    (used as f64 / limit as f64) * 100.0
}

/// Derive a full sample from the engine's raw counters.
pub fn derive_usage(state: ServerState, stats: &EngineStats) -> ResourceUsage {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
    let online = stats.cpu_stats.online_cpus.unwrap_or(1);

    let used = stats.memory_stats.usage;
    let limit = stats.memory_stats.limit;

    // Counters come from the primary interface; servers on exotic
    // network setups just report zeroes.
    let network = stats
        .networks
        .as_ref()
        .and_then(|nets| nets.get("eth0"))
        .map(|eth0| NetworkUsage {
            rx_bytes: eth0.rx_bytes,
            tx_bytes: eth0.tx_bytes,
        })
        .unwrap_or(NetworkUsage {
            rx_bytes: 0,
            tx_bytes: 0,
        });

    ResourceUsage {
        state,
        cpu_percent: Some(cpu_percent(cpu_delta, system_delta, online)),
        memory: Some(MemoryUsage {
            used,
            limit,
            percent: memory_percent(used, limit),
        }),
        network: Some(network),
    }
}

/// Sample one container on a fixed cadence, pushing each snapshot to the
/// owning session. The session aborts the returned handle on teardown,
/// which is what guarantees no timer outlives its connection.
pub fn spawn_session_monitor(
    engine: Arc<EngineClient>,
    container_id: String,
    tx: mpsc::Sender<ResourceUsage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            interval.tick().await;

            let usage = match engine.inspect_container(&container_id).await {
                Ok(details) if details.state.running => {
                    match engine.container_stats(&container_id).await {
                        Ok(stats) => derive_usage(ServerState::Running, &stats),
                        Err(err) => {
                            debug!("Stats sample failed for {}: {}", container_id, err);
                            ResourceUsage::state_only(ServerState::Running)
                        }
                    }
                }
                Ok(details) => {
                    ResourceUsage::state_only(ServerState::from_engine_status(&details.state.status))
                }
                Err(_) => ResourceUsage::state_only(ServerState::Stopped),
            };

            if tx.send(usage).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CpuStats, CpuUsage, MemoryStats, NetworkCounters};
    use std::collections::HashMap;

    fn stats(
        cpu_total: u64,
        precpu_total: u64,
        system: u64,
        presystem: u64,
        online: u32,
    ) -> EngineStats {
        EngineStats {
            cpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: cpu_total,
                },
                system_cpu_usage: Some(system),
                online_cpus: Some(online),
            },
            precpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: precpu_total,
                },
                system_cpu_usage: Some(presystem),
                online_cpus: None,
            },
            memory_stats: MemoryStats {
                usage: 512,
                limit: 2048,
            },
            networks: None,
        }
    }

    #[test]
    fn cpu_formula_matches_reference_values() {
        assert_eq!(cpu_percent(200, 1000, 4), 80.0);
    }

    #[test]
    fn cpu_clamps_on_non_positive_deltas() {
        assert_eq!(cpu_percent(0, 1000, 4), 0.0);
        assert_eq!(cpu_percent(200, 0, 4), 0.0);
    }

    #[test]
    fn memory_percent_handles_zero_limit() {
        assert_eq!(memory_percent(100, 0), 0.0);
        assert_eq!(memory_percent(512, 2048), 25.0);
    }

    #[test]
    fn derive_usage_computes_deltas() {
        let usage = derive_usage(ServerState::Running, &stats(1200, 1000, 9000, 8000, 4));
        assert_eq!(usage.cpu_percent, Some(80.0));
        let memory = usage.memory.unwrap();
        assert_eq!(memory.used, 512);
        assert_eq!(memory.percent, 25.0);
    }

    #[test]
    fn missing_primary_interface_zeroes_network() {
        let usage = derive_usage(ServerState::Running, &stats(1, 0, 1, 0, 1));
        let network = usage.network.unwrap();
        assert_eq!(network.rx_bytes, 0);
        assert_eq!(network.tx_bytes, 0);
    }

    #[test]
    fn primary_interface_counters_pass_through() {
        let mut s = stats(1, 0, 1, 0, 1);
        let mut nets = HashMap::new();
        nets.insert(
            "eth0".to_string(),
            NetworkCounters {
                rx_bytes: 42,
                tx_bytes: 7,
            },
        );
        s.networks = Some(nets);

        let usage = derive_usage(ServerState::Running, &s);
        let network = usage.network.unwrap();
        assert_eq!(network.rx_bytes, 42);
        assert_eq!(network.tx_bytes, 7);
    }

    #[test]
    fn state_only_sample_omits_metrics() {
        let usage = ResourceUsage::state_only(ServerState::Stopped);
        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["state"], "stopped");
        assert!(json.get("cpu_percent").is_none());
        assert!(json.get("memory").is_none());
        assert!(json.get("network").is_none());
    }

    #[tokio::test]
    async fn monitor_stops_sending_once_aborted() {
        // An unreachable engine still produces state-only samples, which
        // is enough to observe the timer itself.
        let engine = Arc::new(EngineClient::new(std::path::PathBuf::from(
            "/nonexistent/engine.sock",
        )));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_session_monitor(engine, "c1".to_string(), tx);

        assert!(rx.recv().await.is_some());

        handle.abort();
        // The aborted task drops its sender, so the channel drains to a
        // definitive end; were the timer still alive this would never
        // return and the test would hang.
        while rx.recv().await.is_some() {}
    }
}
