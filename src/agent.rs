//! Agent orchestration.
//!
//! The [`Agent`] builds one [`Stream`] per configured file and a single
//! transport, then runs them all on the current runtime together with the
//! clock refresher. It stops when the shutdown future resolves or when the
//! transport fails, whichever happens first.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::format::{Clock, MessageFormatter};
use crate::stream::{Stream, StreamStats, StreamStatsSnapshot};
use crate::transport::{Shared, Transport, TransportError, TransportHandle, TransportStatsSnapshot};

/// How long the transport may keep flushing after the streams stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on how stale the wire timestamp may get.
const MAX_CLOCK_PERIOD: Duration = Duration::from_secs(1);

/// Everything a stream needs from the agent.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub formatter: MessageFormatter,
    pub transport: TransportHandle,
}

impl Context {
    pub fn new(config: Arc<Config>, clock: Clock, transport: TransportHandle) -> Self {
        let formatter = MessageFormatter::new(
            config.facility,
            config.severity,
            config.identifier.clone(),
            clock,
        );
        Self {
            config,
            formatter,
            transport,
        }
    }
}

/// Errors that stop the agent.
#[derive(Debug)]
pub enum AgentError {
    /// The transport gave up
    Transport(TransportError),
    /// The transport task panicked
    Task(JoinError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Transport(e) => write!(f, "transport failed: {}", e),
            AgentError::Task(e) => write!(f, "transport task failed: {}", e),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Transport(e) => Some(e),
            AgentError::Task(e) => Some(e),
        }
    }
}

impl From<TransportError> for AgentError {
    fn from(e: TransportError) -> Self {
        AgentError::Transport(e)
    }
}

/// Statistics for a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub run_id: String,
    pub transport: TransportStatsSnapshot,
    pub streams: BTreeMap<String, StreamStatsSnapshot>,
}

/// Read-only view of the counters of a running agent.
#[derive(Debug, Clone)]
pub struct StatsMonitor {
    run_id: Uuid,
    transport: Arc<Shared>,
    streams: Vec<(String, Arc<StreamStats>)>,
}

impl StatsMonitor {
    pub fn snapshot(&self) -> AgentStats {
        AgentStats {
            run_id: self.run_id.to_string(),
            transport: self.transport.stats(),
            streams: self
                .streams
                .iter()
                .map(|(id, stats)| (id.clone(), stats.snapshot()))
                .collect(),
        }
    }

    pub fn transport_ready(&self) -> bool {
        self.transport.is_ready()
    }

    pub fn stream(&self, id: &str) -> Option<StreamStatsSnapshot> {
        self.streams
            .iter()
            .find(|(stream_id, _)| stream_id == id)
            .map(|(_, stats)| stats.snapshot())
    }
}

/// The forwarding agent.
#[derive(Debug)]
pub struct Agent {
    run_id: Uuid,
    config: Arc<Config>,
    clock: Clock,
    transport: Transport,
    /// Held until shutdown so the transport outlives streams that gave up
    producer: TransportHandle,
    streams: Vec<Stream>,
    monitor: StatsMonitor,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        let run_id = Uuid::new_v4();
        let config = Arc::new(config);
        let clock = Clock::new();
        let (transport, handle) = Transport::new(&config);
        let shared = handle.shared();

        let context = Context::new(config.clone(), clock.clone(), handle.clone());
        let streams: Vec<Stream> = config
            .streams
            .iter()
            .map(|spec| Stream::new(&context, spec))
            .collect();

        let monitor = StatsMonitor {
            run_id,
            transport: shared,
            streams: streams
                .iter()
                .map(|stream| (stream.id().to_string(), stream.stats()))
                .collect(),
        };

        Self {
            run_id,
            config,
            clock,
            transport,
            producer: handle,
            streams,
            monitor,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn monitor(&self) -> StatsMonitor {
        self.monitor.clone()
    }

    /// Run until `shutdown` resolves or the transport fails.
    ///
    /// Streams that exhaust their open attempts stop on their own; the
    /// transport keeps running until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Transport` when the collector could not be
    /// reached within the configured connect attempts.
    pub async fn run<F>(self, shutdown: F) -> Result<AgentStats, AgentError>
    where
        F: Future<Output = ()>,
    {
        let Agent {
            run_id,
            config,
            clock,
            transport,
            producer,
            streams,
            monitor,
        } = self;

        info!(
            run_id = %run_id,
            protocol = %transport.protocol(),
            remote = %config.remote_addr(),
            streams = streams.len(),
            "Agent starting"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(clock.run(config.rate_window.min(MAX_CLOCK_PERIOD)));
        for stream in streams {
            tasks.spawn(stream.run());
        }
        let mut transport_task = tokio::spawn(transport.start());

        tokio::pin!(shutdown);
        let finished = tokio::select! {
            result = &mut transport_task => Some(result),
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping...");
                None
            }
        };

        // stopping the streams drops the last producers, which lets a
        // connected transport drain its queue and return
        drop(producer);
        tasks.shutdown().await;

        let result = match finished {
            Some(result) => flatten(result),
            None => match tokio::time::timeout(SHUTDOWN_GRACE, &mut transport_task).await {
                Ok(result) => flatten(result),
                Err(_) => {
                    warn!("Transport shutdown timed out after {:?}", SHUTDOWN_GRACE);
                    transport_task.abort();
                    Ok(())
                }
            },
        };

        let stats = monitor.snapshot();
        match serde_json::to_string(&stats) {
            Ok(json) => info!(stats = %json, "Agent stopped"),
            Err(e) => warn!(error = %e, "Failed to serialize stats"),
        }

        result.map(|()| stats)
    }
}

fn flatten(result: Result<Result<(), TransportError>, JoinError>) -> Result<(), AgentError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AgentError::Transport(e)),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(AgentError::Task(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, StreamConfig};
    use crate::stream::StreamState;
    use std::io::Write;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(path: &std::path::Path, port: u16) -> Config {
        Config {
            streams: vec![StreamConfig::new("app", path)],
            remote_port: port,
            max_connect_attempts: 2,
            connect_retry_delay: Duration::from_millis(10),
            open_retry_delay: Duration::from_millis(10),
            poll_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should become true");
    }

    fn append(path: &std::path::Path, data: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data).unwrap();
    }

    #[tokio::test]
    async fn test_forwards_lines_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"before start\n").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = Agent::new(config(&path, port));
        let monitor = agent.monitor();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(agent.run(async {
            let _ = stop_rx.await;
        }));

        let (peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        wait_for(|| monitor.transport_ready()).await;
        wait_for(|| monitor.stream("app").map(|s| s.state) == Some(StreamState::Watching)).await;

        append(&path, b"hello\n");
        let mut reader = tokio::io::BufReader::new(peer);
        let mut line = String::new();
        timeout(WAIT, reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(line.starts_with("<134>"), "unexpected record {:?}", line);
        assert!(line.ends_with(" app tail-relay hello\n"), "unexpected record {:?}", line);

        stop_tx.send(()).unwrap();
        let stats = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.transport.sent, 1);
        assert_eq!(stats.streams["app"].lines, 1);
        assert_eq!(stats.run_id, monitor.snapshot().run_id);
    }

    #[tokio::test]
    async fn test_exhausted_connect_attempts_stop_agent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let agent = Agent::new(config(&path, port));
        let result = timeout(WAIT, agent.run(std::future::pending()))
            .await
            .unwrap();

        match result {
            Err(AgentError::Transport(TransportError::ConnectAttemptsExhausted {
                attempts, ..
            })) => assert_eq!(attempts, 2),
            other => panic!("expected transport failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forwards_lines_over_udp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();

        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = config(&path, collector.local_addr().unwrap().port());
        config.protocol = Protocol::Udp;
        config.identifier = "edge-01".to_string();

        let agent = Agent::new(config);
        let monitor = agent.monitor();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(agent.run(async {
            let _ = stop_rx.await;
        }));

        wait_for(|| monitor.transport_ready()).await;
        wait_for(|| monitor.stream("app").map(|s| s.state) == Some(StreamState::Watching)).await;

        append(&path, b"datagram\n");
        let mut buf = [0u8; 256];
        let (n, _) = timeout(WAIT, collector.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let record = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(record.ends_with(" app edge-01 datagram"), "unexpected record {:?}", record);

        stop_tx.send(()).unwrap();
        let stats = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.transport.sent, 1);
    }

    #[tokio::test]
    async fn test_runs_until_shutdown_after_streams_give_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = config(&path, listener.local_addr().unwrap().port());
        config.max_open_attempts = 2;

        let agent = Agent::new(config);
        let monitor = agent.monitor();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(agent.run(async {
            let _ = stop_rx.await;
        }));

        let (_peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        wait_for(|| monitor.stream("app").map(|s| s.state) == Some(StreamState::Stopped)).await;

        sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        assert!(monitor.transport_ready());

        stop_tx.send(()).unwrap();
        let stats = timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.streams["app"].open_attempts, 2);
        assert_eq!(stats.transport.connections, 1);
    }

    #[test]
    fn test_stats_serialize_as_json() {
        let agent = Agent::new(Config {
            streams: vec![StreamConfig::new("app", "/var/log/app.log")],
            ..Config::default()
        });
        let json = serde_json::to_value(agent.monitor().snapshot()).unwrap();

        assert_eq!(json["run_id"], agent.run_id().to_string());
        assert_eq!(json["transport"]["sent"], 0);
        assert_eq!(json["streams"]["app"]["state"], "opening");
    }

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::from(TransportError::ConnectAttemptsExhausted {
            remote: "collector:514".to_string(),
            attempts: 10,
            last_error: "Connection refused".to_string(),
        });
        assert!(err.to_string().starts_with("transport failed"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
