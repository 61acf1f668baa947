//! Connection-oriented transport.
//!
//! The transport walks `Uninitialized -> Resolving -> Connecting ->
//! Established`. Every resolve/connect attempt counts against the configured
//! maximum; once it is reached the task fails with
//! [`TransportError::ConnectAttemptsExhausted`], which is fatal for the
//! process. A successful connection resets the counter, and the connection is
//! read only to notice when the collector goes away, at which point the whole
//! sequence starts over.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Shared, TransportError};

/// Size of the buffer used to watch the connection for closure.
const READ_BUFFER_SIZE: usize = 1024;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Resolving,
    Connecting,
    Established,
}

/// Why an established connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// The collector closed the connection or it errored
    Dropped,
    /// Every handle is gone; the agent is shutting down
    Closed,
}

/// Stream transport state machine.
#[derive(Debug)]
pub struct StreamTransport {
    remote: String,
    max_attempts: u32,
    retry_delay: Duration,
    rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    state: ConnectionState,
    attempts: u32,
}

impl StreamTransport {
    pub fn new(
        remote: impl Into<String>,
        max_attempts: u32,
        retry_delay: Duration,
        rx: mpsc::Receiver<Vec<u8>>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            remote: remote.into(),
            max_attempts,
            retry_delay,
            rx,
            shared,
            state: ConnectionState::Uninitialized,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Resolve, connect and forward until every handle is dropped.
    pub async fn run(mut self) -> Result<(), TransportError> {
        loop {
            let stream = self.acquire().await?;

            match self.serve(stream).await {
                Disconnect::Dropped => {
                    warn!(
                        remote = %self.remote,
                        "Connection dropped, attempting to re-connect"
                    );
                }
                Disconnect::Closed => {
                    debug!(remote = %self.remote, "All producers gone, closing connection");
                    return Ok(());
                }
            }
        }
    }

    /// Retry resolve+connect until it succeeds or attempts run out.
    async fn acquire(&mut self) -> Result<TcpStream, TransportError> {
        loop {
            let err = match self.connect_once().await {
                Ok(stream) => {
                    self.attempts = 0;
                    return Ok(stream);
                }
                Err(e) => e,
            };

            warn!(
                remote = %self.remote,
                state = ?self.state,
                attempt = self.attempts,
                max_attempts = self.max_attempts,
                error = %err,
                "Error connecting"
            );
            self.state = ConnectionState::Uninitialized;

            if self.attempts >= self.max_attempts {
                error!(
                    remote = %self.remote,
                    attempts = self.attempts,
                    "Reached max connect attempts"
                );
                return Err(TransportError::ConnectAttemptsExhausted {
                    remote: self.remote.clone(),
                    attempts: self.attempts,
                    last_error: err.to_string(),
                });
            }

            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn connect_once(&mut self) -> io::Result<TcpStream> {
        self.attempts += 1;
        self.shared.stats.record_attempt();

        self.state = ConnectionState::Resolving;
        debug!(remote = %self.remote, "Resolving collector");
        let addr = lookup_host(&self.remote).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })?;
        debug!(remote = %self.remote, addr = %addr, "Collector resolved");

        self.state = ConnectionState::Connecting;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        socket.connect(addr).await
    }

    /// Forward queued messages over `stream` until it closes.
    async fn serve(&mut self, stream: TcpStream) -> Disconnect {
        self.state = ConnectionState::Established;
        self.shared.stats.record_connection();
        self.shared.set_ready(true);
        info!(remote = %self.remote, "Connection established");

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let outcome = loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Disconnect::Dropped,
                    Ok(n) => {
                        warn!(
                            remote = %self.remote,
                            response = %String::from_utf8_lossy(&buf[..n]),
                            "Collector responded unexpectedly"
                        );
                    }
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Connection read error");
                        break Disconnect::Dropped;
                    }
                },
                message = self.rx.recv() => match message {
                    Some(message) => match writer.write_all(&message).await {
                        Ok(()) => self.shared.stats.record_sent(),
                        Err(e) => {
                            self.shared.stats.record_send_error();
                            warn!(remote = %self.remote, error = %e, "Write error");
                        }
                    },
                    None => break Disconnect::Closed,
                },
            }
        };

        self.shared.set_ready(false);
        self.state = ConnectionState::Uninitialized;

        if outcome == Disconnect::Dropped {
            let discarded = self.discard_queued();
            if discarded > 0 {
                warn!(
                    remote = %self.remote,
                    discarded,
                    "Discarded messages queued for the lost connection"
                );
            }
        }
        outcome
    }

    /// Drop everything still queued. Messages are never carried over to a
    /// later connection.
    fn discard_queued(&mut self) -> u64 {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            self.shared.stats.record_dropped();
            discarded += 1;
        }
        discarded
    }
}
