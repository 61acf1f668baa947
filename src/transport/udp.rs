//! Connectionless transport.
//!
//! Resolves the collector once, binds an ephemeral local socket and sends one
//! datagram per message. There is no retry: if resolution or binding fails
//! the transport stays unbound and every submission is dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::Shared;

/// Submissions shorter than this (at most a bare line terminator) are not
/// sent. Formatted records always carry a header, so this only guards raw
/// submissions made directly through a [`TransportHandle`].
///
/// [`TransportHandle`]: super::TransportHandle
pub const MIN_DATAGRAM_LEN: usize = 2;

/// Receive buffer for unexpected inbound datagrams.
const RECV_BUFFER_SIZE: usize = 2048;

/// Binding lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Uninitialized,
    Resolving,
    Bound,
}

/// Datagram transport state machine.
#[derive(Debug)]
pub struct DatagramTransport {
    remote: String,
    rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    state: BindingState,
}

impl DatagramTransport {
    pub fn new(remote: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>, shared: Arc<Shared>) -> Self {
        Self {
            remote: remote.into(),
            rx,
            shared,
            state: BindingState::Uninitialized,
        }
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    /// Bind once, then send until every handle is dropped.
    pub async fn run(mut self) {
        self.shared.stats.record_attempt();

        match self.bind().await {
            Ok((socket, remote)) => self.serve(socket, remote).await,
            Err(e) => {
                self.state = BindingState::Uninitialized;
                warn!(
                    remote = %self.remote,
                    error = %e,
                    "Collector did not resolve, datagram transport stays unbound"
                );
                // submissions are refused by the handles; wait for shutdown
                while self.rx.recv().await.is_some() {
                    self.shared.stats.record_dropped();
                }
            }
        }
    }

    async fn bind(&mut self) -> io::Result<(UdpSocket, SocketAddr)> {
        self.state = BindingState::Resolving;
        debug!(remote = %self.remote, "Resolving collector");

        let remote = lookup_host(&self.remote).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })?;

        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;

        self.state = BindingState::Bound;
        Ok((socket, remote))
    }

    async fn serve(&mut self, socket: UdpSocket, remote: SocketAddr) {
        self.shared.stats.record_connection();
        self.shared.set_ready(true);
        info!(
            remote = %self.remote,
            addr = %remote,
            local = ?socket.local_addr().ok(),
            "Datagram socket bound"
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.send(&socket, remote, &message).await,
                    None => break,
                },
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => {
                        warn!(
                            from = %from,
                            packet = %String::from_utf8_lossy(&buf[..n]),
                            "Dropping unexpected packet"
                        );
                    }
                    Err(e) => warn!(error = %e, "Datagram read error"),
                },
            }
        }

        self.shared.set_ready(false);
    }

    async fn send(&self, socket: &UdpSocket, remote: SocketAddr, message: &[u8]) {
        if message.len() < MIN_DATAGRAM_LEN {
            trace!(len = message.len(), "Dropping short message");
            self.shared.stats.record_dropped();
            return;
        }

        let payload = message.strip_suffix(b"\n").unwrap_or(message);
        match socket.send_to(payload, remote).await {
            Ok(_) => self.shared.stats.record_sent(),
            Err(e) => {
                self.shared.stats.record_send_error();
                warn!(remote = %remote, error = %e, "Datagram send error");
            }
        }
    }
}
