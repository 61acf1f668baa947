//! Network transports that carry formatted messages to the collector.
//!
//! Exactly one transport runs per process. It is chosen once from the
//! configured protocol and never switched:
//!
//! - [`StreamTransport`]: connection-oriented, resolves and connects with
//!   bounded retries, reconnects when the connection drops.
//! - [`DatagramTransport`]: connectionless, resolves and binds once, sends
//!   best-effort datagrams.
//!
//! Producers hold a [`TransportHandle`]. `submit` never waits: a message is
//! dropped (and counted) when the transport is not ready or its queue is
//! full. Nothing is buffered for later delivery.

pub mod tcp;
pub mod udp;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::{Config, Protocol};

pub use tcp::{ConnectionState, StreamTransport};
pub use udp::{BindingState, DatagramTransport};

/// Capacity of the queue between producers and the transport task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;

/// Errors that end the transport task.
#[derive(Debug)]
pub enum TransportError {
    /// The collector could not be reached within the configured attempts
    ConnectAttemptsExhausted {
        remote: String,
        attempts: u32,
        last_error: String,
    },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectAttemptsExhausted {
                remote,
                attempts,
                last_error,
            } => write!(
                f,
                "Reached max connect attempts ({}) for {}. Last error: {}",
                attempts, remote, last_error
            ),
        }
    }
}

impl std::error::Error for TransportError {}

/// Counters shared between the transport task and its handles.
#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    send_errors: AtomicU64,
    connect_attempts: AtomicU64,
    connections: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStatsSnapshot {
    /// Messages written to the network
    pub sent: u64,

    /// Messages discarded before reaching the network
    pub dropped: u64,

    /// Writes that failed
    pub send_errors: u64,

    /// Resolve/connect (or resolve/bind) attempts
    pub connect_attempts: u64,

    /// Times the transport became ready
    pub connections: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }

    fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by a transport task and its handles.
#[derive(Debug, Default)]
pub struct Shared {
    ready: AtomicBool,
    stats: TransportStats,
}

impl Shared {
    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Producer side of the transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Create a handle and the receiving end a transport task consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>, Arc<Shared>) {
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared::default());
        let handle = Self {
            tx,
            shared: shared.clone(),
        };
        (handle, rx, shared)
    }

    /// Hand one formatted message to the transport without waiting.
    ///
    /// Returns `false` when the message was dropped.
    pub fn submit(&self, message: Vec<u8>) -> bool {
        if !self.shared.is_ready() {
            trace!("Transport not ready, dropping message");
            self.shared.stats.record_dropped();
            return false;
        }

        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.shared.stats.record_dropped();
                false
            }
        }
    }

    /// Whether the transport can currently accept messages.
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// State observable without holding a producer, so the transport can
    /// still see every handle go away.
    pub fn shared(&self) -> Arc<Shared> {
        self.shared.clone()
    }
}

/// The configured transport, one variant per protocol.
#[derive(Debug)]
pub enum Transport {
    Stream(StreamTransport),
    Datagram(DatagramTransport),
}

impl Transport {
    /// Build the transport selected by `config.protocol` and its handle.
    pub fn new(config: &Config) -> (Self, TransportHandle) {
        Self::with_capacity(config, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(config: &Config, capacity: usize) -> (Self, TransportHandle) {
        let (handle, rx, shared) = TransportHandle::channel(capacity);
        let transport = match config.protocol {
            Protocol::Tcp => Transport::Stream(StreamTransport::new(
                config.remote_addr(),
                config.max_connect_attempts,
                config.connect_retry_delay,
                rx,
                shared,
            )),
            Protocol::Udp => {
                Transport::Datagram(DatagramTransport::new(config.remote_addr(), rx, shared))
            }
        };
        (transport, handle)
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Stream(_) => Protocol::Tcp,
            Transport::Datagram(_) => Protocol::Udp,
        }
    }

    /// Run the transport until every handle is dropped.
    ///
    /// Only the stream transport can fail, when its connect attempts are
    /// exhausted.
    pub async fn start(self) -> Result<(), TransportError> {
        match self {
            Transport::Stream(transport) => transport.run().await,
            Transport::Datagram(transport) => {
                transport.run().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_dropped_when_not_ready() {
        let (handle, mut rx, _shared) = TransportHandle::channel(4);
        assert!(!handle.submit(b"hello\n".to_vec()));
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.stats().dropped, 1);
    }

    #[test]
    fn test_submit_queued_when_ready() {
        let (handle, mut rx, shared) = TransportHandle::channel(4);
        shared.set_ready(true);

        assert!(handle.submit(b"hello\n".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), b"hello\n".to_vec());
        assert_eq!(handle.stats().dropped, 0);
    }

    #[test]
    fn test_submit_dropped_when_queue_full() {
        let (handle, _rx, shared) = TransportHandle::channel(1);
        shared.set_ready(true);

        assert!(handle.submit(b"one\n".to_vec()));
        assert!(!handle.submit(b"two\n".to_vec()));
        assert_eq!(handle.stats().dropped, 1);
    }

    #[test]
    fn test_transport_selected_by_protocol() {
        let mut config = Config::default();
        let (transport, _handle) = Transport::new(&config);
        assert_eq!(transport.protocol(), Protocol::Tcp);

        config.protocol = Protocol::Udp;
        let (transport, _handle) = Transport::new(&config);
        assert_eq!(transport.protocol(), Protocol::Udp);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::ConnectAttemptsExhausted {
            remote: "collector:514".to_string(),
            attempts: 3,
            last_error: "Connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("collector:514"));
        assert!(text.contains("3"));
        assert!(text.contains("Connection refused"));
    }
}
