//! Tail Relay Library
//!
//! This library provides the components of a log forwarding agent that tails
//! local files and relays each new line to a remote syslog-style collector:
//!
//! - **config**: Layered configuration (defaults, JSON file, environment)
//! - **format**: Priority, timestamp and wire record formatting
//! - **pipeline**: Line splitting, duplicate collapsing and rate limiting
//! - **watch**: File change notification
//! - **stream**: Per-file open/follow/reopen state machine
//! - **transport**: TCP and UDP delivery to the collector
//! - **agent**: Wires streams, transport and clock together
//!
//! # Example
//!
//! ```no_run
//! use tail_relay::agent::Agent;
//! use tail_relay::config::Config;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = Config::load(None).expect("Failed to load config");
//!     let agent = Agent::new(config);
//!
//!     let shutdown = async {
//!         tokio::signal::ctrl_c().await.ok();
//!     };
//!     agent.run(shutdown).await.ok();
//! }
//! ```

// Module declarations
pub mod agent;
pub mod config;
pub mod format;
pub mod pipeline;
pub mod stream;
pub mod transport;
pub mod watch;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentError, AgentStats, Context, StatsMonitor};
pub use config::{Config, ConfigError, Protocol, StreamConfig};
pub use format::{Clock, Facility, MessageFormatter, Severity};
pub use pipeline::LinePipeline;
pub use stream::{Stream, StreamState, StreamStatsSnapshot};
pub use transport::{Transport, TransportError, TransportHandle, TransportStatsSnapshot};
pub use watch::{FileEvent, FileWatch, WatchError};
