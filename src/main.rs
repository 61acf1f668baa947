//! Tail Relay - Log forwarding agent
//!
//! Tails a set of local files and forwards every new line to a remote
//! syslog-style collector over TCP or UDP.
//!
//! ## Features
//!
//! - Follows files through rotation and truncation
//! - Collapses repeated lines and rate-limits each file
//! - Reconnects to the collector with bounded retries
//! - Graceful shutdown on SIGINT/SIGTERM
//!
//! ## Configuration
//!
//! An optional JSON config file may be given as the only argument (or via
//! `TAIL_RELAY_CONFIG_FILE`). Environment variables override it:
//!
//! - `TAIL_RELAY_STREAMS`: Files to tail as `id=/path,id2=/path2`
//! - `TAIL_RELAY_REMOTE_HOST` / `TAIL_RELAY_REMOTE_PORT`: Collector address
//! - `TAIL_RELAY_REMOTE_PROTO`: `tcp` or `udp` (default: tcp)
//! - `TAIL_RELAY_LOG_LEVEL`: Diagnostic level (default: info)
//! - `RUST_LOG`: Logging level filter, takes precedence over the above
//!
//! Command-line options such as `--remote-port 7777` or
//! `--stream app=/var/log/app.log` override both; see `--help`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tail_relay::agent::Agent;
use tail_relay::config::Config;

#[derive(Debug, Parser)]
#[command(name = "tail-relay")]
#[command(version, disable_version_flag = true)]
#[command(about = "Tail local files and forward new lines to a remote syslog collector", long_about = None)]
struct Args {
    /// JSON configuration file (default: $TAIL_RELAY_CONFIG_FILE)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Print version
    #[arg(short = 'v', long)]
    version: bool,

    /// File to tail as ID=/abs/path; may be repeated
    #[arg(long = "stream", value_name = "ID=PATH")]
    streams: Vec<String>,

    /// Collector host
    #[arg(long, value_name = "HOST")]
    remote_host: Option<String>,

    /// Collector port
    #[arg(long, value_name = "PORT")]
    remote_port: Option<u16>,

    /// Collector protocol, tcp or udp
    #[arg(long, value_name = "PROTO")]
    remote_proto: Option<String>,

    /// Identifier placed in every forwarded record
    #[arg(long)]
    identifier: Option<String>,

    /// Syslog facility (user, local0..local7)
    #[arg(long)]
    facility: Option<String>,

    /// Syslog severity (emerg..debug)
    #[arg(long)]
    severity: Option<String>,

    /// Diagnostic log level
    #[arg(long)]
    log_level: Option<String>,

    /// Append diagnostics to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<String>,

    /// Write the process id to this file
    #[arg(long, value_name = "PATH")]
    pid_file: Option<String>,
}

impl Args {
    /// Command-line settings keyed like their environment variables. They
    /// take precedence over the environment and the config file.
    fn overrides(&self) -> HashMap<&'static str, String> {
        let mut overrides = HashMap::new();
        if !self.streams.is_empty() {
            overrides.insert("TAIL_RELAY_STREAMS", self.streams.join(","));
        }
        let optional = [
            ("TAIL_RELAY_REMOTE_HOST", self.remote_host.clone()),
            ("TAIL_RELAY_REMOTE_PORT", self.remote_port.map(|port| port.to_string())),
            ("TAIL_RELAY_REMOTE_PROTO", self.remote_proto.clone()),
            ("TAIL_RELAY_IDENTIFIER", self.identifier.clone()),
            ("TAIL_RELAY_FACILITY", self.facility.clone()),
            ("TAIL_RELAY_SEVERITY", self.severity.clone()),
            ("TAIL_RELAY_LOG_LEVEL", self.log_level.clone()),
            ("TAIL_RELAY_LOG_FILE", self.log_file.clone()),
            ("TAIL_RELAY_PID_FILE", self.pid_file.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                overrides.insert(key, value);
            }
        }
        overrides
    }
}

/// Load the config with `overrides` layered over the process environment.
fn load_config(
    config_file: Option<&Path>,
    overrides: &HashMap<&'static str, String>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, tail_relay::ConfigError> {
    Config::load_with(config_file, |key| {
        overrides.get(key).cloned().or_else(|| env(key))
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    if args.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return;
    }

    let overrides = args.overrides();
    let config = match load_config(args.config_file.as_deref(), &overrides, |key| {
        std::env::var(key).ok()
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tail-relay: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config.log_level, config.log_file.as_deref()) {
        eprintln!("tail-relay: {}", e);
        std::process::exit(1);
    }

    info!(
        remote = %config.remote_addr(),
        protocol = %config.protocol,
        streams = config.streams.len(),
        rate_limit = config.rate_limit,
        rate_window_ms = config.rate_window.as_millis() as u64,
        "Configuration loaded"
    );

    let pid_file = config.pid_file.clone();
    if let Some(path) = &pid_file {
        write_pid_file(path);
    }

    let agent = Agent::new(config);
    info!(run_id = %agent.run_id(), "Tail Relay running. Press Ctrl+C to stop.");

    let result = agent.run(shutdown_signal()).await;

    if let Some(path) = &pid_file {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove pid file");
        }
    }

    match result {
        Ok(_) => info!("Tail Relay stopped"),
        Err(e) => {
            error!(error = %e, "Tail Relay stopped on fatal error");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` wins over the configured
/// level; a configured log file replaces stdout.
fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| format!("invalid log level '{}': {}", level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("cannot open log file {}: {}", path.display(), e))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn write_pid_file(path: &Path) {
    match std::fs::write(path, format!("{}\n", std::process::id())) {
        Ok(()) => info!(path = %path.display(), "Pid file written"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write pid file"),
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_command_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_config_file_and_flags() {
        let args = Args::try_parse_from(["tail-relay"]).unwrap();
        assert!(args.config_file.is_none());
        assert!(!args.version);
        assert!(args.overrides().is_empty());

        let args = Args::try_parse_from(["tail-relay", "/etc/tail-relay.json", "-v"]).unwrap();
        assert_eq!(args.config_file, Some(PathBuf::from("/etc/tail-relay.json")));
        assert!(args.version);
    }

    #[test]
    fn test_parse_rejects_unknown_and_extra() {
        assert!(Args::try_parse_from(["tail-relay", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["tail-relay", "a.json", "b.json"]).is_err());
        assert!(Args::try_parse_from(["tail-relay", "--remote-port", "notaport"]).is_err());
    }

    #[test]
    fn test_overrides_keyed_like_env() {
        let args = Args::try_parse_from([
            "tail-relay",
            "--stream",
            "a=/var/log/a.log",
            "--stream",
            "b=/var/log/b.log",
            "--remote-port",
            "7777",
            "--remote-proto",
            "udp",
        ])
        .unwrap();
        let overrides = args.overrides();

        assert_eq!(overrides["TAIL_RELAY_STREAMS"], "a=/var/log/a.log,b=/var/log/b.log");
        assert_eq!(overrides["TAIL_RELAY_REMOTE_PORT"], "7777");
        assert_eq!(overrides["TAIL_RELAY_REMOTE_PROTO"], "udp");
        assert!(!overrides.contains_key("TAIL_RELAY_REMOTE_HOST"));
    }

    #[test]
    fn test_command_line_beats_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{"streams": [{"id": "web", "path": "/var/log/web.log"}], "remote_port": 1514, "identifier": "from-file"}"#,
        )
        .unwrap();

        let args = Args::try_parse_from([
            "tail-relay",
            path.to_str().unwrap(),
            "--remote-port",
            "7777",
        ])
        .unwrap();
        let env = |key: &str| match key {
            "TAIL_RELAY_REMOTE_PORT" => Some("2514".to_string()),
            "TAIL_RELAY_IDENTIFIER" => Some("from-env".to_string()),
            _ => None,
        };

        let config = load_config(args.config_file.as_deref(), &args.overrides(), env).unwrap();
        assert_eq!(config.remote_port, 7777);
        assert_eq!(config.identifier, "from-env");
        assert_eq!(config.streams.len(), 1);
    }

    #[test]
    fn test_streams_from_command_line_only() {
        let args = Args::try_parse_from(["tail-relay", "--stream", "app=/var/log/app.log"]).unwrap();
        let config = load_config(None, &args.overrides(), no_env).unwrap();
        assert_eq!(config.streams[0].id, "app");
    }
}
