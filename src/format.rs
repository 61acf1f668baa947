//! Message formatting for forwarded lines.
//!
//! Every forwarded line becomes one syslog-style record:
//!
//! ```text
//! <PRIORITY>TIMESTAMP STREAM_ID AGENT_ID BODY\n
//! ```
//!
//! `PRIORITY` is `facility * 8 + severity`, `TIMESTAMP` is the fixed-width
//! local time `Mmm dd HH:MM:SS` (day space-padded). The timestamp is not
//! computed per message: a shared [`Clock`] is refreshed by a timer and all
//! formatters read the cached value.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};

/// strftime pattern of the wire timestamp (always 15 characters)
pub const TIMESTAMP_FORMAT: &str = "%b %e %H:%M:%S";

/// Syslog facilities accepted by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facility {
    User,
    Local0,
    Local1,
    Local2,
    Local3,
    Local4,
    Local5,
    Local6,
    Local7,
}

impl Facility {
    /// Numeric syslog facility code.
    pub fn code(self) -> u8 {
        match self {
            Facility::User => 1,
            Facility::Local0 => 16,
            Facility::Local1 => 17,
            Facility::Local2 => 18,
            Facility::Local3 => 19,
            Facility::Local4 => 20,
            Facility::Local5 => 21,
            Facility::Local6 => 22,
            Facility::Local7 => 23,
        }
    }

    pub fn all() -> &'static [Facility] {
        &[
            Facility::User,
            Facility::Local0,
            Facility::Local1,
            Facility::Local2,
            Facility::Local3,
            Facility::Local4,
            Facility::Local5,
            Facility::Local6,
            Facility::Local7,
        ]
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facility::User => write!(f, "user"),
            local => write!(f, "local{}", local.code() - Facility::Local0.code()),
        }
    }
}

impl FromStr for Facility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        Facility::all()
            .iter()
            .copied()
            .find(|facility| facility.to_string() == wanted)
            .ok_or_else(|| {
                format!(
                    "invalid facility '{}', must be one of 'user' or between 'local0-local7'",
                    s
                )
            })
    }
}

/// Syslog severities, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Severity {
    /// Numeric syslog severity code.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Emerg => write!(f, "emerg"),
            Severity::Alert => write!(f, "alert"),
            Severity::Crit => write!(f, "crit"),
            Severity::Err => write!(f, "err"),
            Severity::Warning => write!(f, "warning"),
            Severity::Notice => write!(f, "notice"),
            Severity::Info => write!(f, "info"),
            Severity::Debug => write!(f, "debug"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emerg" | "emergency" => Ok(Severity::Emerg),
            "alert" => Ok(Severity::Alert),
            "crit" | "critical" => Ok(Severity::Crit),
            "err" | "error" => Ok(Severity::Err),
            "warning" | "warn" => Ok(Severity::Warning),
            "notice" => Ok(Severity::Notice),
            "info" => Ok(Severity::Info),
            "debug" => Ok(Severity::Debug),
            _ => Err(format!("invalid severity '{}'", s)),
        }
    }
}

/// Combine facility and severity into the wire priority.
pub fn priority(facility: Facility, severity: Severity) -> u8 {
    facility.code() * 8 + severity.code()
}

/// Render a point in time as a wire timestamp.
pub fn timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Shared, periodically refreshed wire timestamp.
///
/// Cloning is cheap; all clones observe the same value.
#[derive(Debug, Clone)]
pub struct Clock {
    current: Arc<RwLock<String>>,
}

impl Clock {
    /// Create a clock holding the current local time.
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(timestamp(&Local::now()))),
        }
    }

    /// Create a clock frozen at a given timestamp until the next refresh.
    pub fn fixed(value: impl Into<String>) -> Self {
        Self {
            current: Arc::new(RwLock::new(value.into())),
        }
    }

    /// Store the current local time.
    pub fn refresh(&self) {
        self.set(timestamp(&Local::now()));
    }

    pub fn set(&self, value: String) {
        if let Ok(mut current) = self.current.write() {
            *current = value;
        }
    }

    /// Current cached timestamp.
    pub fn now(&self) -> String {
        self.current
            .read()
            .map(|current| current.clone())
            .unwrap_or_default()
    }

    /// Refresh the cached timestamp every `period`, forever.
    pub async fn run(self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.refresh();
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns line bodies into wire records.
///
/// Holds everything that is fixed for the lifetime of the agent; the only
/// moving part is the shared [`Clock`].
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    priority: u8,
    identifier: String,
    clock: Clock,
}

impl MessageFormatter {
    pub fn new(
        facility: Facility,
        severity: Severity,
        identifier: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            priority: priority(facility, severity),
            identifier: identifier.into(),
            clock,
        }
    }

    /// Format one body from stream `stream_id`.
    pub fn format(&self, stream_id: &str, body: &[u8]) -> Vec<u8> {
        format_message(
            self.priority,
            &self.clock.now(),
            stream_id,
            &self.identifier,
            body,
        )
    }
}

/// Pure formatting of one record, terminated by `\n`.
pub fn format_message(
    priority: u8,
    timestamp: &str,
    stream_id: &str,
    identifier: &str,
    body: &[u8],
) -> Vec<u8> {
    let header = format!("<{}>{} {} {} ", priority, timestamp, stream_id, identifier);
    let mut message = Vec::with_capacity(header.len() + body.len() + 1);
    message.extend_from_slice(header.as_bytes());
    message.extend_from_slice(body);
    message.push(b'\n');
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_priority() {
        assert_eq!(priority(Facility::Local0, Severity::Info), 134);
        assert_eq!(priority(Facility::User, Severity::Notice), 13);
        assert_eq!(priority(Facility::Local7, Severity::Emerg), 184);
    }

    #[test]
    fn test_facility_parse_and_display() {
        for facility in Facility::all() {
            let parsed: Facility = facility.to_string().parse().unwrap();
            assert_eq!(parsed, *facility);
        }
        assert_eq!("LOCAL5".parse::<Facility>().unwrap(), Facility::Local5);
        assert!("local8".parse::<Facility>().is_err());
        assert!("kern".parse::<Facility>().is_err());
    }

    #[test]
    fn test_severity_aliases() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("error".parse::<Severity>().unwrap(), Severity::Err);
        assert_eq!("Info".parse::<Severity>().unwrap(), Severity::Info);
        assert!("loud".parse::<Severity>().is_err());
        assert_eq!(Severity::Debug.code(), 7);
    }

    #[test]
    fn test_facility_deserialization() {
        let facility: Facility = serde_json::from_str("\"local2\"").unwrap();
        assert_eq!(facility, Facility::Local2);
        let severity: Severity = serde_json::from_str("\"notice\"").unwrap();
        assert_eq!(severity, Severity::Notice);
    }

    #[test]
    fn test_timestamp_is_fixed_width() {
        let single_digit_day = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(timestamp(&single_digit_day), "Mar  5 07:08:09");

        let double_digit_day = Utc.with_ymd_and_hms(2024, 12, 25, 23, 59, 0).unwrap();
        assert_eq!(timestamp(&double_digit_day), "Dec 25 23:59:00");
    }

    #[test]
    fn test_format_message() {
        let message = format_message(134, "Mar  5 07:08:09", "web", "edge-01", b"GET /index");
        assert_eq!(message, b"<134>Mar  5 07:08:09 web edge-01 GET /index\n".to_vec());
    }

    #[test]
    fn test_formatter_reads_shared_clock() {
        let clock = Clock::fixed("Jan  1 00:00:00");
        let formatter =
            MessageFormatter::new(Facility::User, Severity::Info, "agent", clock.clone());

        assert_eq!(
            formatter.format("app", b"hello"),
            b"<14>Jan  1 00:00:00 app agent hello\n".to_vec()
        );

        clock.set("Jan  1 00:00:01".to_string());
        assert_eq!(
            formatter.format("app", b"hello"),
            b"<14>Jan  1 00:00:01 app agent hello\n".to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_run_refreshes() {
        let clock = Clock::fixed("stale");
        let handle = tokio::spawn(clock.clone().run(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_ne!(clock.now(), "stale");
        assert_eq!(clock.now().len(), 15);

        handle.abort();
    }
}
