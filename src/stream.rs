//! Tailing of a single file.
//!
//! A [`Stream`] owns one configured path. It opens the file (retrying up to
//! the configured number of attempts), arms a change watch and a poll timer,
//! and forwards every complete line appended after the first size check.
//! Reads run on the blocking pool; the open file handle travels with the read
//! and comes back with its result, so at most one read is ever in flight.
//!
//! The stream closes and reopens its file when the path is renamed, removed
//! or replaced by a different file. A shrinking file is treated as truncated
//! and is read again from the start.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::agent::Context;
use crate::config::StreamConfig;
use crate::format::MessageFormatter;
use crate::pipeline::{LinePipeline, PipelineCounters};
use crate::transport::TransportHandle;
use crate::watch::{FileEvent, FileWatch};

/// Bytes requested from the file per read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Opening,
    RetryWait,
    Open,
    Watching,
    Reading,
    Closing,
    Stopped,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Opening,
            1 => StreamState::RetryWait,
            2 => StreamState::Open,
            3 => StreamState::Watching,
            4 => StreamState::Reading,
            5 => StreamState::Closing,
            _ => StreamState::Stopped,
        }
    }
}

/// Counters shared between a stream task and observers.
#[derive(Debug, Default)]
pub struct StreamStats {
    state: AtomicU8,
    bytes_read: AtomicU64,
    lines: AtomicU64,
    emitted: AtomicU64,
    duplicates: AtomicU64,
    suppressed: AtomicU64,
    open_attempts: AtomicU64,
    reopens: AtomicU64,
    truncations: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStatsSnapshot {
    pub state: StreamState,
    pub bytes_read: u64,
    pub lines: u64,
    pub emitted: u64,
    pub duplicates: u64,
    pub suppressed: u64,
    pub open_attempts: u64,
    pub reopens: u64,
    pub truncations: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            state: self.state(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            open_attempts: self.open_attempts.load(Ordering::Relaxed),
            reopens: self.reopens.load(Ordering::Relaxed),
            truncations: self.truncations.load(Ordering::Relaxed),
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn record_counters(&self, counters: PipelineCounters) {
        self.lines.store(counters.lines, Ordering::Relaxed);
        self.emitted.store(counters.emitted, Ordering::Relaxed);
        self.duplicates.store(counters.duplicates, Ordering::Relaxed);
        self.suppressed.store(counters.suppressed, Ordering::Relaxed);
    }
}

/// Device and inode of an open file, used to spot a replaced path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Why an open file is being closed.
#[derive(Debug)]
enum CloseReason {
    Renamed,
    Replaced,
    Deleted,
    Io(io::Error),
    ReaderLost(JoinError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Renamed => write!(f, "file renamed or removed"),
            CloseReason::Replaced => write!(f, "path now refers to a different file"),
            CloseReason::Deleted => write!(f, "file no longer exists"),
            CloseReason::Io(e) => write!(f, "I/O error: {}", e),
            CloseReason::ReaderLost(e) => write!(f, "read task failed: {}", e),
        }
    }
}

/// Open file plus its read buffer.
struct Reader {
    file: File,
    buf: Box<[u8]>,
}

/// Outcome of one blocking read. Carries the reader back to the stream.
struct ReadDone {
    reader: Reader,
    epoch: u64,
    result: io::Result<usize>,
}

impl Reader {
    fn new(file: File) -> Self {
        Self {
            file,
            buf: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    fn read_at(mut self, offset: u64, epoch: u64) -> ReadDone {
        let result = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read(&mut self.buf));
        ReadDone {
            reader: self,
            epoch,
            result,
        }
    }
}

/// Where the reader currently is. A read may only start from `Idle`.
enum ReadSlot {
    Idle(Reader),
    InFlight(JoinHandle<ReadDone>),
    Lost,
}

/// One tailed file.
pub struct Stream {
    id: String,
    path: PathBuf,
    max_open_attempts: u32,
    open_retry_delay: Duration,
    truncate_limit: u64,
    poll_interval: Duration,
    formatter: MessageFormatter,
    transport: TransportHandle,
    pipeline: LinePipeline,
    attempts: u32,
    /// File size at the last check; `None` until the first check after open
    size: Option<u64>,
    /// Next byte to read
    offset: u64,
    /// Bumped whenever `offset` is reset, to discard reads issued before
    epoch: u64,
    pending_truncate: bool,
    stats: Arc<StreamStats>,
}

impl Stream {
    pub fn new(context: &Context, config: &StreamConfig) -> Self {
        let settings = &context.config;
        Self {
            id: config.id.clone(),
            path: config.path.clone(),
            max_open_attempts: settings.max_open_attempts,
            open_retry_delay: settings.open_retry_delay,
            truncate_limit: settings.truncate_limit,
            poll_interval: settings.poll_interval,
            formatter: context.formatter.clone(),
            transport: context.transport.clone(),
            pipeline: LinePipeline::new(
                settings.rate_limit,
                settings.rate_window,
                settings.repeat_threshold,
            ),
            attempts: 0,
            size: None,
            offset: 0,
            epoch: 0,
            pending_truncate: false,
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Open, follow and reopen the file until open attempts run out.
    pub async fn run(mut self) {
        loop {
            let Some((file, identity)) = self.open().await else {
                self.stats.set_state(StreamState::Stopped);
                return;
            };

            let reason = self.follow(file, identity).await;
            warn!(
                stream = %self.id,
                path = %self.path.display(),
                reason = %reason,
                "Closing file, attempting to re-open"
            );
            self.stats.reopens.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn open(&mut self) -> Option<(File, Option<FileIdentity>)> {
        loop {
            self.stats.set_state(StreamState::Opening);
            self.attempts += 1;
            self.stats.open_attempts.fetch_add(1, Ordering::Relaxed);

            match tokio::fs::File::open(&self.path).await {
                Ok(file) => {
                    let identity = file
                        .metadata()
                        .await
                        .ok()
                        .and_then(|meta| FileIdentity::of(&meta));
                    info!(stream = %self.id, path = %self.path.display(), "File opened");
                    self.attempts = 0;
                    return Some((file.into_std().await, identity));
                }
                Err(e) => {
                    warn!(
                        stream = %self.id,
                        path = %self.path.display(),
                        attempt = self.attempts,
                        max_attempts = self.max_open_attempts,
                        error = %e,
                        "Error opening file"
                    );
                }
            }

            if self.max_open_attempts != 0 && self.attempts >= self.max_open_attempts {
                warn!(
                    stream = %self.id,
                    path = %self.path.display(),
                    attempts = self.attempts,
                    "Reached max open attempts, giving up on file"
                );
                return None;
            }

            self.stats.set_state(StreamState::RetryWait);
            sleep(self.open_retry_delay).await;
        }
    }

    /// Follow an open file until it has to be closed.
    async fn follow(&mut self, file: File, identity: Option<FileIdentity>) -> CloseReason {
        self.stats.set_state(StreamState::Open);
        self.size = None;
        self.pending_truncate = false;
        self.epoch += 1;

        let mut watch = match FileWatch::new(&self.path) {
            Ok(watch) => Some(watch),
            Err(e) => {
                warn!(stream = %self.id, error = %e, "Falling back to polling");
                None
            }
        };

        let mut slot = ReadSlot::Idle(Reader::new(file));
        // first tick completes immediately and takes the initial size
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let outcome = tokio::select! {
                done = wait_read(&mut slot) => self.complete_read(&mut slot, done).await,
                event = next_event(&mut watch) => match event {
                    Some(FileEvent::Changed) => self.check_size(&mut slot, identity).await,
                    Some(FileEvent::Renamed) => Err(CloseReason::Renamed),
                    None => {
                        warn!(stream = %self.id, "File watch stopped, relying on polling");
                        watch = None;
                        Ok(())
                    }
                },
                _ = poll.tick() => self.check_size(&mut slot, identity).await,
            };

            if let Err(reason) = outcome {
                break reason;
            }
        };

        self.close(slot).await;
        reason
    }

    /// Stat the path and schedule a read if there may be new content.
    async fn check_size(
        &mut self,
        slot: &mut ReadSlot,
        identity: Option<FileIdentity>,
    ) -> Result<(), CloseReason> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CloseReason::Deleted),
            Err(e) => return Err(CloseReason::Io(e)),
        };

        if let (Some(open), Some(current)) = (identity, FileIdentity::of(&meta)) {
            if open != current {
                return Err(CloseReason::Replaced);
            }
        }

        let size = meta.len();
        match self.size {
            None => {
                debug!(stream = %self.id, size, "Skipping existing content");
                self.offset = size;
            }
            Some(last) if size < last || size < self.offset => {
                warn!(
                    stream = %self.id,
                    path = %self.path.display(),
                    last_size = last,
                    size,
                    "File truncated, reading from start"
                );
                self.offset = 0;
                self.epoch += 1;
                self.restart_pipeline();
            }
            Some(_) => {}
        }
        self.size = Some(size);

        if self.truncate_limit > 0 && size > self.truncate_limit && !self.pending_truncate {
            info!(
                stream = %self.id,
                size,
                limit = self.truncate_limit,
                "File exceeds truncate limit, truncating once drained"
            );
            self.pending_truncate = true;
        }

        self.start_read(slot);
        Ok(())
    }

    fn start_read(&mut self, slot: &mut ReadSlot) {
        match std::mem::replace(slot, ReadSlot::Lost) {
            ReadSlot::Idle(reader) => {
                let offset = self.offset;
                let epoch = self.epoch;
                self.stats.set_state(StreamState::Reading);
                *slot = ReadSlot::InFlight(tokio::task::spawn_blocking(move || {
                    reader.read_at(offset, epoch)
                }));
            }
            other => {
                trace!(stream = %self.id, "Read already in flight");
                *slot = other;
            }
        }
    }

    async fn complete_read(
        &mut self,
        slot: &mut ReadSlot,
        done: Result<ReadDone, JoinError>,
    ) -> Result<(), CloseReason> {
        let ReadDone {
            reader,
            epoch,
            result,
        } = match done {
            Ok(done) => done,
            Err(e) => {
                *slot = ReadSlot::Lost;
                return Err(CloseReason::ReaderLost(e));
            }
        };

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                *slot = ReadSlot::Idle(reader);
                return Err(CloseReason::Io(e));
            }
        };

        self.stats.set_state(StreamState::Watching);
        if epoch != self.epoch {
            trace!(stream = %self.id, "Discarding read issued before truncation");
            *slot = ReadSlot::Idle(reader);
            self.start_read(slot);
            return Ok(());
        }

        self.consume(&reader.buf[..n]);

        if self.pending_truncate && n < READ_CHUNK_SIZE {
            self.truncate().await;
        }

        *slot = ReadSlot::Idle(reader);
        if n == READ_CHUNK_SIZE {
            self.start_read(slot);
        }
        Ok(())
    }

    fn consume(&mut self, bytes: &[u8]) {
        self.offset += bytes.len() as u64;
        self.stats
            .bytes_read
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let mut sink = forward(&self.id, &self.formatter, &self.transport);
        self.pipeline.feed(bytes, Instant::now(), &mut sink);
        self.stats.record_counters(self.pipeline.counters());
    }

    fn restart_pipeline(&mut self) {
        let mut sink = forward(&self.id, &self.formatter, &self.transport);
        self.pipeline.restart(Instant::now(), &mut sink);
        self.stats.record_counters(self.pipeline.counters());
    }

    /// Empty the file on disk after it grew past the truncate limit.
    async fn truncate(&mut self) {
        self.pending_truncate = false;

        let result = async {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await?;
            file.set_len(0).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(stream = %self.id, path = %self.path.display(), "File truncated");
                self.stats.truncations.fetch_add(1, Ordering::Relaxed);
                self.offset = 0;
                self.size = Some(0);
                self.epoch += 1;
            }
            Err(e) => {
                warn!(
                    stream = %self.id,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to truncate file"
                );
            }
        }
    }

    /// Wait out any in-flight read, forward what it returned and release the
    /// file. The partial line of the old file is dropped.
    async fn close(&mut self, slot: ReadSlot) {
        self.stats.set_state(StreamState::Closing);

        if let ReadSlot::InFlight(handle) = slot {
            match handle.await {
                Ok(ReadDone {
                    reader,
                    epoch,
                    result: Ok(n),
                }) if epoch == self.epoch => self.consume(&reader.buf[..n]),
                Ok(_) => {}
                Err(e) => warn!(stream = %self.id, error = %e, "Read task failed during close"),
            }
        }

        self.restart_pipeline();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn forward<'a>(
    id: &'a str,
    formatter: &'a MessageFormatter,
    transport: &'a TransportHandle,
) -> impl FnMut(&[u8]) + 'a {
    move |body| {
        transport.submit(formatter.format(id, body));
    }
}

async fn wait_read(slot: &mut ReadSlot) -> Result<ReadDone, JoinError> {
    match slot {
        ReadSlot::InFlight(handle) => handle.await,
        _ => std::future::pending().await,
    }
}

async fn next_event(watch: &mut Option<FileWatch>) -> Option<FileEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}
