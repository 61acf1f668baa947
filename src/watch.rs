//! File-change notification for a single tailed path.
//!
//! Wraps a `notify` watcher on one file and reduces its events to the two
//! cases a stream cares about: the content may have changed, or the file was
//! renamed away / removed.

use std::fmt;
use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    /// Content or metadata changed; the size should be checked
    Changed,
    /// The file was renamed or removed; the handle must be reopened
    Renamed,
}

impl FileEvent {
    /// Map a raw notification to a file event. Access events are ignored.
    pub fn classify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Access(_) => None,
            EventKind::Modify(ModifyKind::Name(_)) => Some(FileEvent::Renamed),
            EventKind::Remove(_) => Some(FileEvent::Renamed),
            EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Any
            | EventKind::Other => Some(FileEvent::Changed),
        }
    }
}

/// Errors raised while arming a watch.
#[derive(Debug)]
pub enum WatchError {
    /// The platform watcher could not be created
    Init(notify::Error),
    /// The path could not be registered
    Watch { path: PathBuf, source: notify::Error },
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Init(e) => write!(f, "failed to create file watcher: {}", e),
            WatchError::Watch { path, source } => {
                write!(f, "failed to watch {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Init(e) => Some(e),
            WatchError::Watch { source, .. } => Some(source),
        }
    }
}

/// A live watch on one file. Dropping it releases the watch.
pub struct FileWatch {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatch {
    /// Arm a watch on `path`, which must exist.
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watched = path.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if let Some(file_event) = FileEvent::classify(&event.kind) {
                        trace!(path = %watched.display(), kind = ?event.kind, "File event");
                        // receiver gone means the stream already closed this watch
                        let _ = tx.send(file_event);
                    }
                }
                Err(e) => warn!(path = %watched.display(), error = %e, "File watcher error"),
            }
        })
        .map_err(WatchError::Init)?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Wait for the next event. `None` means the watcher stopped delivering.
    pub async fn next(&mut self) -> Option<FileEvent> {
        self.events.recv().await
    }
}

impl fmt::Debug for FileWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatch").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn test_classify_events() {
        assert_eq!(
            FileEvent::classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FileEvent::Changed)
        );
        assert_eq!(
            FileEvent::classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            Some(FileEvent::Changed)
        );
        assert_eq!(
            FileEvent::classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(FileEvent::Renamed)
        );
        assert_eq!(
            FileEvent::classify(&EventKind::Remove(RemoveKind::File)),
            Some(FileEvent::Renamed)
        );
        assert_eq!(
            FileEvent::classify(&EventKind::Create(CreateKind::File)),
            Some(FileEvent::Changed)
        );
        assert_eq!(
            FileEvent::classify(&EventKind::Access(notify::event::AccessKind::Any)),
            None
        );
    }

    #[test]
    fn test_watch_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWatch::new(&dir.path().join("missing.log")).unwrap_err();
        assert!(matches!(err, WatchError::Watch { .. }));
        assert!(err.to_string().contains("missing.log"));
    }

    #[tokio::test]
    async fn test_watch_reports_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();

        let mut watch = FileWatch::new(&path).unwrap();
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"line\n").unwrap();
        }

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), watch.next())
            .await
            .expect("event should arrive");
        assert_eq!(event, Some(FileEvent::Changed));
    }
}
