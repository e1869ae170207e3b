//! Everything related to noticing that watched files were modified,
//! replaced or deleted.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};

use crate::error::{Error, Result};

/// How file changes are detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    /// Filesystem change notifications (inotify, kqueue, ...).
    Notify,
    /// Re-stat every watched file on a fixed interval.
    Poll(Duration),
}

/// Why the watcher woke up.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Change {
    /// Notifications arrived for these watched files.
    Paths(HashSet<PathBuf>),
    /// A polling interval elapsed; every watched file should be re-read.
    Poll,
}

type EventResult = std::result::Result<notify::Event, notify::Error>;

struct NotifyWatcher {
    inner: notify::RecommendedWatcher,
    watched_directories: HashMap<PathBuf, usize>,
    event_stream: mpsc::UnboundedReceiver<EventResult>,
}

enum Strategy {
    Notify(NotifyWatcher),
    Poll(Interval),
}

/// Detects changes to the set of files being tailed.
///
/// In notify mode, the parent directory of each file is watched instead of
/// the file itself. That way a file replaced at the same path (rotation),
/// or deleted, shows up as an event for the path without re-arming
/// anything.
pub(crate) struct FileWatcher {
    strategy: Strategy,
    watched_files: HashSet<PathBuf>,
}

impl Debug for FileWatcher {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        let mut d = f.debug_struct("FileWatcher");
        match &self.strategy {
            Strategy::Notify(n) => d.field("watched_directories", &n.watched_directories),
            Strategy::Poll(i) => d.field("poll_interval", &i.period()),
        };
        d.field("watched_files", &self.watched_files).finish()
    }
}

impl FileWatcher {
    pub fn new(mode: WatchMode) -> Result<Self> {
        let strategy = match mode {
            WatchMode::Notify => {
                let (tx, rx) = mpsc::unbounded_channel();
                let inner = notify::recommended_watcher(move |res| {
                    // The only way `send` can fail is if the receiver is
                    // dropped, which means the watcher is going away too.
                    let _ = tx.send(res);
                })?;

                Strategy::Notify(NotifyWatcher {
                    inner,
                    watched_directories: HashMap::new(),
                    event_stream: rx,
                })
            }
            WatchMode::Poll(period) => {
                let mut interval = time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Strategy::Poll(interval)
            }
        };

        Ok(FileWatcher {
            strategy,
            watched_files: HashSet::new(),
        })
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.watched_files.contains(path)
    }

    /// Starts watching `path`, which must be canonical.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        if self.watched_files.contains(path) {
            return Ok(());
        }

        if let Strategy::Notify(watcher) = &mut self.strategy {
            let parent = path
                .parent()
                .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;
            watcher.add_directory(parent)?;
        }

        self.watched_files.insert(path.to_path_buf());

        Ok(())
    }

    pub fn remove_file(&mut self, path: &Path) -> Result<()> {
        if !self.watched_files.remove(path) {
            return Ok(());
        }

        match (&mut self.strategy, path.parent()) {
            (Strategy::Notify(watcher), Some(parent)) => watcher.remove_directory(parent),
            _ => Ok(()),
        }
    }

    /// Waits until something may have happened to a watched file.
    ///
    /// Cancel safe, so it can sit in a `select!` loop.
    pub async fn next_change(&mut self) -> Change {
        let watcher = match &mut self.strategy {
            Strategy::Poll(interval) => {
                interval.tick().await;
                return Change::Poll;
            }
            Strategy::Notify(watcher) => watcher,
        };

        loop {
            let first = match watcher.event_stream.recv().await {
                Some(res) => res,
                // The sender lives inside `inner`, so this can't happen while
                // the watcher is alive.
                None => std::future::pending().await,
            };

            // Coalesce whatever else has queued up since.
            let mut paths = HashSet::new();
            let mut next = Some(first);
            while let Some(res) = next {
                match res {
                    Ok(event) => {
                        if is_relevant(&event.kind) {
                            paths.extend(
                                event
                                    .paths
                                    .into_iter()
                                    .filter(|p| self.watched_files.contains(p)),
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Error receiving fs event"),
                }
                next = watcher.event_stream.try_recv().ok();
            }

            if !paths.is_empty() {
                return Change::Paths(paths);
            }
        }
    }
}

impl NotifyWatcher {
    fn add_directory(&mut self, path: &Path) -> Result<()> {
        if let Some(count) = self.watched_directories.get_mut(path) {
            *count += 1;
            return Ok(());
        }

        self.inner.watch(path, RecursiveMode::NonRecursive)?;
        self.watched_directories.insert(path.to_path_buf(), 1);

        Ok(())
    }

    fn remove_directory(&mut self, path: &Path) -> Result<()> {
        if let Some(count) = self.watched_directories.get(path).copied() {
            match count {
                0 => unreachable!(), // watch is removed if count == 1
                1 => {
                    // Remove from map first in case `unwatch` fails.
                    self.watched_directories.remove(path);
                    self.inner.unwatch(path)?;
                }
                _ => {
                    if let Some(count) = self.watched_directories.get_mut(path) {
                        *count -= 1;
                    }
                }
            }
        }

        Ok(())
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    // Our own reads generate access events; those never change content.
    !matches!(kind, EventKind::Access(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_directory_watch_is_refcounted() {
        let tmp_dir = tempdir().unwrap();
        let dir = std::fs::canonicalize(tmp_dir.path()).unwrap();
        let file1 = dir.join("one.log");
        let file2 = dir.join("two.log");
        std::fs::write(&file1, b"").unwrap();
        std::fs::write(&file2, b"").unwrap();

        let mut watcher = FileWatcher::new(WatchMode::Notify).unwrap();
        watcher.add_file(&file1).unwrap();
        watcher.add_file(&file2).unwrap();
        // Registering the same path again should be fine
        watcher.add_file(&file2).unwrap();

        let count = |w: &FileWatcher| match &w.strategy {
            Strategy::Notify(n) => n.watched_directories.get(&dir).copied(),
            Strategy::Poll(_) => None,
        };
        assert_eq!(count(&watcher), Some(2));

        watcher.remove_file(&file1).unwrap();
        assert_eq!(count(&watcher), Some(1));
        assert!(!watcher.is_watched(&file1));

        watcher.remove_file(&file2).unwrap();
        assert_eq!(count(&watcher), None);
    }

    #[tokio::test]
    async fn test_notify_reports_watched_files_only() {
        let tmp_dir = tempdir().unwrap();
        let dir = std::fs::canonicalize(tmp_dir.path()).unwrap();
        let watched = dir.join("watched.log");
        let other = dir.join("other.log");
        std::fs::write(&watched, b"").unwrap();

        let mut watcher = FileWatcher::new(WatchMode::Notify).unwrap();
        watcher.add_file(&watched).unwrap();

        std::fs::write(&other, b"noise\n").unwrap();
        std::fs::write(&watched, b"line\n").unwrap();

        let change = timeout(Duration::from_secs(5), watcher.next_change())
            .await
            .expect("no fs event for the watched file");

        assert_eq!(change, Change::Paths([watched].into_iter().collect()));
    }

    #[tokio::test]
    async fn test_poll_ticks() {
        let mut watcher = FileWatcher::new(WatchMode::Poll(Duration::from_millis(10))).unwrap();
        watcher.add_file(Path::new("/does/not/matter.log")).unwrap();

        for _ in 0..2 {
            let change = timeout(Duration::from_secs(1), watcher.next_change())
                .await
                .unwrap();
            assert_eq!(change, Change::Poll);
        }
    }
}
