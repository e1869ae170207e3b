//! Per-file tailing state and fan-out of new lines to subscribers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::events::{Change, FileWatcher};
use crate::hub::SessionId;
use crate::lister::Target;
use crate::message::{Message, Outbox};
use crate::reader::{Delta, Tail};

/// One actively tailed file.
struct Watch {
    channel: Arc<str>,
    tail: Tail,
    history: VecDeque<Bytes>,
    subscribers: HashMap<SessionId, Outbox>,
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Watch")
            .field("channel", &self.channel)
            .field("tail", &self.tail)
            .field("history", &self.history.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl Watch {
    fn remember(&mut self, line: &Bytes, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.history.len() == capacity {
            self.history.pop_front();
        }
        self.history.push_back(line.clone());
    }

    /// Pushes `msg` to every subscriber, collecting the ones that failed.
    fn broadcast(&mut self, msg: &Message, out: &mut FanOut) {
        self.subscribers.retain(|id, outbox| {
            // Already on its way out; don't bother queueing more.
            if !outbox.is_closing() && outbox.push(msg.clone()).is_ok() {
                return true;
            }
            out.dropped.push(*id);
            false
        });
    }
}

fn replay(watch: &Watch, outbox: &Outbox) -> Result<()> {
    outbox.push(Message::Attached {
        channel: watch.channel.clone(),
    })?;
    for line in &watch.history {
        outbox.push(Message::Line {
            channel: watch.channel.clone(),
            data: line.clone(),
        })?;
    }
    Ok(())
}

/// Sessions affected by a fan-out, for the client registry to act on.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FanOut {
    /// Outbox overflowed or closed; the session must be torn down.
    pub dropped: Vec<SessionId>,
    /// Still alive, but no longer subscribed because the watch ended.
    pub detached: Vec<SessionId>,
}

impl FanOut {
    fn merge(&mut self, other: FanOut) {
        self.dropped.extend(other.dropped);
        self.detached.extend(other.detached);
    }
}

/// Owns every [`Watch`] and the [`FileWatcher`] feeding them.
///
/// Nothing here is synchronized: the hub task is the only caller, which is
/// what keeps subscribe, unsubscribe and fan-out ordered per path.
pub(crate) struct TailHub {
    watches: HashMap<PathBuf, Watch>,
    watcher: FileWatcher,
    lines: usize,
    bytes: u64,
    max_line_size: usize,
}

impl fmt::Debug for TailHub {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("TailHub")
            .field("watches", &self.watches)
            .field("watcher", &self.watcher)
            .finish()
    }
}

impl TailHub {
    pub fn new(watcher: FileWatcher, lines: usize, bytes: u64, max_line_size: usize) -> Self {
        TailHub {
            watches: HashMap::new(),
            watcher,
            lines,
            bytes,
            max_line_size,
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.watches.values().map(|w| w.subscribers.len()).sum()
    }

    /// Attaches `outbox` to the watch for `target`, creating it if needed,
    /// and replays the buffered history to that outbox alone.
    ///
    /// Returns `Error::Backpressure` if the replay didn't fit; the session
    /// is then not attached.
    pub async fn subscribe(&mut self, target: &Target, id: SessionId, outbox: Outbox) -> Result<()> {
        if !self.watches.contains_key(&target.path) {
            self.create_watch(target).await?;
        }

        let watch = match self.watches.get_mut(&target.path) {
            Some(watch) => watch,
            None => return Err(Error::NotFound(target.channel.to_string())),
        };

        match replay(watch, &outbox) {
            Ok(()) => {
                watch.subscribers.insert(id, outbox);
                Ok(())
            }
            Err(e) => {
                if watch.subscribers.is_empty() {
                    self.release(&target.path);
                }
                Err(e)
            }
        }
    }

    async fn create_watch(&mut self, target: &Target) -> Result<()> {
        let (tail, initial) = Tail::open(&target.path, self.bytes, self.max_line_size)
            .await
            .map_err(|e| Error::from_io(e, &target.channel))?;

        self.watcher.add_file(&target.path)?;

        let mut watch = Watch {
            channel: target.channel.clone(),
            tail,
            history: VecDeque::with_capacity(self.lines),
            subscribers: HashMap::new(),
        };
        for line in &initial {
            watch.remember(line, self.lines);
        }

        tracing::debug!(path = %target.path.display(), offset = watch.tail.offset(), "Watch created");
        self.watches.insert(target.path.clone(), watch);

        Ok(())
    }

    /// Detaches session `id` from `path`, releasing the watch once nobody
    /// is left. Returns whether the session was attached.
    pub fn unsubscribe(&mut self, path: &Path, id: SessionId) -> bool {
        let (removed, now_empty) = match self.watches.get_mut(path) {
            Some(watch) => (
                watch.subscribers.remove(&id).is_some(),
                watch.subscribers.is_empty(),
            ),
            None => return false,
        };

        if now_empty {
            self.release(path);
        }

        removed
    }

    /// Buffers `lines` for `path` and pushes them to every subscriber, in
    /// order.
    pub fn on_lines(&mut self, path: &Path, lines: Vec<Bytes>) -> FanOut {
        let mut out = FanOut::default();
        let capacity = self.lines;

        if let Some(watch) = self.watches.get_mut(path) {
            for line in lines {
                watch.remember(&line, capacity);
                let msg = Message::Line {
                    channel: watch.channel.clone(),
                    data: line,
                };
                watch.broadcast(&msg, &mut out);
            }
        }

        out
    }

    /// The file was truncated or replaced: forget the old history and start
    /// over with `lines`.
    fn on_reset(&mut self, path: &Path, flushed: Option<Bytes>, lines: Vec<Bytes>) -> FanOut {
        let mut out = self.on_lines(path, flushed.into_iter().collect());

        if let Some(watch) = self.watches.get_mut(path) {
            tracing::info!(path = %path.display(), "File truncated or replaced");
            watch.history.clear();
            let msg = Message::Reset {
                channel: watch.channel.clone(),
            };
            watch.broadcast(&msg, &mut out);
        }

        out.merge(self.on_lines(path, lines));
        out
    }

    /// The file is gone: tell every subscriber and release the watch.
    pub fn on_eof(&mut self, path: &Path, flushed: Option<Bytes>) -> FanOut {
        let mut out = self.on_lines(path, flushed.into_iter().collect());

        if let Some(watch) = self.watches.get_mut(path) {
            tracing::info!(path = %path.display(), "File removed");
            let msg = Message::Eof {
                channel: watch.channel.clone(),
            };
            watch.broadcast(&msg, &mut out);
        }

        out.merge(self.end(path));
        out
    }

    /// Reading failed for a reason other than the file vanishing.
    fn on_error(&mut self, path: &Path, err: Error) -> FanOut {
        let mut out = FanOut::default();

        if let Some(watch) = self.watches.get_mut(path) {
            tracing::warn!(path = %path.display(), error = %err, "Failed to read watched file");
            watch.broadcast(&Message::from(&err), &mut out);
            let msg = Message::Eof {
                channel: watch.channel.clone(),
            };
            watch.broadcast(&msg, &mut out);
        }

        out.merge(self.end(path));
        out
    }

    /// Releases `path`, reporting its remaining subscribers as detached.
    fn end(&mut self, path: &Path) -> FanOut {
        let mut out = FanOut::default();
        if let Some(watch) = self.watches.get(path) {
            out.detached.extend(watch.subscribers.keys().copied());
        }
        self.release(path);
        out
    }

    /// Reads whatever changed in `path` and fans it out.
    pub async fn refresh(&mut self, path: &Path) -> FanOut {
        let delta = match self.watches.get_mut(path) {
            Some(watch) => watch.tail.read_new().await,
            None => return FanOut::default(),
        };

        match delta {
            Ok(Delta::Unchanged) => FanOut::default(),
            Ok(Delta::Appended(lines)) => self.on_lines(path, lines),
            Ok(Delta::Reset { flushed, lines }) => self.on_reset(path, flushed, lines),
            Ok(Delta::Gone { flushed }) => self.on_eof(path, flushed),
            Err(e) => {
                let name = self
                    .watches
                    .get(path)
                    .map(|w| w.channel.to_string())
                    .unwrap_or_default();
                self.on_error(path, Error::from_io(e, &name))
            }
        }
    }

    pub async fn refresh_all(&mut self) -> FanOut {
        let mut out = FanOut::default();
        let paths: Vec<PathBuf> = self.watches.keys().cloned().collect();
        for path in paths {
            out.merge(self.refresh(&path).await);
        }
        out
    }

    /// Waits for the watcher and applies whatever it reports.
    pub async fn next_change(&mut self) -> Change {
        self.watcher.next_change().await
    }

    pub async fn apply(&mut self, change: Change) -> FanOut {
        match change {
            Change::Poll => self.refresh_all().await,
            Change::Paths(paths) => {
                let mut out = FanOut::default();
                for path in paths {
                    out.merge(self.refresh(&path).await);
                }
                out
            }
        }
    }

    /// Removes session `id` from every watch.
    pub fn detach(&mut self, id: SessionId) {
        let emptied: Vec<PathBuf> = self
            .watches
            .iter_mut()
            .filter_map(|(path, watch)| {
                watch.subscribers.remove(&id);
                // Fan-out may already have removed `id` and left the watch idle.
                watch.subscribers.is_empty().then(|| path.clone())
            })
            .collect();

        for path in emptied {
            self.release(&path);
        }
    }

    fn release(&mut self, path: &Path) {
        if self.watches.remove(path).is_some() {
            if let Err(e) = self.watcher.remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to unwatch file");
            }
            debug_assert!(!self.watcher.is_watched(path));
            tracing::debug!(path = %path.display(), "Watch released");
        }
    }

    /// Drops every watch, leaving the watcher with nothing to report.
    pub fn shutdown(&mut self) {
        let paths: Vec<PathBuf> = self.watches.keys().cloned().collect();
        for path in paths {
            self.release(&path);
        }
    }
}
