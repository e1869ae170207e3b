//! What travels between a viewer and the hub.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::lister::FileEntry;

/// A request sent by a viewer, encoded as a JSON text frame such as
/// `{"type": "subscribe", "path": "app.log"}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Start tailing `path`, relative to the root. Replaces any previous
    /// subscription.
    Subscribe { path: String },
    /// Stop tailing the current file.
    Unsubscribe,
    /// Ask for the list of tailable files.
    List,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// Something pushed to a viewer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The subscription to `channel` is active; replayed lines follow.
    Attached { channel: Arc<str> },
    /// The subscription to `channel` ended at the viewer's request.
    Detached { channel: Arc<str> },
    /// One line of `channel`, without its terminator.
    Line {
        channel: Arc<str>,
        #[serde(serialize_with = "lossy_utf8")]
        data: Bytes,
    },
    /// `channel` was truncated or replaced; earlier lines are stale.
    Reset { channel: Arc<str> },
    /// `channel` is gone; nothing more will be sent for it.
    Eof { channel: Arc<str> },
    /// Answer to [`Command::List`].
    Index { files: Vec<FileEntry> },
    Error { message: String },
}

impl Message {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&Error> for Message {
    fn from(err: &Error) -> Self {
        Message::Error {
            message: err.to_string(),
        }
    }
}

fn lossy_utf8<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

/// Write end of a session's bounded outbound queue.
///
/// Pushing never waits: a full queue closes the session instead, so a slow
/// viewer can't hold up anyone else.
#[derive(Clone, Debug)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Message>,
    closing: CancellationToken,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Message>, closing: CancellationToken) -> Self {
        Outbox { tx, closing }
    }

    pub fn push(&self, msg: Message) -> Result<(), Error> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.closing.cancel();
                Err(Error::Backpressure)
            }
            Err(TrySendError::Closed(_)) => {
                self.closing.cancel();
                Err(Error::SessionClosed)
            }
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn close(&self) {
        self.closing.cancel();
    }
}
