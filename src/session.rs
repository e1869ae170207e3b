//! One connected viewer.

use std::fmt;
use std::sync::Arc;

use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hub::{HubHandle, SessionId};
use crate::lister::DirectoryLister;
use crate::message::{Command, Message, Outbox};

/// Consecutive malformed frames tolerated before the session is closed.
const MAX_PROTOCOL_ERRORS: usize = 16;

/// Where a session is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Subscribed,
    Closing,
    Closed,
}

/// A viewer attached to the hub over some duplex message channel.
///
/// The channel is handed to [`Session::run`] as a stream of inbound text
/// frames and a sink of outbound [`Message`]s. How it was established
/// (websocket upgrade, unix socket, ...) doesn't matter here.
pub struct Session {
    id: SessionId,
    hub: HubHandle,
    lister: Arc<DirectoryLister>,
    buffer_size: usize,
    trace: bool,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        hub: HubHandle,
        lister: Arc<DirectoryLister>,
        buffer_size: usize,
        trace: bool,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);

        Session {
            id: hub.next_session_id(),
            hub,
            lister,
            buffer_size,
            trace,
            state,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns a receiver that follows the session's state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Serves the viewer until either side hangs up, the outbox overflows,
    /// or the hub shuts down.
    ///
    /// Returns the error that ended the session, if any. A clean hang-up
    /// or hub shutdown is `Ok`.
    pub async fn run<I, O, E>(self, inbound: I, outbound: O) -> Result<()>
    where
        I: Stream<Item = Result<String, E>>,
        O: Sink<Message>,
        O::Error: fmt::Display,
        E: fmt::Display,
    {
        tokio::pin!(inbound);
        tokio::pin!(outbound);

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let closing = self.hub.session_token();
        let outbox = Outbox::new(tx, closing.clone());

        if let Err(e) = self.hub.register(self.id, outbox.clone()).await {
            tracing::warn!(session = self.id, error = %e, "Failed to register session");
            self.set_state(SessionState::Closed);
            return Err(e);
        }
        self.set_state(SessionState::Registered);
        tracing::debug!(session = self.id, "Session registered");

        let res = tokio::select! {
            res = self.read_pump(inbound.as_mut(), &outbox, &closing) => res,
            res = self.write_pump(rx, outbound.as_mut(), &closing) => res,
        };

        self.set_state(SessionState::Closing);
        closing.cancel();
        drop(outbox);
        self.hub.unregister(self.id).await;
        self.set_state(SessionState::Closed);

        match &res {
            Ok(()) => tracing::debug!(session = self.id, "Session closed"),
            Err(e) => tracing::info!(session = self.id, error = %e, "Session closed"),
        }
        res
    }

    /// Reads commands off the transport and carries them out.
    async fn read_pump<I, E>(
        &self,
        mut inbound: I,
        outbox: &Outbox,
        closing: &CancellationToken,
    ) -> Result<()>
    where
        I: Stream<Item = Result<String, E>> + Unpin,
        E: fmt::Display,
    {
        let mut protocol_errors = 0;

        loop {
            let frame = tokio::select! {
                _ = closing.cancelled() => return self.closed_reason(),
                frame = inbound.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::debug!(session = self.id, error = %e, "Transport read failed");
                    return Ok(());
                }
                // Hung up.
                None => return Ok(()),
            };

            let command = match frame.parse::<Command>() {
                Ok(command) => {
                    protocol_errors = 0;
                    command
                }
                Err(e) => {
                    protocol_errors += 1;
                    outbox.push(Message::from(&e))?;
                    if protocol_errors >= MAX_PROTOCOL_ERRORS {
                        return Err(e);
                    }
                    continue;
                }
            };

            if self.trace {
                tracing::debug!(session = self.id, ?command, "Session command");
            }

            match self.execute(command).await {
                Ok(Some(msg)) => outbox.push(msg)?,
                Ok(None) => {}
                Err(e @ (Error::Backpressure | Error::SessionClosed | Error::ShuttingDown)) => {
                    return Err(e)
                }
                Err(e) => outbox.push(Message::from(&e))?,
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<Option<Message>> {
        match command {
            Command::Subscribe { path } => {
                let target = self.lister.resolve(&path).await?;
                self.hub.subscribe(self.id, target).await?;
                self.set_state(SessionState::Subscribed);
                Ok(None)
            }
            Command::Unsubscribe => {
                self.hub.unsubscribe(self.id).await?;
                self.set_state(SessionState::Registered);
                Ok(None)
            }
            Command::List => {
                let files = self.lister.list().await?;
                Ok(Some(Message::Index { files }))
            }
        }
    }

    /// Delivers queued messages to the transport.
    async fn write_pump<O>(
        &self,
        mut rx: mpsc::Receiver<Message>,
        mut outbound: O,
        closing: &CancellationToken,
    ) -> Result<()>
    where
        O: Sink<Message> + Unpin,
        O::Error: fmt::Display,
    {
        loop {
            let msg = tokio::select! {
                _ = closing.cancelled() => return self.closed_reason(),
                msg = rx.recv() => msg,
            };
            let msg = match msg {
                Some(msg) => msg,
                None => return Ok(()),
            };

            if let Message::Eof { .. } = msg {
                self.set_state(SessionState::Registered);
            }

            tokio::select! {
                _ = closing.cancelled() => return self.closed_reason(),
                res = outbound.send(msg) => {
                    if let Err(e) = res {
                        tracing::debug!(session = self.id, error = %e, "Transport write failed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Why `closing` fired while the session was still running: either the
    /// hub is shutting down, which is a normal close, or the hub gave up on
    /// this session's outbox.
    fn closed_reason(&self) -> Result<()> {
        if self.hub.is_shutting_down() {
            Ok(())
        } else {
            Err(Error::Backpressure)
        }
    }
}
