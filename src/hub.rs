//! The hub task: the only place where sessions and watches are mutated.
//!
//! Sessions talk to it through a cloneable [`HubHandle`]. Every request,
//! and every batch of file changes reported by the watcher, is handled to
//! completion before the next one, which gives a single total order to
//! subscribe, unsubscribe and fan-out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::FileWatcher;
use crate::lister::Target;
use crate::message::{Message, Outbox};
use crate::tail::{FanOut, TailHub};

/// Opaque identity of a connected session.
pub type SessionId = u64;

const REQUEST_QUEUE: usize = 1024;

/// Counters describing the hub's current state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Files currently tailed.
    pub watches: usize,
    /// Session attachments over all watches.
    pub subscribers: usize,
}

enum Request {
    Register {
        id: SessionId,
        outbox: Outbox,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        id: SessionId,
        target: Target,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            Request::Register { id, .. } => write!(f, "Register({})", id),
            Request::Unregister { id, .. } => write!(f, "Unregister({})", id),
            Request::Subscribe { id, target, .. } => {
                write!(f, "Subscribe({}, {:?})", id, target.channel)
            }
            Request::Unsubscribe { id, .. } => write!(f, "Unsubscribe({})", id),
            Request::Stats { .. } => write!(f, "Stats"),
        }
    }
}

/// Cheap, cloneable access to a running hub.
#[derive(Clone, Debug)]
pub struct HubHandle {
    requests: mpsc::Sender<Request>,
    shutdown: CancellationToken,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Token cancelled when the session must close, be it through hub
    /// shutdown or its own outbox overflowing.
    pub(crate) fn session_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    pub(crate) async fn register(&self, id: SessionId, outbox: Outbox) -> Result<()> {
        self.call(|reply| Request::Register { id, outbox, reply })
            .await?
    }

    /// Removes the session everywhere. Once this returns, the hub holds no
    /// reference to its outbox.
    pub(crate) async fn unregister(&self, id: SessionId) {
        // A hub that is gone has already let go of everything.
        let _ = self.call(|reply| Request::Unregister { id, reply }).await;
    }

    pub(crate) async fn subscribe(&self, id: SessionId, target: Target) -> Result<()> {
        self.call(|reply| Request::Subscribe { id, target, reply })
            .await?
    }

    pub(crate) async fn unsubscribe(&self, id: SessionId) -> Result<()> {
        self.call(|reply| Request::Unsubscribe { id, reply }).await?
    }

    pub async fn stats(&self) -> Result<HubStats> {
        self.call(|reply| Request::Stats { reply }).await
    }

    /// Stops the hub: the watcher halts, every session is told to close and
    /// all watches are released. Further requests fail with
    /// `Error::ShuttingDown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// A connected session, as far as the hub is concerned.
#[derive(Debug)]
struct Client {
    outbox: Outbox,
    subscription: Option<Target>,
}

/// Registry of connected sessions.
#[derive(Debug, Default)]
struct ClientHub {
    clients: HashMap<SessionId, Client>,
}

impl ClientHub {
    fn register(&mut self, id: SessionId, outbox: Outbox) -> Result<()> {
        debug_assert!(
            !self.clients.contains_key(&id),
            "session {} registered twice",
            id
        );
        if self.clients.contains_key(&id) {
            return Err(Error::DuplicateSession);
        }

        self.clients.insert(
            id,
            Client {
                outbox,
                subscription: None,
            },
        );
        Ok(())
    }

    fn unregister(&mut self, id: SessionId) -> Option<Client> {
        self.clients.remove(&id)
    }

    fn get_mut(&mut self, id: SessionId) -> Result<&mut Client> {
        self.clients.get_mut(&id).ok_or(Error::UnknownSession)
    }

    fn len(&self) -> usize {
        self.clients.len()
    }
}

pub(crate) struct Hub {
    clients: ClientHub,
    tail: TailHub,
    requests: mpsc::Receiver<Request>,
    shutdown: CancellationToken,
    trace: bool,
}

impl Hub {
    /// Starts the hub task for `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &Config) -> Result<(HubHandle, JoinHandle<()>)> {
        let watcher = FileWatcher::new(config.watch_mode())?;
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let shutdown = CancellationToken::new();

        let hub = Hub {
            clients: ClientHub::default(),
            tail: TailHub::new(watcher, config.lines, config.bytes, config.max_line_size),
            requests: rx,
            shutdown: shutdown.clone(),
            trace: config.trace,
        };
        let handle = HubHandle {
            requests: tx,
            shutdown,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        Ok((handle, tokio::spawn(hub.run())))
    }

    async fn run(mut self) {
        tracing::debug!("Hub started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                req = self.requests.recv() => match req {
                    Some(req) => self.handle(req).await,
                    None => break,
                },
                change = self.tail.next_change() => {
                    if self.trace {
                        tracing::debug!(?change, "Watcher change");
                    }
                    let out = self.tail.apply(change).await;
                    self.settle(out);
                }
            }
        }

        self.close();
        tracing::debug!("Hub stopped");
    }

    async fn handle(&mut self, req: Request) {
        if self.trace {
            tracing::debug!(?req, "Hub request");
        }

        match req {
            Request::Register { id, outbox, reply } => {
                let _ = reply.send(self.clients.register(id, outbox));
            }
            Request::Unregister { id, reply } => {
                self.drop_client(id);
                let _ = reply.send(());
            }
            Request::Subscribe { id, target, reply } => {
                let res = self.subscribe(id, target).await;
                let _ = reply.send(self.check_outbox(id, res));
            }
            Request::Unsubscribe { id, reply } => {
                let res = self.unsubscribe(id);
                let _ = reply.send(self.check_outbox(id, res));
            }
            Request::Stats { reply } => {
                let _ = reply.send(HubStats {
                    sessions: self.clients.len(),
                    watches: self.tail.watch_count(),
                    subscribers: self.tail.subscriber_count(),
                });
            }
        }
    }

    async fn subscribe(&mut self, id: SessionId, target: Target) -> Result<()> {
        let client = self.clients.get_mut(id)?;
        let outbox = client.outbox.clone();

        if let Some(previous) = client.subscription.take() {
            self.tail.unsubscribe(&previous.path, id);
        }

        self.tail.subscribe(&target, id, outbox).await?;

        // The hub is the only writer, so the client is still there.
        self.clients.get_mut(id)?.subscription = Some(target);
        Ok(())
    }

    fn unsubscribe(&mut self, id: SessionId) -> Result<()> {
        let client = self.clients.get_mut(id)?;
        let target = match client.subscription.take() {
            Some(target) => target,
            None => return Ok(()),
        };

        self.tail.unsubscribe(&target.path, id);
        client.outbox.push(Message::Detached {
            channel: target.channel,
        })
    }

    /// Drops the session if `res` says its outbox could not take a message.
    fn check_outbox(&mut self, id: SessionId, res: Result<()>) -> Result<()> {
        if matches!(res, Err(Error::Backpressure) | Err(Error::SessionClosed)) {
            self.drop_client(id);
        }
        res
    }

    /// Acts on the sessions a fan-out affected.
    fn settle(&mut self, out: FanOut) {
        for id in out.detached {
            if let Some(client) = self.clients.clients.get_mut(&id) {
                client.subscription = None;
            }
        }
        for id in out.dropped {
            tracing::warn!(session = id, "Dropping session that can't keep up");
            self.drop_client(id);
        }
    }

    fn drop_client(&mut self, id: SessionId) {
        if let Some(client) = self.clients.unregister(id) {
            client.outbox.close();
        }
        self.tail.detach(id);
    }

    fn close(&mut self) {
        self.shutdown.cancel();
        self.requests.close();
        for (_, client) in self.clients.clients.drain() {
            client.outbox.close();
        }
        self.tail.shutdown();
    }
}
