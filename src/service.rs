use std::fmt;
use std::sync::Arc;

use futures_util::sink::Sink;
use futures_util::stream::Stream;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;
use crate::hub::{Hub, HubHandle};
use crate::lister::{DirectoryLister, FileEntry};
use crate::message::Message;
use crate::session::Session;

/// A running tail service: the hub task plus what sessions need to reach
/// it.
pub struct Service {
    config: Arc<Config>,
    hub: HubHandle,
    lister: Arc<DirectoryLister>,
    task: JoinHandle<()>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .finish()
    }
}

impl Service {
    /// Validates `config` and starts the hub. Must be called from within a
    /// tokio runtime.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let lister = DirectoryLister::open(&config.root, config.list_cache_ttl()).await?;
        let (hub, task) = Hub::spawn(&config)?;
        tracing::info!(root = %lister.root().display(), poll = config.poll, "Tail service started");

        Ok(Service {
            config: Arc::new(config),
            hub,
            lister: Arc::new(lister),
            task,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Creates a session for a newly connected viewer.
    pub fn session(&self) -> Session {
        Session::new(
            self.hub.clone(),
            self.lister.clone(),
            self.config.client_buffer_size,
            self.config.trace,
        )
    }

    /// Serves one viewer over an established duplex channel until it goes
    /// away.
    pub async fn serve<I, O, E>(&self, inbound: I, outbound: O) -> Result<()>
    where
        I: Stream<Item = Result<String, E>>,
        O: Sink<Message>,
        O::Error: fmt::Display,
        E: fmt::Display,
    {
        self.session().run(inbound, outbound).await
    }

    pub async fn list(&self) -> Result<Vec<FileEntry>> {
        self.lister.list().await
    }

    /// Stops the hub and waits for it to release everything.
    pub async fn shutdown(self) {
        self.hub.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Hub task failed");
        }
    }
}
