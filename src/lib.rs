//! Tails growing log files under a root directory and streams them to many
//! viewers at once.
//!
//! Each viewer gets a replay of the most recent lines of the file it
//! subscribes to, followed by new lines as they are appended. File changes
//! are picked up through filesystem notifications (driven by
//! [`notify`](https://crates.io/crates/notify)) or by polling.
//!
//! ## Example
//!
//! ```no_run
//! use std::convert::Infallible;
//!
//! use futures_util::sink::drain;
//! use futures_util::stream;
//! use tailhub::{Config, Service};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tailhub::Error> {
//!     let service = Service::new(Config {
//!         root: "/var/log/app".into(),
//!         ..Config::default()
//!     })
//!     .await?;
//!
//!     // Normally the frames come from a websocket or similar. The session
//!     // lasts until the inbound side ends.
//!     let (frames, rx) = mpsc::unbounded_channel::<String>();
//!     let inbound = stream::unfold(rx, |mut rx| async move {
//!         rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
//!     });
//!     let _ = frames.send(r#"{"type": "subscribe", "path": "app.log"}"#.to_string());
//!
//!     service.serve(inbound, drain()).await?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Backpressure
//!
//! Every session has a bounded outbound queue. A session that lets it fill
//! up is dropped rather than slowing down the other viewers or the watcher;
//! it has to reconnect and subscribe again.

mod config;
mod error;
mod events;
mod hub;
mod lister;
mod message;
mod reader;
mod service;
mod session;
mod splitter;
mod tail;

pub use config::Config;
pub use error::{Error, Result};
pub use events::WatchMode;
pub use hub::{HubHandle, HubStats, SessionId};
pub use lister::{Clock, DirectoryLister, FileEntry, SystemClock, Target};
pub use message::{Command, Message};
pub use service::Service;
pub use session::{Session, SessionState};
pub use splitter::{LineSplitter, SplitLines};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
