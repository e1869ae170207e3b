//! A fake viewer driving a `Session` over in-memory channels.

#![allow(dead_code)]

use std::convert::Infallible;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use futures_util::{sink, stream};
use tailhub::{Config, Message, Service, SessionState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub async fn service(root: &Path, configure: impl FnOnce(&mut Config)) -> Service {
    let mut config = Config {
        root: root.to_path_buf(),
        poll: true,
        poll_interval: 20,
        ..Config::default()
    };
    configure(&mut config);

    Service::new(config).await.unwrap()
}

pub fn append(path: &Path, data: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    file.write_all(data).unwrap();
    file.sync_all().unwrap();
}

pub struct Viewer {
    pub commands: Option<mpsc::UnboundedSender<String>>,
    pub messages: mpsc::Receiver<Message>,
    pub state: watch::Receiver<SessionState>,
    pub task: JoinHandle<tailhub::Result<()>>,
}

/// Connects a viewer whose transport buffers up to `sink_capacity`
/// messages before writes start to wait.
pub fn connect(service: &Service, sink_capacity: usize) -> Viewer {
    let session = service.session();
    let state = session.state();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
    let inbound = stream::unfold(cmd_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });

    let (msg_tx, msg_rx) = mpsc::channel(sink_capacity);
    let outbound = sink::unfold(msg_tx, |tx, msg: Message| async move {
        tx.send(msg).await.map(|()| tx)
    });

    Viewer {
        commands: Some(cmd_tx),
        messages: msg_rx,
        state,
        task: tokio::spawn(session.run(inbound, outbound)),
    }
}

impl Viewer {
    pub fn send(&self, frame: &str) {
        self.commands
            .as_ref()
            .expect("viewer hung up")
            .send(frame.to_string())
            .unwrap();
    }

    pub fn subscribe(&self, path: &str) {
        self.send(&format!(r#"{{"type": "subscribe", "path": "{}"}}"#, path));
    }

    pub fn hang_up(&mut self) {
        self.commands = None;
    }

    pub async fn next(&mut self) -> Message {
        timeout(TIMEOUT, self.messages.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("session closed")
    }

    pub async fn next_line(&mut self) -> String {
        match self.next().await {
            Message::Line { data, .. } => String::from_utf8(data.to_vec()).unwrap(),
            other => panic!("expected a line, got {:?}", other),
        }
    }

    pub async fn lines(&mut self, count: usize) -> Vec<String> {
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(self.next_line().await);
        }
        lines
    }

    pub async fn wait_state(&mut self, want: SessionState) {
        let res = timeout(TIMEOUT, async {
            loop {
                let current = *self.state.borrow();
                if current == want {
                    return;
                }
                if self.state.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        assert!(res.is_ok(), "timed out waiting for {:?}", want);
        assert_eq!(*self.state.borrow(), want);
    }
}
