mod common;

use common::{append, connect, service};
use tailhub::{Config, Error, HubStats, Message, Service, SessionState};
use tempfile::tempdir;

#[tokio::test]
pub async fn test_replay_then_follow() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("app.log");
    append(&logfile, b"line1\nline2\n");

    let service = service(logdir.path(), |c| {
        c.lines = 10;
        c.bytes = 5000;
    })
    .await;

    let mut viewer = connect(&service, 64);
    viewer.subscribe("app.log");

    assert_eq!(
        viewer.next().await,
        Message::Attached {
            channel: "app.log".into()
        }
    );
    assert_eq!(viewer.lines(2).await, vec!["line1", "line2"]);
    viewer.wait_state(SessionState::Subscribed).await;

    append(&logfile, b"line3\n");
    assert_eq!(viewer.next_line().await, "line3");

    // A late viewer gets the whole history, in order.
    let mut late = connect(&service, 64);
    late.subscribe("app.log");
    assert!(matches!(late.next().await, Message::Attached { .. }));
    assert_eq!(late.lines(3).await, vec!["line1", "line2", "line3"]);

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_full_replay_fits_outbox() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("app.log");
    let content: String = (0..300).map(|i| format!("line {:03}\n", i)).collect();
    append(&logfile, content.as_bytes());

    // A replay larger than the outbox could never be delivered.
    let res = Service::new(Config {
        root: logdir.path().to_path_buf(),
        lines: 300,
        ..Config::default()
    })
    .await;
    assert!(matches!(res, Err(Error::Config(_))));

    let service = service(logdir.path(), |c| {
        c.lines = 300;
        c.client_buffer_size = 301;
    })
    .await;

    let mut viewer = connect(&service, 1024);
    viewer.subscribe("app.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));

    let lines = viewer.lines(300).await;
    assert_eq!(lines.first().map(String::as_str), Some("line 000"));
    assert_eq!(lines.last().map(String::as_str), Some("line 299"));
    viewer.wait_state(SessionState::Subscribed).await;

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_forced_split() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("app.log");
    append(&logfile, b"");

    let service = service(logdir.path(), |c| c.max_line_size = 5).await;

    let mut viewer = connect(&service, 64);
    viewer.subscribe("app.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));

    append(&logfile, b"abcdefgh\n");
    assert_eq!(viewer.lines(2).await, vec!["abcde", "fgh"]);

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_replay_is_bounded() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("app.log");
    let content: String = (0..50).map(|i| format!("line {:02}\n", i)).collect();
    append(&logfile, content.as_bytes());

    // "line NN\n" is 8 bytes: the last 80 bytes hold 10 lines, of which
    // only the newest 4 are kept.
    let service = service(logdir.path(), |c| {
        c.bytes = 80;
        c.lines = 4;
    })
    .await;

    let mut viewer = connect(&service, 64);
    viewer.subscribe("app.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));
    assert_eq!(
        viewer.lines(4).await,
        vec!["line 46", "line 47", "line 48", "line 49"]
    );

    append(&logfile, b"line 50\n");
    assert_eq!(viewer.next_line().await, "line 50");

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_subscribers_see_same_order() {
    let logdir = tempdir().unwrap();
    let logfile = logdir.path().join("app.log");
    append(&logfile, b"");

    let service = service(logdir.path(), |_| {}).await;

    let mut first = connect(&service, 256);
    let mut second = connect(&service, 256);
    for viewer in [&first, &second] {
        viewer.subscribe("app.log");
    }
    assert!(matches!(first.next().await, Message::Attached { .. }));
    assert!(matches!(second.next().await, Message::Attached { .. }));

    let mut expected = Vec::new();
    for batch in 0..5 {
        let mut chunk = String::new();
        for i in 0..10 {
            let line = format!("batch {} line {}", batch, i);
            chunk.push_str(&line);
            chunk.push('\n');
            expected.push(line);
        }
        append(&logfile, chunk.as_bytes());
    }

    assert_eq!(first.lines(50).await, expected);
    assert_eq!(second.lines(50).await, expected);

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_resubscribe_and_unsubscribe() {
    let logdir = tempdir().unwrap();
    append(&logdir.path().join("a.log"), b"from a\n");
    append(&logdir.path().join("b.log"), b"from b\n");

    let service = service(logdir.path(), |_| {}).await;

    let mut viewer = connect(&service, 64);
    viewer.subscribe("a.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));
    assert_eq!(viewer.next_line().await, "from a");

    viewer.subscribe("b.log");
    assert_eq!(
        viewer.next().await,
        Message::Attached {
            channel: "b.log".into()
        }
    );
    assert_eq!(viewer.next_line().await, "from b");

    // Only b.log is watched now.
    append(&logdir.path().join("a.log"), b"ignored\n");
    append(&logdir.path().join("b.log"), b"more b\n");
    assert_eq!(viewer.next_line().await, "more b");

    let stats = service.hub().stats().await.unwrap();
    assert_eq!(stats.watches, 1);

    viewer.send(r#"{"type": "unsubscribe"}"#);
    assert_eq!(
        viewer.next().await,
        Message::Detached {
            channel: "b.log".into()
        }
    );
    viewer.wait_state(SessionState::Registered).await;
    assert_eq!(service.hub().stats().await.unwrap().watches, 0);

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_bad_requests_are_reported() {
    let logdir = tempdir().unwrap();
    append(&logdir.path().join("app.log"), b"line\n");

    let service = service(logdir.path(), |_| {}).await;

    let mut viewer = connect(&service, 64);

    viewer.send("not json");
    assert!(matches!(viewer.next().await, Message::Error { .. }));

    viewer.subscribe("../etc/passwd");
    match viewer.next().await {
        Message::Error { message } => assert!(message.contains("outside"), "{}", message),
        other => panic!("unexpected {:?}", other),
    }

    viewer.subscribe("missing.log");
    match viewer.next().await {
        Message::Error { message } => assert!(message.contains("not found"), "{}", message),
        other => panic!("unexpected {:?}", other),
    }

    // Still usable afterwards.
    viewer.subscribe("app.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));
    assert_eq!(viewer.next_line().await, "line");

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_list() {
    let logdir = tempdir().unwrap();
    std::fs::create_dir(logdir.path().join("nested")).unwrap();
    append(&logdir.path().join("b.log"), b"12345");
    append(&logdir.path().join("nested/a.log"), b"");

    let service = service(logdir.path(), |_| {}).await;

    let mut viewer = connect(&service, 64);
    viewer.send(r#"{"type": "list"}"#);

    match viewer.next().await {
        Message::Index { files } => {
            let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["b.log", "nested/a.log"]);
            assert_eq!(files[0].size, 5);
        }
        other => panic!("unexpected {:?}", other),
    }

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_hang_up_unregisters() {
    let logdir = tempdir().unwrap();
    append(&logdir.path().join("app.log"), b"line\n");

    let service = service(logdir.path(), |_| {}).await;

    let mut viewer = connect(&service, 64);
    viewer.subscribe("app.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));
    viewer.wait_state(SessionState::Subscribed).await;

    viewer.hang_up();
    viewer.wait_state(SessionState::Closed).await;
    assert!(viewer.task.await.unwrap().is_ok());

    assert_eq!(service.hub().stats().await.unwrap(), HubStats::default());

    service.shutdown().await;
}

#[tokio::test]
pub async fn test_shutdown_closes_sessions() {
    let logdir = tempdir().unwrap();
    append(&logdir.path().join("app.log"), b"line\n");

    let service = service(logdir.path(), |_| {}).await;
    let hub = service.hub().clone();

    let mut viewer = connect(&service, 64);
    viewer.subscribe("app.log");
    assert!(matches!(viewer.next().await, Message::Attached { .. }));

    service.shutdown().await;

    viewer.wait_state(SessionState::Closed).await;
    assert!(viewer.task.await.unwrap().is_ok());
    assert!(matches!(hub.stats().await, Err(tailhub::Error::ShuttingDown)));
}
