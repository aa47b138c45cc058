use rt_daemon::config::DaemonConfig;
use rt_daemon::session::Session;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn mock_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.acquisition.poll_interval_ms = 10;
    config.buffer_size = Some(25);
    config
}

async fn wait_for_columns(session: &Arc<Session>, count: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if session.monitor().columns() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mock_session_streams_and_closes() {
    let config = mock_config();
    let session = tokio::task::spawn_blocking(move || Session::open(&config, true))
        .await
        .unwrap();
    let session = Arc::new(tokio_test::assert_ok!(session));

    let pipeline = session.pipeline().clone();
    assert!(pipeline.is_running());
    assert_eq!(pipeline.buffer_size(), Some(25));
    assert_eq!(session.mock_server().unwrap().buffer_size(), 25);

    assert!(wait_for_columns(&session, 100).await);
    let snapshot = session.monitor().snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.last_column.map(|c| c.len()), Some(4));

    let messages = session.drain_messages();
    assert!(
        messages.iter().any(|m| m.starts_with("Acquisition started")),
        "messages: {:?}",
        messages
    );

    let closing = session.clone();
    tokio_test::assert_ok!(tokio::task::spawn_blocking(move || closing.close()).await.unwrap());
    assert!(!pipeline.is_running());
    assert!(!session.monitor().snapshot().connected);
    // Second close is a no-op.
    tokio_test::assert_ok!(session.close());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mock_session_with_second_connector() {
    let mut config = mock_config();
    config.connector = Some(2);
    let session = tokio::task::spawn_blocking(move || Session::open(&config, true))
        .await
        .unwrap()
        .unwrap();
    let session = Arc::new(session);
    assert_eq!(session.pipeline().device_info().map(|i| i.num_channels), Some(6));
    assert!(wait_for_columns(&session, 50).await);
    assert_eq!(session.monitor().snapshot().last_column.map(|c| c.len()), Some(6));
    session.close().unwrap();
}

#[test]
fn test_open_fails_without_server() {
    let mut config = DaemonConfig::default();
    // Nothing listens on the discard port of loopback in the test environment.
    config.client.control_port = 9;
    config.client.data_port = 9;
    config.client.connect_timeout_ms = 200;
    let err = Session::open(&config, false).err().expect("open should fail");
    assert!(err.to_string().contains("Could not connect"), "{:#}", err);
}

#[test]
fn test_open_rejects_unknown_connector() {
    let mut config = mock_config();
    config.connector = Some(7);
    let err = Session::open(&config, true).err().expect("open should fail");
    assert!(err.to_string().contains("connector 7"), "{:#}", err);
}
