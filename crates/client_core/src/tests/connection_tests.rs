use super::*;
use crate::test_support::{
    eventually, fast_options, wait_for_state, FakeConnector, OpenBehavior, WAIT,
};
use tokio::sync::Notify;

fn manager(connector: Arc<FakeConnector>) -> Arc<ConnectionManager> {
    ConnectionManager::new(connector, fast_options())
}

#[tokio::test]
async fn connect_moves_through_connecting_to_connected() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));
    let mut transitions = manager.subscribe_state();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    manager.connect().await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Connecting);
    assert_eq!(transitions.recv().await.unwrap(), ConnectionState::Connected);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn connect_while_connected_is_a_no_op() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));

    manager.connect().await;
    manager.connect().await;

    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_closes_the_transport() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));
    manager.connect().await;
    let peer = connector.latest_peer().await;

    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(peer.is_closed());
    assert_eq!(
        manager.send(b"late".to_vec()).await,
        Err(TransportError::NotConnected)
    );
}

#[tokio::test]
async fn failed_connect_reports_error_then_reconnects() {
    let connector = FakeConnector::scripted([OpenBehavior::Fail("refused".into())]);
    let manager = manager(Arc::clone(&connector));
    let mut transitions = manager.subscribe_state();

    manager.connect().await;
    assert_eq!(
        manager.state(),
        ConnectionState::Error("failed to open transport: refused".into())
    );

    let mut state = manager.watch_state();
    wait_for_state(&mut state, ConnectionState::is_connected).await;

    let mut seen = Vec::new();
    while let Ok(next) = transitions.try_recv() {
        seen.push(next);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error("failed to open transport: refused".into()),
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(connector.opens(), 2);
}

#[tokio::test]
async fn unexpected_close_surfaces_as_error_and_reconnects() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));
    let mut transitions = manager.subscribe_state();
    manager.connect().await;

    connector.latest_peer().await.close("server restart").await;

    let mut errored = false;
    loop {
        let next = tokio::time::timeout(WAIT, transitions.recv())
            .await
            .expect("transition")
            .unwrap();
        if next == ConnectionState::Error("server restart".into()) {
            errored = true;
        }
        if errored && next == ConnectionState::Connected {
            break;
        }
    }
    assert_eq!(connector.peer_count().await, 2);
}

#[tokio::test]
async fn inbound_frames_are_broadcast_to_every_subscriber() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));
    let mut first = manager.subscribe_inbound();
    let mut second = manager.subscribe_inbound();
    manager.connect().await;

    connector.latest_peer().await.push_frame(b"hello".to_vec()).await;

    assert_eq!(first.recv().await.unwrap(), b"hello".to_vec());
    assert_eq!(second.recv().await.unwrap(), b"hello".to_vec());
}

#[tokio::test]
async fn failed_send_marks_connection_stale() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));
    manager.connect().await;
    let peer = connector.latest_peer().await;
    peer.fail_sends(true);

    let result = manager.send(b"frame".to_vec()).await;

    assert!(matches!(result, Err(TransportError::Send(_))));
    assert!(peer.is_closed());
    let mut state = manager.watch_state();
    wait_for_state(&mut state, ConnectionState::is_connected).await;
    assert_eq!(connector.peer_count().await, 2);
}

#[tokio::test]
async fn send_timeout_is_reported_and_triggers_reconnect() {
    let connector = FakeConnector::new();
    let manager = manager(Arc::clone(&connector));
    manager.connect().await;
    connector.latest_peer().await.stall_sends(true);

    let result = manager.send(b"frame".to_vec()).await;

    assert_eq!(result, Err(TransportError::Timeout));
    eventually(|| {
        let connector = Arc::clone(&connector);
        async move { connector.peer_count().await == 2 }
    })
    .await;
}

#[tokio::test]
async fn disconnect_while_connecting_cancels_reconnect() {
    let gate = Arc::new(Notify::new());
    let connector = FakeConnector::scripted([OpenBehavior::Gated(Arc::clone(&gate))]);
    let manager = manager(Arc::clone(&connector));

    let connecting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.connect().await }
    });
    let mut state = manager.watch_state();
    wait_for_state(&mut state, |s| *s == ConnectionState::Connecting).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    gate.notify_one();
    connecting.await.unwrap();

    tokio::time::sleep(fast_options().backoff.max_delay * 3).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.opens(), 1);
    let peer = connector.latest_peer().await;
    assert!(peer.is_closed());
}

#[tokio::test]
async fn disconnect_during_backoff_cancels_pending_reconnect() {
    let connector = FakeConnector::scripted([OpenBehavior::Fail("refused".into())]);
    let mut options = fast_options();
    options.backoff.base_delay = Duration::from_millis(200);
    let manager = ConnectionManager::new(Arc::clone(&connector) as Arc<dyn TransportConnector>, options);

    manager.connect().await;
    assert!(matches!(manager.state(), ConnectionState::Error(_)));
    manager.disconnect().await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let connector = FakeConnector::scripted([
        OpenBehavior::Fail("refused".into()),
        OpenBehavior::Fail("refused".into()),
        OpenBehavior::Fail("refused".into()),
    ]);
    let mut options = fast_options();
    options.backoff.max_attempts = Some(2);
    let manager = ConnectionManager::new(Arc::clone(&connector) as Arc<dyn TransportConnector>, options);

    manager.connect().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(connector.opens(), 3);
    assert!(matches!(manager.state(), ConnectionState::Error(_)));
}

#[tokio::test]
async fn connect_timeout_becomes_error_state() {
    let gate = Arc::new(Notify::new());
    let connector = FakeConnector::scripted([OpenBehavior::Gated(gate)]);
    let mut options = fast_options();
    options.connect_timeout = Duration::from_millis(50);
    options.backoff.max_attempts = Some(0);
    let manager = ConnectionManager::new(Arc::clone(&connector) as Arc<dyn TransportConnector>, options);

    manager.connect().await;

    assert_eq!(
        manager.state(),
        ConnectionState::Error("failed to open transport: connection timeout".into())
    );
}

#[test]
fn backoff_grows_exponentially_up_to_the_cap() {
    let policy = BackoffPolicy {
        base_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_delay: Duration::from_secs(30),
        jitter_ratio: 0.25,
        max_attempts: None,
    };

    assert_eq!(policy.delay_for(1, 0.0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2, 0.0), Duration::from_secs(2));
    assert_eq!(policy.delay_for(4, 0.0), Duration::from_secs(8));
    assert_eq!(policy.delay_for(10, 0.0), Duration::from_secs(30));
    assert_eq!(policy.delay_for(3, 1.0), Duration::from_secs(5));
    assert_eq!(policy.delay_for(10, 1.0), Duration::from_secs(30));
}
