use super::*;

use std::{
    env, fs,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    session::{FileSessionStore, MemorySessionStore},
    test_support::MemoryBroker,
};

fn settings() -> BrokerSettings {
    BrokerSettings {
        url: "mqtt://broker.test:1883".into(),
        subscriptions: vec!["ur2/test/stage".into(), "ur2/test/image".into()],
        ..BrokerSettings::default()
    }
}

fn client_for(
    broker: &Arc<MemoryBroker>,
) -> (
    Arc<ChannelClient>,
    mpsc::Receiver<InboundMessage>,
    Arc<MemorySessionStore>,
) {
    let sessions = Arc::new(MemorySessionStore::default());
    let (client, inbound) = ChannelClient::new(broker.clone(), settings(), sessions.clone());
    (client, inbound, sessions)
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let broker = MemoryBroker::with_connect_delay(Duration::from_millis(50));
    let (client, _inbound, _) = client_for(&broker);

    let (first, second) = tokio::join!(client.connect(), client.connect());
    let first = first.expect("first connect");
    let second = second.expect("second connect");

    assert_eq!(broker.connect_count(), 1);
    assert_eq!(first, second);
    assert_eq!(client.state(), ConnectionState::Connected);

    let again = client.connect().await.expect("already connected");
    assert_eq!(again, first);
    assert_eq!(broker.connect_count(), 1);
}

#[tokio::test]
async fn connect_passes_subscriptions_and_reuses_identity() {
    let broker = MemoryBroker::new();
    let (client, _inbound, sessions) = client_for(&broker);

    let info = client.connect().await.expect("connect");
    assert!(info.client_id.starts_with("lab_dashboard_"));
    assert_eq!(sessions.load(), Some(info.client_id.clone()));

    let request = broker.requests().remove(0);
    assert_eq!(request.client_id, info.client_id);
    assert_eq!(request.keep_alive, Duration::from_secs(120));
    assert_eq!(
        request.subscriptions,
        vec!["ur2/test/stage".to_string(), "ur2/test/image".to_string()]
    );

    broker.emit(LinkEvent::Closed).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let reconnected = client.connect().await.expect("reconnect");
    assert_eq!(reconnected.client_id, info.client_id);
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn publish_fails_fast_when_not_connected() {
    let broker = MemoryBroker::new();
    let (client, _inbound, _) = client_for(&broker);

    let err = client
        .publish("ur2/test/init", b"{}".to_vec(), PublishOptions::default())
        .await
        .expect_err("must not queue");
    assert_eq!(err, ChannelError::NotConnected);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn publish_is_refused_while_offline() {
    let broker = MemoryBroker::new();
    let (client, _inbound, _) = client_for(&broker);
    client.connect().await.expect("connect");

    broker
        .emit(LinkEvent::Offline("keepalive timeout".into()))
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.state(), ConnectionState::Offline);

    let err = client
        .publish_json("ur2/test/confirm", &serde_json::json!({"confirmed": true}))
        .await
        .expect_err("offline");
    assert_eq!(err, ChannelError::NotConnected);

    broker.emit(LinkEvent::Online).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client
        .publish_json("ur2/test/confirm", &serde_json::json!({"confirmed": true}))
        .await
        .expect("online again");
    assert_eq!(broker.published_on("ur2/test/confirm").len(), 1);
}

#[tokio::test]
async fn publish_failure_reports_topic() {
    let broker = MemoryBroker::new();
    let (client, _inbound, _) = client_for(&broker);
    client.connect().await.expect("connect");
    broker.fail_publishes(true);

    let err = client
        .publish("ur2/test/init", b"{}".to_vec(), PublishOptions::default())
        .await
        .expect_err("broker rejects");
    assert!(matches!(err, ChannelError::Publish { ref topic, .. } if topic == "ur2/test/init"));
}

#[tokio::test]
async fn inbound_messages_arrive_in_order_on_single_stream() {
    let broker = MemoryBroker::new();
    let (client, mut inbound, _) = client_for(&broker);
    client.connect().await.expect("connect");

    for stage in 1..=3 {
        broker
            .deliver("ur2/test/stage", format!("{{\"run_stage\":{stage}}}"))
            .await;
    }

    for stage in 1..=3 {
        let message = inbound.recv().await.expect("message");
        assert_eq!(message.topic, "ur2/test/stage");
        assert_eq!(message.payload, format!("{{\"run_stage\":{stage}}}").into_bytes());
    }
}

#[tokio::test]
async fn disconnect_closes_link_and_forgets_identity() {
    let broker = MemoryBroker::new();
    let (client, _inbound, sessions) = client_for(&broker);
    let first = client.connect().await.expect("connect");
    let mut state = client.subscribe_state();

    client.disconnect().await;
    assert_eq!(broker.closed_links(), 1);
    assert_eq!(sessions.load(), None);
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);

    let second = client.connect().await.expect("new session");
    assert_ne!(first.client_id, second.client_id);
    assert!(second.generation > first.generation);
}

#[tokio::test]
async fn close_keeps_the_file_identity_for_the_next_start() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("lab_dashboard_channel_identity_{suffix}"));
    let broker = MemoryBroker::new();
    let sessions = Arc::new(FileSessionStore::new(&path));

    let (client, _inbound) = ChannelClient::new(broker.clone(), settings(), sessions.clone());
    let first = client.connect().await.expect("connect");
    client.close().await;
    assert_eq!(broker.closed_links(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(sessions.load(), Some(first.client_id.clone()));

    // A fresh client over the same file stands in for a restarted CLI.
    let (restarted, _inbound) = ChannelClient::new(broker.clone(), settings(), sessions.clone());
    let resumed = restarted.connect().await.expect("reconnect");
    assert_eq!(resumed.client_id, first.client_id);

    restarted.disconnect().await;
    assert!(!path.exists());
    assert_eq!(sessions.load(), None);
}

#[tokio::test]
async fn disconnect_during_connect_cancels_the_attempt() {
    let broker = MemoryBroker::with_connect_delay(Duration::from_millis(50));
    let (client, _inbound, _) = client_for(&broker);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.disconnect().await;

    let outcome = pending.await.expect("join");
    assert_eq!(outcome, Err(ChannelError::Cancelled));
    assert_eq!(broker.closed_links(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn refused_connect_leaves_client_disconnected() {
    let broker = MemoryBroker::new();
    broker.refuse_next_connect("not authorized");
    let (client, _inbound, _) = client_for(&broker);

    let err = client.connect().await.expect_err("refused");
    assert_eq!(err, ChannelError::Connect("not authorized".into()));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await.expect("second attempt succeeds");
    assert_eq!(broker.connect_count(), 2);
}
