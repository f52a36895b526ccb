use super::*;

#[test]
fn tcp_and_tls_urls_resolve_to_host_and_default_ports() {
    let plain = BrokerEndpoint::parse("mqtt://broker.lab:1884").expect("mqtt url");
    assert_eq!(plain.kind, TransportKind::Tcp);
    assert_eq!(plain.address, "broker.lab");
    assert_eq!(plain.port, 1884);

    let secure = BrokerEndpoint::parse("mqtts://abc.s1.eu.hivemq.cloud").expect("mqtts url");
    assert_eq!(secure.kind, TransportKind::Tls);
    assert_eq!(secure.address, "abc.s1.eu.hivemq.cloud");
    assert_eq!(secure.port, 8883);
}

#[test]
fn websocket_urls_keep_the_full_address() {
    let endpoint =
        BrokerEndpoint::parse("wss://abc.s1.eu.hivemq.cloud:8884/mqtt").expect("wss url");
    assert_eq!(endpoint.kind, TransportKind::SecureWebSocket);
    assert_eq!(endpoint.address, "wss://abc.s1.eu.hivemq.cloud:8884/mqtt");
    assert_eq!(endpoint.port, 8884);

    let plain = BrokerEndpoint::parse("ws://localhost/mqtt").expect("ws url");
    assert_eq!(plain.kind, TransportKind::WebSocket);
    assert_eq!(plain.port, 80);
}

#[test]
fn unsupported_or_hostless_urls_are_rejected() {
    assert!(matches!(
        BrokerEndpoint::parse("http://broker.lab"),
        Err(ChannelError::InvalidUrl { .. })
    ));
    assert!(matches!(
        BrokerEndpoint::parse("not a url"),
        Err(ChannelError::InvalidUrl { .. })
    ));
}

#[test]
fn options_carry_credentials_and_clamp_keep_alive() {
    let request = ConnectRequest {
        url: "mqtt://broker.lab".into(),
        client_id: "lab_dashboard_1".into(),
        username: Some("operator".into()),
        password: Some("secret".into()),
        keep_alive: Duration::from_secs(1),
        reconnect_period: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(30),
        subscriptions: Vec::new(),
    };
    let options = mqtt_options(&request).expect("options");
    assert_eq!(options.client_id(), "lab_dashboard_1");
    assert_eq!(options.keep_alive(), Duration::from_secs(5));
    assert_eq!(
        options.credentials(),
        Some(("operator".to_string(), "secret".to_string()))
    );
    assert!(options.clean_session());
}

#[tokio::test]
async fn unreachable_broker_fails_within_connect_timeout() {
    let request = ConnectRequest {
        url: "mqtt://127.0.0.1:1".into(),
        client_id: "lab_dashboard_unreachable".into(),
        username: None,
        password: None,
        keep_alive: Duration::from_secs(30),
        reconnect_period: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(2),
        subscriptions: vec!["ur2/test/stage".into()],
    };
    let outcome = MqttConnector.connect(request).await;
    assert!(matches!(outcome, Err(ChannelError::Connect(_))));
}
