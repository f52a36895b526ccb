use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    channel::{
        BrokerConnection, BrokerConnector, BrokerLink, ConnectRequest, DeliveryQos,
        InboundMessage, LinkEvent, PublishOptions,
    },
    error::ChannelError,
};

const REQUEST_CAPACITY: usize = 64;
const LINK_EVENT_CAPACITY: usize = 256;
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    WebSocket,
    SecureWebSocket,
}

/// Broker address resolved from a `mqtt://`, `mqtts://`, `ws://` or `wss://` url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub kind: TransportKind,
    /// Host name for TCP transports, the full url for websockets.
    pub address: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let invalid = |reason: &str| ChannelError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let (kind, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (TransportKind::Tcp, 1883),
            "mqtts" | "ssl" => (TransportKind::Tls, 8883),
            "ws" => (TransportKind::WebSocket, 80),
            "wss" => (TransportKind::SecureWebSocket, 443),
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let port = url.port().unwrap_or(default_port);
        let address = match kind {
            TransportKind::Tcp | TransportKind::Tls => host.to_string(),
            TransportKind::WebSocket | TransportKind::SecureWebSocket => raw.to_string(),
        };
        Ok(Self {
            kind,
            address,
            port,
        })
    }

    fn transport(&self) -> Transport {
        match self.kind {
            TransportKind::Tcp => Transport::Tcp,
            TransportKind::Tls => Transport::tls_with_default_config(),
            TransportKind::WebSocket => Transport::Ws,
            TransportKind::SecureWebSocket => Transport::wss_with_default_config(),
        }
    }
}

fn mqtt_options(request: &ConnectRequest) -> Result<MqttOptions, ChannelError> {
    let endpoint = BrokerEndpoint::parse(&request.url)?;
    let mut options = MqttOptions::new(
        request.client_id.clone(),
        endpoint.address.clone(),
        endpoint.port,
    );
    options.set_transport(endpoint.transport());
    options.set_keep_alive(request.keep_alive.max(MIN_KEEP_ALIVE));
    options.set_clean_session(true);
    if let Some(username) = &request.username {
        options.set_credentials(
            username.clone(),
            request.password.clone().unwrap_or_default(),
        );
    }
    Ok(options)
}

fn qos(level: DeliveryQos) -> QoS {
    match level {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
        DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
        DeliveryQos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

async fn subscribe_all(client: &AsyncClient, topics: &[String]) -> Result<(), ChannelError> {
    for topic in topics {
        client
            .subscribe(topic.clone(), QoS::AtMostOnce)
            .await
            .map_err(|err| ChannelError::Connect(format!("subscribe {topic}: {err}")))?;
        debug!(topic = %topic, "mqtt: subscribed");
    }
    Ok(())
}

/// Broker connector backed by `rumqttc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<BrokerConnection, ChannelError> {
        let options = mqtt_options(&request)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => continue,
                    Err(err) => return Err(ChannelError::Connect(err.to_string())),
                }
            }
        };
        let ack = tokio::time::timeout(request.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ChannelError::Connect(format!(
                    "no answer from broker within {}s",
                    request.connect_timeout.as_secs()
                ))
            })??;
        if ack.code != ConnectReturnCode::Success {
            return Err(ChannelError::Connect(format!(
                "broker refused session: {:?}",
                ack.code
            )));
        }
        subscribe_all(&client, &request.subscriptions).await?;
        info!(url = %request.url, topics = request.subscriptions.len(), "mqtt: session established");

        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            request.subscriptions,
            request.reconnect_period,
            events_tx,
            Arc::clone(&closing),
        ));

        Ok(BrokerConnection {
            link: Arc::new(MqttLink { client, closing }),
            events: events_rx,
        })
    }
}

struct MqttLink {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.client
            .publish(topic, qos(options.qos), options.retain, payload)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client.disconnect().await?;
        Ok(())
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    reconnect_period: Duration,
    events: mpsc::Sender<LinkEvent>,
    closing: Arc<AtomicBool>,
) {
    let mut online = true;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(LinkEvent::Message(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) if !online => {
                online = true;
                // Clean sessions lose their subscriptions on every reconnect.
                if let Err(err) = subscribe_all(&client, &subscriptions).await {
                    warn!(error = %err, "mqtt: resubscribe after reconnect failed");
                }
                if events.send(LinkEvent::Online).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                if online {
                    online = false;
                    if events.send(LinkEvent::Offline(err.to_string())).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(reconnect_period).await;
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                if events.send(LinkEvent::Reconnecting).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("mqtt: event loop stopped");
    let _ = events.send(LinkEvent::Closed).await;
}

#[cfg(test)]
#[path = "tests/mqtt_tests.rs"]
mod tests;
