use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::ChannelError,
    session::{load_or_mint_client_id, SessionStore},
};

const INBOUND_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryQos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: DeliveryQos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
    pub connect_timeout: Duration,
    pub subscriptions: Vec<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".into(),
            username: None,
            password: None,
            client_id_prefix: "lab_dashboard_".into(),
            keep_alive: Duration::from_secs(120),
            reconnect_period: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            subscriptions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub reconnect_period: Duration,
    pub connect_timeout: Duration,
    pub subscriptions: Vec<String>,
}

/// What a live transport reports after the initial handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(InboundMessage),
    Offline(String),
    Reconnecting,
    Online,
    Closed,
}

#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub struct BrokerConnection {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Resolves once the broker accepted the session and the requested
    /// subscriptions were issued.
    async fn connect(&self, request: ConnectRequest) -> Result<BrokerConnection, ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub url: String,
    pub client_id: String,
    pub generation: u64,
}

struct ActiveLink {
    info: SessionInfo,
    link: Arc<dyn BrokerLink>,
    pump: JoinHandle<()>,
}

type PendingConnect = Shared<BoxFuture<'static, Result<SessionInfo, ChannelError>>>;

enum LinkSlot {
    Empty,
    Connecting {
        generation: u64,
        attempt: PendingConnect,
    },
    Ready(ActiveLink),
}

/// Owner of the single broker connection. Inbound messages from every
/// (re)connection are funnelled, in arrival order, into the receiver handed
/// out by [`ChannelClient::new`].
pub struct ChannelClient {
    connector: Arc<dyn BrokerConnector>,
    settings: BrokerSettings,
    sessions: Arc<dyn SessionStore>,
    slot: Mutex<LinkSlot>,
    generation: AtomicU64,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl ChannelClient {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        settings: BrokerSettings,
        sessions: Arc<dyn SessionStore>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let client = Arc::new(Self {
            connector,
            settings,
            sessions,
            slot: Mutex::new(LinkSlot::Empty),
            generation: AtomicU64::new(0),
            state: Arc::new(state),
            inbound,
        });
        (client, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn broker_url(&self) -> &str {
        &self.settings.url
    }

    pub async fn connect(self: &Arc<Self>) -> Result<SessionInfo, ChannelError> {
        let attempt = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                LinkSlot::Ready(active) if self.state() != ConnectionState::Disconnected => {
                    return Ok(active.info.clone());
                }
                LinkSlot::Connecting { attempt, .. } => attempt.clone(),
                _ => {
                    if let LinkSlot::Ready(stale) = std::mem::replace(&mut *slot, LinkSlot::Empty) {
                        debug!(
                            generation = stale.info.generation,
                            "channel: dropping closed link before reconnect"
                        );
                        stale.pump.abort();
                    }
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let attempt = Arc::clone(self).establish(generation).boxed().shared();
                    *slot = LinkSlot::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Result<SessionInfo, ChannelError> {
        self.set_state(ConnectionState::Connecting);
        let client_id =
            load_or_mint_client_id(self.sessions.as_ref(), &self.settings.client_id_prefix);
        info!(
            url = %self.settings.url,
            client_id = %client_id,
            generation,
            "channel: connecting to broker"
        );
        let request = ConnectRequest {
            url: self.settings.url.clone(),
            client_id: client_id.clone(),
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            keep_alive: self.settings.keep_alive,
            reconnect_period: self.settings.reconnect_period,
            connect_timeout: self.settings.connect_timeout,
            subscriptions: self.settings.subscriptions.clone(),
        };

        let connection = match self.connector.connect(request).await {
            Ok(connection) => connection,
            Err(err) => {
                let mut slot = self.slot.lock().await;
                if slot_matches(&slot, generation) {
                    *slot = LinkSlot::Empty;
                    self.set_state(ConnectionState::Disconnected);
                }
                warn!(error = %err, generation, "channel: broker connection failed");
                return Err(err);
            }
        };

        let info = SessionInfo {
            url: self.settings.url.clone(),
            client_id,
            generation,
        };
        let mut slot = self.slot.lock().await;
        if !slot_matches(&slot, generation) {
            drop(slot);
            if let Err(err) = connection.link.close().await {
                debug!(error = %err, "channel: closing superseded link failed");
            }
            return Err(ChannelError::Cancelled);
        }
        let pump = tokio::spawn(pump_link_events(
            connection.events,
            self.inbound.clone(),
            Arc::clone(&self.state),
        ));
        *slot = LinkSlot::Ready(ActiveLink {
            info: info.clone(),
            link: connection.link,
            pump,
        });
        self.set_state(ConnectionState::Connected);
        info!(generation, "channel: connected and subscribed");
        Ok(info)
    }

    /// Fails fast with [`ChannelError::NotConnected`] instead of queueing.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        options: PublishOptions,
    ) -> Result<(), ChannelError> {
        let link = {
            let slot = self.slot.lock().await;
            match &*slot {
                LinkSlot::Ready(active) if self.is_connected() => Arc::clone(&active.link),
                _ => {
                    warn!(topic, "channel: cannot publish, not connected");
                    return Err(ChannelError::NotConnected);
                }
            }
        };
        link.publish(topic, payload.into(), options)
            .await
            .map_err(|err| ChannelError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        debug!(topic, "channel: published");
        Ok(())
    }

    pub async fn publish_json<T: serde::Serialize>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(message).map_err(|err| ChannelError::Publish {
            topic: topic.to_string(),
            reason: err.to_string(),
        })?;
        self.publish(topic, payload, PublishOptions::default()).await
    }

    /// Closes the transport. The client identity stays in the session store,
    /// so the next `connect` resumes with the same client id.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock().await, LinkSlot::Empty);
        if let LinkSlot::Ready(active) = previous {
            if let Err(err) = active.link.close().await {
                warn!(error = %err, "channel: broker close reported an error");
            }
            active.pump.abort();
        }
        self.set_state(ConnectionState::Disconnected);
        info!("channel: closed");
    }

    /// Ends the session: closes the transport and forgets the client identity
    /// so the next session mints a new one.
    pub async fn disconnect(&self) {
        self.close().await;
        if let Err(err) = self.sessions.clear() {
            warn!(error = %err, "channel: failed to clear client identity");
        }
        info!("channel: session ended");
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "channel: state changed");
        }
    }
}

fn slot_matches(slot: &LinkSlot, generation: u64) -> bool {
    matches!(slot, LinkSlot::Connecting { generation: current, .. } if *current == generation)
}

async fn pump_link_events(
    mut events: mpsc::Receiver<LinkEvent>,
    inbound: mpsc::Sender<InboundMessage>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Message(message) => {
                if inbound.send(message).await.is_err() {
                    debug!("channel: inbound consumer is gone; dropping message");
                }
            }
            LinkEvent::Offline(reason) => {
                warn!(%reason, "channel: broker connection offline");
                state.send_replace(ConnectionState::Offline);
            }
            LinkEvent::Reconnecting => {
                info!("channel: reconnecting to broker");
                state.send_replace(ConnectionState::Connecting);
            }
            LinkEvent::Online => {
                info!("channel: broker connection restored");
                state.send_replace(ConnectionState::Connected);
            }
            LinkEvent::Closed => break,
        }
    }
    info!("channel: broker connection closed");
    state.send_replace(ConnectionState::Disconnected);
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
