use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lab_shared::domain::{NewRun, RunId, RunRecord};
use tokio::sync::mpsc;

use crate::{
    channel::{
        BrokerConnection, BrokerConnector, BrokerLink, ConnectRequest, InboundMessage, LinkEvent,
        PublishOptions,
    },
    error::{BackendError, ChannelError},
    persistence::{CheckpointAck, PersistenceGateway, StatusCheckpoint},
};

/// In-process broker standing in for the controller side of the channel.
#[derive(Default)]
pub struct MemoryBroker {
    connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
    refuse_next: Mutex<Option<String>>,
    fail_publishes: Arc<AtomicBool>,
    link_events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    requests: Mutex<Vec<ConnectRequest>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    closed_links: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_connect_delay(delay: Duration) -> Arc<Self> {
        let broker = Self::default();
        *broker.connect_delay.lock().unwrap() = Some(delay);
        Arc::new(broker)
    }

    pub fn refuse_next_connect(&self, reason: &str) {
        *self.refuse_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closed_links(&self) -> usize {
        self.closed_links.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn published_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published_on(topic)
            .iter()
            .map(|payload| serde_json::from_slice(payload).expect("json payload"))
            .collect()
    }

    pub async fn emit(&self, event: LinkEvent) {
        let sender = self.link_events.lock().unwrap().clone();
        sender
            .expect("no live link")
            .send(event)
            .await
            .expect("link pump gone");
    }

    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.emit(LinkEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        }))
        .await;
    }

    pub async fn deliver_json(&self, topic: &str, value: serde_json::Value) {
        self.deliver(topic, serde_json::to_vec(&value).expect("encode"))
            .await;
    }
}

struct MemoryLink {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    closed_links: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _options: PublishOptions) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("broker rejected publish"));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed_links.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, request: ConnectRequest) -> Result<BrokerConnection, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.refuse_next.lock().unwrap().take() {
            return Err(ChannelError::Connect(reason));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.link_events.lock().unwrap() = Some(tx);
        Ok(BrokerConnection {
            link: Arc::new(MemoryLink {
                published: Arc::clone(&self.published),
                closed_links: Arc::clone(&self.closed_links),
                fail: Arc::clone(&self.fail_publishes),
            }),
            events: rx,
        })
    }
}

/// Backend double recording every call.
#[derive(Default)]
pub struct RecordingGateway {
    pub records: Mutex<Vec<RunRecord>>,
    pub created: Mutex<Vec<NewRun>>,
    pub checkpoints: Mutex<Vec<StatusCheckpoint>>,
    pub deleted: Mutex<Vec<RunId>>,
    pub next_id: Mutex<i64>,
    pub fail_checkpoints: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        let gateway = Self::default();
        *gateway.next_id.lock().unwrap() = 100;
        Arc::new(gateway)
    }

    pub fn with_records(records: Vec<RunRecord>) -> Arc<Self> {
        let gateway = Self::new();
        *gateway.records.lock().unwrap() = records;
        gateway
    }

    pub fn checkpoints(&self) -> Vec<StatusCheckpoint> {
        self.checkpoints.lock().unwrap().clone()
    }

    pub fn checkpoints_for(&self, run_id: &RunId) -> Vec<StatusCheckpoint> {
        self.checkpoints()
            .into_iter()
            .filter(|checkpoint| &checkpoint.run_id == run_id)
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn create_run(&self, run: &NewRun) -> Result<RunId, BackendError> {
        self.created.lock().unwrap().push(run.clone());
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        Ok(RunId::from(*next))
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>, BackendError> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn update_status(
        &self,
        checkpoint: &StatusCheckpoint,
    ) -> Result<CheckpointAck, BackendError> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                message: "backend unavailable".into(),
            });
        }
        self.checkpoints.lock().unwrap().push(checkpoint.clone());
        Ok(CheckpointAck::echo(checkpoint))
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), BackendError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 500,
                message: "delete refused".into(),
            });
        }
        self.deleted.lock().unwrap().push(run_id.clone());
        self.records
            .lock()
            .unwrap()
            .retain(|record| &record.trial_id != run_id);
        Ok(())
    }
}

pub fn record(id: i64, name: &str, status: Option<&str>, stage: Option<u32>) -> RunRecord {
    RunRecord {
        trial_id: RunId::from(id),
        trial_name: name.to_string(),
        trial_operator: "tester".to_string(),
        sample_size: Some(1.5),
        timestamp: Some("2024-05-01T10:00:00Z".to_string()),
        status: status.map(str::to_string),
        stage,
        cycle: None,
        results: Vec::new(),
    }
}
