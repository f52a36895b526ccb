use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lab_shared::{
    domain::{NewRun, RunId, RunPhase, RunRecord, StageList, DEFAULT_MAX_CYCLES},
    error::ProtocolError,
    protocol::{
        Advisory, AdvisoryKind, CameraReady, CameraTrigger, CaptureMeta, ImageMeta, InboundTopic,
        StageMessage, StartCommand, TopicMap,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelClient, ConnectionState, InboundMessage, PublishOptions},
    confirmation::{ConfirmationGate, PendingConfirmation},
    error::{CaptureError, DashboardError, GateError},
    imaging::{CaptureDevice, CaptureSession, CaptureSessions, ImageResult},
    lifecycle::{begin_run, reduce, request_stop, Effect, Outcome},
    persistence::{PersistenceGateway, StatusCheckpoint},
    projection::{list_items, CaptureRequest, ProgressView, RunListItem, ViewSnapshot},
    registry::{RunEntry, RunRegistry},
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub topics: TopicMap,
    pub stages: StageList,
    pub max_cycles: u32,
    pub dissolution_wait: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            topics: TopicMap::default(),
            stages: StageList::default(),
            max_cycles: DEFAULT_MAX_CYCLES,
            dissolution_wait: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// Change feed for list views and the diagnostic console.
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    RunUpdated(RunEntry),
    RunRemoved(RunId),
    ConfirmationRequested(PendingConfirmation),
    ConfirmationResolved { run_id: RunId, confirmed: bool },
    CaptureRequested { run_id: RunId, cycle: Option<u32> },
    CaptureFinished { run_id: RunId, sent: bool },
    ImageReceived { run_id: RunId, result: ImageResult },
    Diagnostic { level: DiagnosticLevel, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewIntent {
    OpenProgress(RunId),
}

/// Result of creating a run; the intent tells the caller which view to open
/// next and is consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRun {
    pub run_id: RunId,
    pub intent: ViewIntent,
}

#[derive(Default)]
struct SupervisorState {
    registry: RunRegistry,
    gate: ConfirmationGate,
    captures: CaptureSessions,
    view: Option<ProgressView>,
}

impl SupervisorState {
    fn refresh_view(&self, run_id: &RunId) {
        let Some(view) = self.view.as_ref().filter(|view| view.shows(run_id)) else {
            return;
        };
        if let Some(entry) = self.registry.get(run_id) {
            view.refresh(
                entry,
                self.gate.pending(run_id),
                self.capture_request(run_id),
            );
        }
    }

    fn capture_request(&self, run_id: &RunId) -> Option<CaptureRequest> {
        self.captures
            .cycle(run_id)
            .map(|cycle| CaptureRequest { cycle })
    }

    /// Tears down the open view. Its capture session is released silently;
    /// the pending confirmation stays for when the view reopens.
    fn close_view(&mut self) -> Option<(RunId, bool)> {
        let view = self.view.take()?;
        let run_id = view.run_id().clone();
        drop(view);
        let cancelled = self.captures.cancel(&run_id);
        Some((run_id, cancelled))
    }
}

struct Shared {
    state: Mutex<SupervisorState>,
    events: broadcast::Sender<DashboardEvent>,
    config: SupervisorConfig,
}

impl Shared {
    fn emit(&self, event: DashboardEvent) {
        let _ = self.events.send(event);
    }

    fn diagnostic(&self, level: DiagnosticLevel, message: impl Into<String>) {
        self.emit(DashboardEvent::Diagnostic {
            level,
            message: message.into(),
        });
    }
}

enum CheckpointCommand {
    Write(StatusCheckpoint),
    Flush(oneshot::Sender<()>),
}

/// Single writer so checkpoints for a run reach the backend in the order
/// they were produced.
async fn run_checkpoint_writer(
    shared: Arc<Shared>,
    gateway: Arc<dyn PersistenceGateway>,
    mut commands: mpsc::UnboundedReceiver<CheckpointCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            CheckpointCommand::Write(checkpoint) => {
                match gateway.update_status(&checkpoint).await {
                    Ok(ack) => {
                        if !shared.state.lock().await.registry.absorb_ack(&ack) {
                            debug!(run_id = %ack.run_id, "persistence: ack not absorbed");
                        }
                    }
                    Err(err) => {
                        warn!(
                            run_id = %checkpoint.run_id,
                            status = %checkpoint.status,
                            stage = checkpoint.stage,
                            error = %err,
                            "persistence: status checkpoint failed"
                        );
                        shared.diagnostic(
                            DiagnosticLevel::Warning,
                            format!("checkpoint for run {} failed: {err}", checkpoint.run_id),
                        );
                    }
                }
            }
            CheckpointCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("persistence: checkpoint writer stopped");
}

/// Drives runs from controller events and operator actions. All registry,
/// gate, capture and view state sits behind one lock.
pub struct RunSupervisor {
    channel: Arc<ChannelClient>,
    persistence: Arc<dyn PersistenceGateway>,
    shared: Arc<Shared>,
    checkpoints: mpsc::UnboundedSender<CheckpointCommand>,
}

impl RunSupervisor {
    pub fn new(
        channel: Arc<ChannelClient>,
        persistence: Arc<dyn PersistenceGateway>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            state: Mutex::new(SupervisorState::default()),
            events,
            config,
        });
        let (checkpoints, commands) = mpsc::unbounded_channel();
        tokio::spawn(run_checkpoint_writer(
            Arc::clone(&shared),
            Arc::clone(&persistence),
            commands,
        ));
        Arc::new(Self {
            channel,
            persistence,
            shared,
            checkpoints,
        })
    }

    pub fn channel(&self) -> &Arc<ChannelClient> {
        &self.channel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.shared.events.subscribe()
    }

    /// Event feed as a stream. Lagging consumers skip what they missed.
    pub fn event_stream(&self) -> impl Stream<Item = DashboardEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "lifecycle: event consumer lagged");
                None
            }
        })
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe_state()
    }

    /// Drains the channel's inbound stream, one message at a time.
    pub fn spawn_dispatch(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                supervisor.handle_inbound(message).await;
            }
            debug!("lifecycle: inbound stream ended");
        })
    }

    pub async fn handle_inbound(&self, message: InboundMessage) {
        match self.shared.config.topics.classify(&message.topic) {
            Some(InboundTopic::Stage) => self.on_stage(&message).await,
            Some(InboundTopic::ImageMeta) => self.on_image_meta(&message).await,
            Some(InboundTopic::ImageRaw) => self.on_image_raw(&message.payload).await,
            Some(InboundTopic::CameraTrigger) => self.on_camera_trigger(&message).await,
            None => {
                let err = ProtocolError::UnexpectedTopic(message.topic.clone());
                debug!(error = %err, "lifecycle: message dropped");
                self.shared.diagnostic(DiagnosticLevel::Info, err.to_string());
            }
        }
    }

    fn enqueue_checkpoint(&self, checkpoint: StatusCheckpoint) {
        if self
            .checkpoints
            .send(CheckpointCommand::Write(checkpoint))
            .is_err()
        {
            warn!("persistence: checkpoint writer is gone");
        }
    }

    /// Waits until every checkpoint enqueued so far has been attempted.
    pub async fn flush_checkpoints(&self) {
        let (done, wait) = oneshot::channel();
        if self.checkpoints.send(CheckpointCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn on_stage(&self, message: &InboundMessage) {
        let parsed = match StageMessage::parse(&message.topic, &message.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "lifecycle: dropping stage message");
                self.shared
                    .diagnostic(DiagnosticLevel::Warning, err.to_string());
                return;
            }
        };
        let now = Utc::now();
        let run_id = parsed.run_id.clone();
        let mut notices = Vec::new();

        let mut state = self.shared.state.lock().await;
        if state.registry.is_deleted(&run_id) {
            info!(
                run_id = %run_id,
                status = parsed.event.status(),
                "lifecycle: event for a deleted run dropped"
            );
            return;
        }
        let current = state.registry.current_or_new(&run_id, now);
        let reduction = reduce(&current, &parsed, &self.shared.config.stages, now);
        match reduction.outcome {
            Outcome::Ignored(reason) => {
                info!(
                    run_id = %run_id,
                    status = parsed.event.status(),
                    ?reason,
                    "lifecycle: event ignored"
                );
                return;
            }
            Outcome::Applied => info!(
                run_id = %run_id,
                phase = %reduction.entry.phase,
                stage = reduction.entry.stage,
                cycle = reduction.entry.cycle,
                "lifecycle: run advanced"
            ),
            Outcome::Reapplied => debug!(
                run_id = %run_id,
                status = parsed.event.status(),
                "lifecycle: duplicate or stale event absorbed"
            ),
            Outcome::Interaction => {}
        }

        let entry = reduction.entry.clone();
        state.registry.upsert(entry.clone());
        for effect in &reduction.effects {
            match effect {
                Effect::Checkpoint => self.enqueue_checkpoint(StatusCheckpoint::from_entry(&entry)),
                Effect::OpenConfirmation { prompt, cycle } => {
                    let pending = state.gate.request(run_id.clone(), prompt.clone(), *cycle, now);
                    notices.push(DashboardEvent::ConfirmationRequested(pending));
                }
                Effect::OpenCapture { cycle } => {
                    state.captures.open(run_id.clone(), *cycle, now);
                    notices.push(DashboardEvent::CaptureRequested {
                        run_id: run_id.clone(),
                        cycle: *cycle,
                    });
                }
                Effect::DiscardInteractions => {
                    state.gate.discard(&run_id);
                    state.captures.cancel(&run_id);
                }
            }
        }
        state.refresh_view(&run_id);
        drop(state);

        if reduction.changed_state() {
            self.shared.emit(DashboardEvent::RunUpdated(entry));
        }
        for notice in notices {
            self.shared.emit(notice);
        }
    }

    async fn on_image_meta(&self, message: &InboundMessage) {
        let meta = match ImageMeta::parse(&message.topic, &message.payload) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(error = %err, "imaging: dropping image metadata");
                self.shared
                    .diagnostic(DiagnosticLevel::Warning, err.to_string());
                return;
            }
        };
        let mut state = self.shared.state.lock().await;
        let Some(view) = state.view.as_mut() else {
            debug!("imaging: no progress view open; metadata dropped");
            return;
        };
        if let Some(test_id) = meta.test_id.as_ref().filter(|id| !view.shows(id)) {
            debug!(test_id = %test_id, "imaging: metadata for another run dropped");
            return;
        }
        view.images_mut().accept_meta(meta);
    }

    async fn on_image_raw(&self, payload: &[u8]) {
        let mut state = self.shared.state.lock().await;
        let Some(view) = state.view.as_mut() else {
            debug!(size = payload.len(), "imaging: no progress view open; image dropped");
            return;
        };
        let run_id = view.run_id().clone();
        match view.images_mut().accept_raw(payload) {
            Ok(result) => {
                state.refresh_view(&run_id);
                drop(state);
                self.shared
                    .emit(DashboardEvent::ImageReceived { run_id, result });
            }
            Err(err) => {
                drop(state);
                debug!(error = %err, "imaging: raw image dropped");
                self.shared.diagnostic(DiagnosticLevel::Info, err.to_string());
            }
        }
    }

    async fn on_camera_trigger(&self, message: &InboundMessage) {
        let trigger = match CameraTrigger::parse(&message.topic, &message.payload) {
            Ok(trigger) => trigger,
            Err(err) => {
                warn!(error = %err, "imaging: dropping camera trigger");
                self.shared
                    .diagnostic(DiagnosticLevel::Warning, err.to_string());
                return;
            }
        };
        let run_id = trigger.test_id;
        let mut state = self.shared.state.lock().await;
        if state.registry.is_deleted(&run_id) {
            info!(run_id = %run_id, "imaging: camera trigger for a deleted run ignored");
            return;
        }
        if state
            .registry
            .get(&run_id)
            .is_some_and(|entry| entry.phase.is_terminal())
        {
            info!(run_id = %run_id, "imaging: camera trigger for a finished run ignored");
            return;
        }
        state.captures.open(run_id.clone(), trigger.cycle, Utc::now());
        state.refresh_view(&run_id);
        drop(state);
        info!(run_id = %run_id, cycle = ?trigger.cycle, "imaging: camera capture requested");
        self.shared.emit(DashboardEvent::CaptureRequested {
            run_id,
            cycle: trigger.cycle,
        });
    }

    /// Sends the start command and moves the run to `Started`. A finished
    /// run can be started again.
    pub async fn start_run(&self, run_id: &RunId) -> Result<(), DashboardError> {
        let topics = &self.shared.config.topics;
        // Held across the publish so a fast controller reply is reduced
        // after the local transition.
        let mut state = self.shared.state.lock().await;
        if state.registry.is_deleted(run_id) {
            return Err(DashboardError::UnknownRun(run_id.clone()));
        }
        self.channel
            .publish_json(&topics.run_init, &StartCommand::new(run_id.clone(), Utc::now()))
            .await?;
        let now = Utc::now();
        let entry = begin_run(&state.registry.current_or_new(run_id, now), now);
        state.registry.upsert(entry.clone());
        state.gate.discard(run_id);
        state.captures.cancel(run_id);
        state.refresh_view(run_id);
        drop(state);

        info!(run_id = %run_id, "lifecycle: start command sent");
        self.enqueue_checkpoint(StatusCheckpoint::from_entry(&entry));
        self.shared.emit(DashboardEvent::RunUpdated(entry));
        Ok(())
    }

    /// Answers the pending prompt for a run exactly once. Declining moves the
    /// run to `StopRequested` until the controller confirms the stop.
    pub async fn resolve_confirmation(
        &self,
        run_id: &RunId,
        confirmed: bool,
    ) -> Result<(), DashboardError> {
        let pending = self.shared.state.lock().await.gate.take(run_id)?;
        let response = pending.response(confirmed, Utc::now());
        if let Err(err) = self
            .channel
            .publish_json(&self.shared.config.topics.run_confirm, &response)
            .await
        {
            warn!(run_id = %run_id, error = %err, "gate: answer not sent; prompt restored");
            let mut state = self.shared.state.lock().await;
            state.gate.restore(pending);
            state.refresh_view(run_id);
            return Err(GateError::from(err).into());
        }
        info!(run_id = %run_id, confirmed, "gate: confirmation answered");

        let mut state = self.shared.state.lock().await;
        let stopping = if confirmed {
            None
        } else {
            state
                .registry
                .get(run_id)
                .and_then(|current| request_stop(current, Utc::now()))
        };
        if let Some(entry) = &stopping {
            state.registry.upsert(entry.clone());
        }
        state.refresh_view(run_id);
        drop(state);

        self.shared.emit(DashboardEvent::ConfirmationResolved {
            run_id: run_id.clone(),
            confirmed,
        });
        if let Some(entry) = stopping {
            self.shared.emit(DashboardEvent::RunUpdated(entry));
        }
        Ok(())
    }

    /// Grabs a frame and sends metadata, raw bytes and the ready notice for
    /// the run's open capture session.
    pub async fn capture_frame(
        &self,
        run_id: &RunId,
        device: &dyn CaptureDevice,
    ) -> Result<(), DashboardError> {
        let mut session = self
            .shared
            .state
            .lock()
            .await
            .captures
            .take(run_id)
            .ok_or_else(|| CaptureError::NoSession(run_id.clone()))?;

        match self.transmit_capture(&mut session, device).await {
            Ok(size) => {
                session.release();
                info!(run_id = %run_id, size, "imaging: capture sent");
                self.shared.state.lock().await.refresh_view(run_id);
                self.shared.emit(DashboardEvent::CaptureFinished {
                    run_id: run_id.clone(),
                    sent: true,
                });
                Ok(())
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "imaging: capture failed");
                let mut state = self.shared.state.lock().await;
                state.captures.restore(session);
                state.refresh_view(run_id);
                Err(err.into())
            }
        }
    }

    async fn transmit_capture(
        &self,
        session: &mut CaptureSession,
        device: &dyn CaptureDevice,
    ) -> Result<usize, CaptureError> {
        if !session.has_handle() {
            let handle = device
                .acquire()
                .await
                .map_err(|err| CaptureError::Device(err.to_string()))?;
            session.attach(handle);
        }
        let frame = match session.handle_mut() {
            Some(handle) => handle
                .grab_frame()
                .await
                .map_err(|err| CaptureError::Device(err.to_string()))?,
            None => return Err(CaptureError::Device("capture handle missing".into())),
        };

        let topics = &self.shared.config.topics;
        let now = Utc::now();
        let size = frame.bytes.len();
        let meta = CaptureMeta {
            test_id: session.run_id.clone(),
            cycle: session.cycle,
            mime: frame.mime,
            size,
            timestamp: now,
        };
        self.channel.publish_json(&topics.camera_image, &meta).await?;
        self.channel
            .publish(&topics.camera_image_raw, frame.bytes, PublishOptions::default())
            .await?;
        let ready = CameraReady {
            test_id: session.run_id.clone(),
            cycle: session.cycle,
            timestamp: now,
        };
        self.channel.publish_json(&topics.camera_ready, &ready).await?;
        Ok(size)
    }

    /// Drops the capture session without sending anything.
    pub async fn cancel_capture(&self, run_id: &RunId) -> bool {
        let mut state = self.shared.state.lock().await;
        let cancelled = state.captures.cancel(run_id);
        state.refresh_view(run_id);
        drop(state);
        if cancelled {
            self.shared.emit(DashboardEvent::CaptureFinished {
                run_id: run_id.clone(),
                sent: false,
            });
        }
        cancelled
    }

    pub async fn publish_advisory(
        &self,
        kind: AdvisoryKind,
        run_id: Option<RunId>,
        details: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DashboardError> {
        let mut advisory = Advisory::new(run_id, Utc::now());
        advisory.details = details;
        let topic = self.shared.config.topics.advisory(kind);
        self.channel.publish_json(topic, &advisory).await?;
        info!(topic, "lifecycle: manual step advisory sent");
        Ok(())
    }

    pub async fn create_run(&self, run: NewRun) -> Result<CreatedRun, DashboardError> {
        let run_id = self.persistence.create_run(&run).await?;
        let now = Utc::now();
        let record = RunRecord {
            trial_id: run_id.clone(),
            trial_name: run.trial_name,
            trial_operator: run.trial_operator,
            sample_size: Some(run.sample_size),
            timestamp: Some(now.to_rfc3339()),
            status: Some(RunPhase::Idle.checkpoint_status().to_string()),
            stage: None,
            cycle: None,
            results: Vec::new(),
        };
        let entry = RunEntry {
            record: Some(record),
            ..RunEntry::new(run_id.clone(), now)
        };
        self.shared.state.lock().await.registry.upsert(entry.clone());
        self.shared.emit(DashboardEvent::RunUpdated(entry));
        Ok(CreatedRun {
            intent: ViewIntent::OpenProgress(run_id.clone()),
            run_id,
        })
    }

    /// Pulls the backend listing and merges it without regressing live runs.
    pub async fn refresh_runs(&self) -> Result<Vec<RunListItem>, DashboardError> {
        let records = match self.persistence.list_runs().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "persistence: run listing failed");
                self.shared.diagnostic(
                    DiagnosticLevel::Error,
                    format!("failed to load runs: {err}"),
                );
                return Err(err.into());
            }
        };
        let stages = &self.shared.config.stages;
        let mut state = self.shared.state.lock().await;
        let report = state.registry.reconcile(records, stages, Utc::now());
        debug!(
            added = report.added.len(),
            advanced = report.advanced.len(),
            kept_live = report.kept_live.len(),
            "persistence: runs reconciled"
        );
        if let Some(run_id) = state.view.as_ref().map(|view| view.run_id().clone()) {
            state.refresh_view(&run_id);
        }
        Ok(list_items(&state.registry, &state.gate, stages))
    }

    pub async fn list_runs(&self) -> Vec<RunListItem> {
        let state = self.shared.state.lock().await;
        list_items(&state.registry, &state.gate, &self.shared.config.stages)
    }

    pub async fn run(&self, run_id: &RunId) -> Option<RunEntry> {
        self.shared.state.lock().await.registry.get(run_id).cloned()
    }

    pub async fn pending_confirmations(&self) -> Vec<PendingConfirmation> {
        self.shared.state.lock().await.gate.all_pending()
    }

    /// Removes the run locally, then on the backend. Later controller events
    /// for the id are dropped. If the backend refuses, the id is released
    /// again and the next refresh brings the row back.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<(), DashboardError> {
        {
            let mut state = self.shared.state.lock().await;
            state.registry.remove(run_id);
            state.gate.discard(run_id);
            if state.view.as_ref().is_some_and(|view| view.shows(run_id)) {
                state.close_view();
            }
            state.captures.cancel(run_id);
        }
        self.shared.emit(DashboardEvent::RunRemoved(run_id.clone()));
        if let Err(err) = self.persistence.delete_run(run_id).await {
            warn!(run_id = %run_id, error = %err, "persistence: run delete failed");
            self.shared.state.lock().await.registry.undelete(run_id);
            self.shared.diagnostic(
                DiagnosticLevel::Error,
                format!("failed to delete run {run_id}: {err}"),
            );
            return Err(err.into());
        }
        info!(run_id = %run_id, "lifecycle: run deleted");
        Ok(())
    }

    /// Opens the progress view for a run, replacing any open view. Image
    /// results start empty for each opening.
    pub async fn open_view(
        &self,
        run_id: &RunId,
    ) -> Result<watch::Receiver<ViewSnapshot>, DashboardError> {
        let mut state = self.shared.state.lock().await;
        let entry = state
            .registry
            .get(run_id)
            .cloned()
            .ok_or_else(|| DashboardError::UnknownRun(run_id.clone()))?;
        if let Some((previous, _)) = state.close_view() {
            debug!(run_id = %previous, "projection: replacing progress view");
        }
        let (view, snapshot) = ProgressView::open(
            &entry,
            self.shared.config.stages.clone(),
            self.shared.config.max_cycles,
            state.gate.pending(run_id),
            state.capture_request(run_id),
        );
        state.view = Some(view);
        info!(run_id = %run_id, phase = %entry.phase, stage = entry.stage, "projection: progress view opened");
        Ok(snapshot)
    }

    pub async fn close_view(&self) {
        let closed = self.shared.state.lock().await.close_view();
        if let Some((run_id, cancelled_capture)) = closed {
            info!(run_id = %run_id, "projection: progress view closed");
            if cancelled_capture {
                self.shared.emit(DashboardEvent::CaptureFinished {
                    run_id,
                    sent: false,
                });
            }
        }
    }

    /// Starts the dissolution countdown on the open view. When it elapses the
    /// `wait_complete` advisory is published; closing the view cancels it
    /// silently.
    pub async fn start_dissolution_wait(&self) -> Result<DateTime<Utc>, DashboardError> {
        let wait = self.shared.config.dissolution_wait;
        let ends_at = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.shared.state.lock().await;
        let view = state.view.as_mut().ok_or(DashboardError::NoOpenView)?;
        let run_id = view.run_id().clone();
        let generation = view.timer_generation() + 1;

        let shared = Arc::clone(&self.shared);
        let channel = Arc::clone(&self.channel);
        let timer_run = run_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let fired = {
                let mut state = shared.state.lock().await;
                let fired = state
                    .view
                    .as_mut()
                    .is_some_and(|view| view.shows(&timer_run) && view.timer_elapsed(generation));
                if fired {
                    state.refresh_view(&timer_run);
                }
                fired
            };
            if !fired {
                return;
            }
            info!(run_id = %timer_run, "lifecycle: dissolution wait elapsed");
            let advisory = Advisory::new(Some(timer_run), Utc::now())
                .with_detail("elapsed_seconds", wait.as_secs());
            let topic = shared.config.topics.advisory(AdvisoryKind::WaitComplete);
            if let Err(err) = channel.publish_json(topic, &advisory).await {
                warn!(error = %err, "lifecycle: wait_complete advisory not sent");
                shared.diagnostic(DiagnosticLevel::Warning, err.to_string());
            }
        });
        view.arm_timer(ends_at, task);
        state.refresh_view(&run_id);
        info!(run_id = %run_id, wait_secs = wait.as_secs(), "lifecycle: dissolution wait started");
        Ok(ends_at)
    }

    /// Ends the countdown early and tells the controller. Returns false when
    /// no countdown was running.
    pub async fn skip_dissolution_wait(&self) -> Result<bool, DashboardError> {
        let run_id = {
            let mut state = self.shared.state.lock().await;
            let view = state.view.as_mut().ok_or(DashboardError::NoOpenView)?;
            if !view.skip_timer() {
                return Ok(false);
            }
            let run_id = view.run_id().clone();
            state.refresh_view(&run_id);
            run_id
        };
        let mut details = serde_json::Map::new();
        details.insert("skipped".into(), true.into());
        self.publish_advisory(AdvisoryKind::WaitComplete, Some(run_id), details)
            .await?;
        Ok(true)
    }

    /// Closes the view and the broker link. The client identity is kept so
    /// the next start resumes the same broker session.
    pub async fn shutdown(&self) {
        self.close_view().await;
        self.flush_checkpoints().await;
        self.channel.close().await;
    }

    /// Like `shutdown`, but also forgets the client identity.
    pub async fn end_session(&self) {
        self.close_view().await;
        self.flush_checkpoints().await;
        self.channel.disconnect().await;
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
