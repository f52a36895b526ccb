use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use lab_core::{
    ChannelClient, DashboardError, FileCaptureDevice, FileSessionStore, HttpPersistence,
    MemorySessionStore, MqttConnector, RunSupervisor, SessionStore,
};
use lab_shared::{
    domain::{NewRun, RunId},
    protocol::AdvisoryKind,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::{
    config::DashboardSettings,
    render::{render_event, render_run_list, render_snapshot},
};

/// Operator input while watching a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCommand {
    Confirm(bool),
    Capture,
    CancelCapture,
    StartWait,
    SkipWait,
    Quit,
}

pub fn parse_watch_command(line: &str) -> Option<WatchCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(WatchCommand::Confirm(true)),
        "n" | "no" => Some(WatchCommand::Confirm(false)),
        "c" | "capture" => Some(WatchCommand::Capture),
        "x" | "cancel" => Some(WatchCommand::CancelCapture),
        "w" | "wait" => Some(WatchCommand::StartWait),
        "s" | "skip" => Some(WatchCommand::SkipWait),
        "q" | "quit" => Some(WatchCommand::Quit),
        _ => None,
    }
}

pub struct Console {
    supervisor: Arc<RunSupervisor>,
    dispatch: JoinHandle<()>,
}

impl Console {
    pub fn new(settings: &DashboardSettings) -> Result<Self> {
        let persistence = HttpPersistence::new(&settings.api_base_url)?;
        let sessions: Arc<dyn SessionStore> = match &settings.session_file {
            Some(path) => {
                let store = FileSessionStore::new(path);
                info!(path = %store.path().display(), "console: broker identity kept on disk");
                Arc::new(store)
            }
            None => Arc::new(MemorySessionStore::default()),
        };
        let (channel, inbound) =
            ChannelClient::new(Arc::new(MqttConnector), settings.broker_settings(), sessions);
        let supervisor = RunSupervisor::new(channel, Arc::new(persistence), settings.supervisor_config());
        let dispatch = supervisor.spawn_dispatch(inbound);
        Ok(Self {
            supervisor,
            dispatch,
        })
    }

    async fn connect(&self) -> Result<()> {
        let channel = self.supervisor.channel();
        let session = channel
            .connect()
            .await
            .with_context(|| format!("failed to reach broker at {}", channel.broker_url()))?;
        info!(client_id = %session.client_id, url = %session.url, "dashboard: broker connected");
        Ok(())
    }

    pub async fn list_runs(&self) -> Result<()> {
        let items = self.supervisor.refresh_runs().await?;
        print!("{}", render_run_list(&items));
        Ok(())
    }

    pub async fn create_run(&self, run: NewRun) -> Result<RunId> {
        let created = self.supervisor.create_run(run).await?;
        println!("created run {}", created.run_id);
        Ok(created.run_id)
    }

    pub async fn start_run(&self, run_id: &RunId) -> Result<()> {
        self.connect().await?;
        self.supervisor.refresh_runs().await?;
        self.supervisor.start_run(run_id).await?;
        println!("start sent for run {run_id}");
        Ok(())
    }

    pub async fn delete_run(&self, run_id: &RunId, confirmed: bool) -> Result<()> {
        if !confirmed {
            bail!("deleting run {run_id} cannot be undone; pass --yes to confirm");
        }
        self.supervisor.refresh_runs().await?;
        self.supervisor.delete_run(run_id).await?;
        println!("deleted run {run_id}");
        Ok(())
    }

    pub async fn advise(&self, kind: AdvisoryKind, run_id: Option<RunId>) -> Result<()> {
        self.connect().await?;
        self.supervisor
            .publish_advisory(kind, run_id, serde_json::Map::new())
            .await?;
        println!("advisory sent");
        Ok(())
    }

    /// Follows one run until it finishes or the operator quits.
    pub async fn watch(&self, run_id: &RunId, capture_file: Option<PathBuf>) -> Result<()> {
        self.connect().await?;
        if let Err(err) = self.supervisor.refresh_runs().await {
            warn!(error = %err, "dashboard: backend listing unavailable; showing live state only");
        }
        let mut view = match self.supervisor.open_view(run_id).await {
            Ok(view) => view,
            Err(DashboardError::UnknownRun(_)) => bail!("run {run_id} is not known to the backend"),
            Err(err) => return Err(err.into()),
        };
        let device = capture_file.map(FileCaptureDevice::new);
        let events = self.supervisor.event_stream();
        tokio::pin!(events);
        let mut input = BufReader::new(tokio::io::stdin()).lines();

        print!("{}", render_snapshot(&view.borrow_and_update()));
        println!("commands: y/n answer, c capture, x cancel capture, w wait, s skip wait, q quit");
        loop {
            tokio::select! {
                changed = view.changed() => {
                    if changed.is_err() {
                        println!("view closed");
                        break;
                    }
                    let snapshot = view.borrow_and_update().clone();
                    print!("{}", render_snapshot(&snapshot));
                    if let (Some(_), Some(device)) = (snapshot.capture, device.as_ref()) {
                        if let Err(err) = self.supervisor.capture_frame(run_id, device).await {
                            warn!(run_id = %run_id, error = %err, "dashboard: automatic capture failed");
                        }
                    }
                    if snapshot.phase.is_terminal() && snapshot.confirmation.is_none() {
                        println!("run {run_id} finished: {}", snapshot.phase);
                        break;
                    }
                }
                Some(event) = events.next() => {
                    if let Some(line) = render_event(&event) {
                        println!("{line}");
                    }
                }
                line = input.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    match parse_watch_command(&line) {
                        Some(WatchCommand::Quit) => break,
                        Some(command) => self.apply(run_id, command, device.as_ref()).await,
                        None => println!("unknown command '{}'", line.trim()),
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        self.supervisor.close_view().await;
        Ok(())
    }

    async fn apply(&self, run_id: &RunId, command: WatchCommand, device: Option<&FileCaptureDevice>) {
        let result = match command {
            WatchCommand::Confirm(confirmed) => {
                self.supervisor.resolve_confirmation(run_id, confirmed).await
            }
            WatchCommand::Capture => match device {
                Some(device) => self.supervisor.capture_frame(run_id, device).await,
                None => {
                    println!("no --capture-file given");
                    Ok(())
                }
            },
            WatchCommand::CancelCapture => {
                self.supervisor.cancel_capture(run_id).await;
                Ok(())
            }
            WatchCommand::StartWait => self.supervisor.start_dissolution_wait().await.map(|_| ()),
            WatchCommand::SkipWait => self.supervisor.skip_dissolution_wait().await.map(|_| ()),
            WatchCommand::Quit => Ok(()),
        };
        if let Err(err) = result {
            println!("error: {err}");
        }
    }

    /// Closes the broker link; a file-backed identity survives for the next
    /// command.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
        self.dispatch.abort();
    }

    /// Closes the broker link and forgets the identity.
    pub async fn end_session(self) {
        self.supervisor.end_session().await;
        self.dispatch.abort();
    }
}

#[cfg(test)]
#[path = "tests/console_tests.rs"]
mod tests;
