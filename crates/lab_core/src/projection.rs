use chrono::{DateTime, Utc};
use lab_shared::domain::{ConcentrationSummary, RunId, RunPhase, StageList, StepStatus};
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

use crate::{
    confirmation::{ConfirmationGate, PendingConfirmation},
    imaging::{ImageCorrelator, ImageResult},
    registry::{RunEntry, RunRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissolutionState {
    Idle,
    Waiting { ends_at: DateTime<Utc> },
    Elapsed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepView {
    pub index: u32,
    pub name: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub cycle: Option<u32>,
}

/// Everything the progress view renders for its run.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub run_id: RunId,
    pub title: String,
    pub operator: Option<String>,
    pub phase: RunPhase,
    pub stage: u32,
    pub stage_name: Option<String>,
    pub cycle: u32,
    pub max_cycles: u32,
    pub progress_percent: u8,
    pub steps: Vec<StepView>,
    pub interrupted: bool,
    pub confirmation: Option<PendingConfirmation>,
    pub capture: Option<CaptureRequest>,
    pub results: Vec<ImageResult>,
    pub summary: ConcentrationSummary,
    pub dissolution: DissolutionState,
    pub last_message: Option<String>,
}

fn project(
    entry: &RunEntry,
    stages: &StageList,
    max_cycles: u32,
    confirmation: Option<&PendingConfirmation>,
    capture: Option<CaptureRequest>,
    images: &ImageCorrelator,
    dissolution: DissolutionState,
) -> ViewSnapshot {
    let interrupted = matches!(
        entry.phase,
        RunPhase::Failed | RunPhase::Stopped | RunPhase::StopRequested
    );
    let steps = stages
        .step_statuses(entry.stage, interrupted)
        .into_iter()
        .zip(stages.names())
        .enumerate()
        .map(|(index, (status, name))| StepView {
            index: index as u32,
            name: name.clone(),
            status,
        })
        .collect();
    ViewSnapshot {
        run_id: entry.run_id.clone(),
        title: entry.display_name(),
        operator: entry
            .record
            .as_ref()
            .map(|record| record.trial_operator.clone())
            .filter(|operator| !operator.is_empty()),
        phase: entry.phase,
        stage: entry.stage,
        stage_name: stages.name(entry.stage).map(str::to_string),
        cycle: entry.cycle,
        max_cycles,
        progress_percent: stages.progress_percent(entry.stage),
        steps,
        interrupted,
        confirmation: confirmation.cloned(),
        capture,
        results: images.all_results().cloned().collect(),
        summary: images.summary(),
        dissolution,
        last_message: entry.last_message.clone(),
    }
}

/// Progress view bound to one run. Dropping it ends the snapshot stream and
/// aborts its dissolution countdown.
pub struct ProgressView {
    run_id: RunId,
    stages: StageList,
    max_cycles: u32,
    images: ImageCorrelator,
    dissolution: DissolutionState,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    snapshot: watch::Sender<ViewSnapshot>,
}

impl ProgressView {
    pub fn open(
        entry: &RunEntry,
        stages: StageList,
        max_cycles: u32,
        confirmation: Option<&PendingConfirmation>,
        capture: Option<CaptureRequest>,
    ) -> (Self, watch::Receiver<ViewSnapshot>) {
        let images = ImageCorrelator::default();
        let initial = project(
            entry,
            &stages,
            max_cycles,
            confirmation,
            capture,
            &images,
            DissolutionState::Idle,
        );
        let (snapshot, rx) = watch::channel(initial);
        debug!(run_id = %entry.run_id, "projection: progress view opened");
        let view = Self {
            run_id: entry.run_id.clone(),
            stages,
            max_cycles,
            images,
            dissolution: DissolutionState::Idle,
            timer: None,
            timer_generation: 0,
            snapshot,
        };
        (view, rx)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn shows(&self, run_id: &RunId) -> bool {
        &self.run_id == run_id
    }

    pub fn images(&self) -> &ImageCorrelator {
        &self.images
    }

    pub fn images_mut(&mut self) -> &mut ImageCorrelator {
        &mut self.images
    }

    pub fn dissolution(&self) -> DissolutionState {
        self.dissolution
    }

    pub fn refresh(
        &self,
        entry: &RunEntry,
        confirmation: Option<&PendingConfirmation>,
        capture: Option<CaptureRequest>,
    ) {
        if !self.shows(&entry.run_id) {
            return;
        }
        let next = project(
            entry,
            &self.stages,
            self.max_cycles,
            confirmation,
            capture,
            &self.images,
            self.dissolution,
        );
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Installs a countdown task, replacing any running one. The returned
    /// generation identifies it when it reports back.
    pub fn arm_timer(&mut self, ends_at: DateTime<Utc>, task: JoinHandle<()>) -> u64 {
        if let Some(previous) = self.timer.replace(task) {
            previous.abort();
        }
        self.timer_generation += 1;
        self.dissolution = DissolutionState::Waiting { ends_at };
        self.timer_generation
    }

    pub fn timer_generation(&self) -> u64 {
        self.timer_generation
    }

    pub fn timer_elapsed(&mut self, generation: u64) -> bool {
        if generation != self.timer_generation
            || !matches!(self.dissolution, DissolutionState::Waiting { .. })
        {
            return false;
        }
        self.timer = None;
        self.dissolution = DissolutionState::Elapsed;
        true
    }

    pub fn skip_timer(&mut self) -> bool {
        if !matches!(self.dissolution, DissolutionState::Waiting { .. }) {
            return false;
        }
        if let Some(task) = self.timer.take() {
            task.abort();
        }
        self.dissolution = DissolutionState::Skipped;
        true
    }
}

impl Drop for ProgressView {
    fn drop(&mut self) {
        if let Some(task) = self.timer.take() {
            task.abort();
        }
    }
}

/// Row of the run list.
#[derive(Debug, Clone, PartialEq)]
pub struct RunListItem {
    pub run_id: RunId,
    pub name: String,
    pub operator: String,
    pub created: Option<String>,
    pub phase: RunPhase,
    pub stage: u32,
    pub cycle: u32,
    pub progress_percent: u8,
    pub active: bool,
    pub awaiting_confirmation: bool,
    /// Backend has acknowledged the current progress.
    pub in_sync: bool,
}

pub fn list_items(
    registry: &RunRegistry,
    gate: &ConfirmationGate,
    stages: &StageList,
) -> Vec<RunListItem> {
    let mut items: Vec<RunListItem> = registry
        .entries()
        .map(|entry| RunListItem {
            run_id: entry.run_id.clone(),
            name: entry.display_name(),
            operator: entry
                .record
                .as_ref()
                .map(|record| record.trial_operator.clone())
                .unwrap_or_default(),
            created: entry
                .record
                .as_ref()
                .and_then(|record| record.timestamp.clone()),
            phase: entry.phase,
            stage: entry.stage,
            cycle: entry.cycle,
            progress_percent: stages.progress_percent(entry.stage),
            active: registry.is_in_flight(&entry.run_id),
            awaiting_confirmation: gate.pending(&entry.run_id).is_some(),
            in_sync: entry.persisted == Some(entry.progress()),
        })
        .collect();
    // Newest first; rows without a timestamp go last.
    items.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.run_id.cmp(&b.run_id)));
    items
}

#[cfg(test)]
#[path = "tests/projection_tests.rs"]
mod tests;
