//! Pure run lifecycle reducer. The supervisor feeds it one controller event at
//! a time and applies the returned effects.

use chrono::{DateTime, Utc};
use lab_shared::{
    domain::{RunPhase, StageList, FIRST_CYCLE_STAGE, PREPARATION_STAGE},
    protocol::{StageEvent, StageMessage},
};

use crate::registry::RunEntry;

pub const DEFAULT_CONFIRMATION_PROMPT: &str = "Cycle finished. Continue with the next cycle?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The run already reached a different terminal phase.
    TerminalSticky(RunPhase),
    /// Operator declined; only the controller's terminal answer is accepted.
    AwaitingStop,
    /// Status carries no state change.
    Informational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Duplicate or out-of-order event; visible state is unchanged.
    Reapplied,
    /// Opens an operator interaction without moving the run.
    Interaction,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Checkpoint,
    OpenConfirmation {
        prompt: String,
        cycle: Option<u32>,
    },
    OpenCapture {
        cycle: Option<u32>,
    },
    /// Drop pending confirmation and capture state for the run.
    DiscardInteractions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub entry: RunEntry,
    pub outcome: Outcome,
    pub effects: Vec<Effect>,
}

impl Reduction {
    fn unchanged(current: &RunEntry, outcome: Outcome) -> Self {
        Self {
            entry: current.clone(),
            outcome,
            effects: Vec::new(),
        }
    }

    pub fn changed_state(&self) -> bool {
        self.outcome == Outcome::Applied
    }

    pub fn wants_checkpoint(&self) -> bool {
        self.effects.contains(&Effect::Checkpoint)
    }
}

fn terminal_phase(event: &StageEvent) -> Option<RunPhase> {
    match event {
        StageEvent::Completed { .. } => Some(RunPhase::Completed),
        StageEvent::Failed { .. } | StageEvent::Error => Some(RunPhase::Failed),
        StageEvent::Stopped => Some(RunPhase::Stopped),
        _ => None,
    }
}

pub fn reduce(
    current: &RunEntry,
    message: &StageMessage,
    stages: &StageList,
    now: DateTime<Utc>,
) -> Reduction {
    let event = &message.event;
    let terminal = terminal_phase(event);

    if current.phase.is_terminal() {
        return if terminal == Some(current.phase) {
            Reduction {
                entry: current.clone(),
                outcome: Outcome::Reapplied,
                effects: vec![Effect::Checkpoint],
            }
        } else {
            Reduction::unchanged(current, Outcome::Ignored(IgnoreReason::TerminalSticky(current.phase)))
        };
    }
    if current.phase == RunPhase::StopRequested && !event.is_terminal() {
        return Reduction::unchanged(current, Outcome::Ignored(IgnoreReason::AwaitingStop));
    }

    match event {
        StageEvent::WaitingConfirmation { cycle } => {
            let prompt = message
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_CONFIRMATION_PROMPT.to_string());
            return Reduction {
                entry: current.clone(),
                outcome: Outcome::Interaction,
                effects: vec![Effect::OpenConfirmation {
                    prompt,
                    cycle: *cycle,
                }],
            };
        }
        StageEvent::WaitingCameraPreview { cycle } | StageEvent::CameraCapture { cycle } => {
            return Reduction {
                entry: current.clone(),
                outcome: Outcome::Interaction,
                effects: vec![Effect::OpenCapture { cycle: *cycle }],
            };
        }
        StageEvent::AlreadyRunning => {
            return Reduction::unchanged(current, Outcome::Ignored(IgnoreReason::Informational));
        }
        _ => {}
    }

    let mut next = current.clone();
    let mut effects = vec![Effect::Checkpoint];
    match event {
        StageEvent::Started => {
            if current.phase == RunPhase::Idle {
                next.phase = RunPhase::Started;
                next.stage = PREPARATION_STAGE;
            }
        }
        StageEvent::CycleStart { cycle } => {
            let target = cycle.unwrap_or(current.cycle + 1);
            if target > current.cycle {
                next.phase = RunPhase::Running;
                next.cycle = target;
                next.stage = FIRST_CYCLE_STAGE;
                next.preparation_complete = true;
            }
        }
        StageEvent::Running { stage, cycle } => {
            let event_cycle = cycle.unwrap_or(current.cycle);
            if event_cycle > current.cycle {
                next.phase = RunPhase::Running;
                next.cycle = event_cycle;
                next.stage = stage.unwrap_or(FIRST_CYCLE_STAGE);
            } else if event_cycle == current.cycle {
                next.phase = RunPhase::Running;
                if let Some(stage) = stage.filter(|stage| *stage >= current.stage) {
                    next.stage = stage;
                }
            }
            if next.stage > PREPARATION_STAGE {
                next.preparation_complete = true;
            }
        }
        StageEvent::Completed { stage, cycle } => {
            next.phase = RunPhase::Completed;
            next.stage = current.stage.max(stage.unwrap_or(stages.len()));
            if let Some(cycle) = cycle {
                next.cycle = next.cycle.max(*cycle);
            }
            effects.push(Effect::DiscardInteractions);
        }
        StageEvent::Failed { cycle } => {
            next.phase = RunPhase::Failed;
            if let Some(cycle) = cycle {
                next.cycle = next.cycle.max(*cycle);
            }
            effects.push(Effect::DiscardInteractions);
        }
        StageEvent::Error => {
            next.phase = RunPhase::Failed;
            effects.push(Effect::DiscardInteractions);
        }
        StageEvent::Stopped => {
            next.phase = RunPhase::Stopped;
            effects.push(Effect::DiscardInteractions);
        }
        StageEvent::AlreadyRunning
        | StageEvent::WaitingConfirmation { .. }
        | StageEvent::WaitingCameraPreview { .. }
        | StageEvent::CameraCapture { .. } => {}
    }

    let outcome = if next.same_visible_state(current) {
        Outcome::Reapplied
    } else {
        Outcome::Applied
    };
    if outcome == Outcome::Applied {
        next.updated_at = now;
    }
    if message.message.is_some() {
        next.last_message = message.message.clone();
    }
    Reduction {
        entry: next,
        outcome,
        effects,
    }
}

/// Local transition after the start command went out. Clears any previous
/// terminal phase so a finished run can be rerun.
pub fn begin_run(current: &RunEntry, now: DateTime<Utc>) -> RunEntry {
    RunEntry {
        phase: RunPhase::Started,
        stage: PREPARATION_STAGE,
        cycle: 0,
        preparation_complete: false,
        last_message: None,
        updated_at: now,
        ..current.clone()
    }
}

/// Optimistic local stop after the operator declined to continue. Returns
/// `None` when the run already ended.
pub fn request_stop(current: &RunEntry, now: DateTime<Utc>) -> Option<RunEntry> {
    if current.phase.is_terminal() {
        return None;
    }
    Some(RunEntry {
        phase: RunPhase::StopRequested,
        updated_at: now,
        ..current.clone()
    })
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
