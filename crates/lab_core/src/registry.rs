use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use lab_shared::domain::{RunId, RunPhase, RunRecord, StageList, PREPARATION_STAGE};
use tracing::debug;

use crate::persistence::CheckpointAck;

/// Ordering key for a run's progress: phase rank, then cycle, then stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProgressMark {
    pub rank: u8,
    pub cycle: u32,
    pub stage: u32,
}

impl ProgressMark {
    pub fn new(phase: RunPhase, cycle: u32, stage: u32) -> Self {
        Self {
            rank: phase.progress_rank(),
            cycle,
            stage,
        }
    }
}

/// Live state of one run as the dashboard knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub stage: u32,
    /// 0 until the first cycle starts.
    pub cycle: u32,
    pub preparation_complete: bool,
    pub last_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub record: Option<RunRecord>,
    /// Last checkpoint the backend acknowledged.
    pub persisted: Option<ProgressMark>,
}

impl RunEntry {
    pub fn new(run_id: RunId, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            phase: RunPhase::Idle,
            stage: PREPARATION_STAGE,
            cycle: 0,
            preparation_complete: false,
            last_message: None,
            updated_at: now,
            record: None,
            persisted: None,
        }
    }

    pub fn from_record(record: RunRecord, stages: &StageList, now: DateTime<Utc>) -> Self {
        let phase = record.phase();
        let recorded_stage = record.stage.unwrap_or(PREPARATION_STAGE);
        let stage = if phase == RunPhase::Completed {
            recorded_stage.max(stages.len())
        } else {
            recorded_stage
        };
        let cycle = record.cycle.unwrap_or(0);
        Self {
            run_id: record.trial_id.clone(),
            phase,
            stage,
            cycle,
            preparation_complete: stage > PREPARATION_STAGE || cycle > 1,
            last_message: None,
            updated_at: now,
            persisted: Some(ProgressMark::new(phase, cycle, stage)),
            record: Some(record),
        }
    }

    pub fn progress(&self) -> ProgressMark {
        ProgressMark::new(self.phase, self.cycle, self.stage)
    }

    /// Equality on what an operator can see, ignoring bookkeeping fields.
    pub fn same_visible_state(&self, other: &RunEntry) -> bool {
        self.phase == other.phase
            && self.stage == other.stage
            && self.cycle == other.cycle
            && self.preparation_complete == other.preparation_complete
    }

    pub fn display_name(&self) -> String {
        self.record
            .as_ref()
            .map(|record| record.trial_name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Run {}", self.run_id))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<RunId>,
    pub advanced: Vec<RunId>,
    pub kept_live: Vec<RunId>,
}

/// Every run known to this dashboard plus the in-flight set. Ids removed by
/// the operator stay tombstoned so late controller events and backend rows
/// cannot bring them back.
#[derive(Debug, Default)]
pub struct RunRegistry {
    entries: BTreeMap<RunId, RunEntry>,
    in_flight: BTreeSet<RunId>,
    deleted: BTreeSet<RunId>,
}

impl RunRegistry {
    pub fn get(&self, run_id: &RunId) -> Option<&RunEntry> {
        self.entries.get(run_id)
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.entries.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current entry, or a fresh idle one for a run first seen on the wire.
    pub fn current_or_new(&self, run_id: &RunId, now: DateTime<Utc>) -> RunEntry {
        self.entries
            .get(run_id)
            .cloned()
            .unwrap_or_else(|| RunEntry::new(run_id.clone(), now))
    }

    /// Callers check `is_deleted` first; upserting a tombstoned id does not
    /// lift the tombstone.
    pub fn upsert(&mut self, entry: RunEntry) {
        if entry.phase.is_in_flight() {
            self.in_flight.insert(entry.run_id.clone());
        } else {
            self.in_flight.remove(&entry.run_id);
        }
        self.entries.insert(entry.run_id.clone(), entry);
    }

    pub fn remove(&mut self, run_id: &RunId) -> Option<RunEntry> {
        self.in_flight.remove(run_id);
        self.deleted.insert(run_id.clone());
        self.entries.remove(run_id)
    }

    pub fn is_deleted(&self, run_id: &RunId) -> bool {
        self.deleted.contains(run_id)
    }

    /// Lifts the tombstone after a delete the backend refused, so the next
    /// listing shows the run again.
    pub fn undelete(&mut self, run_id: &RunId) {
        self.deleted.remove(run_id);
    }

    pub fn is_in_flight(&self, run_id: &RunId) -> bool {
        self.in_flight.contains(run_id)
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &RunId> {
        self.in_flight.iter()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RunEntry> {
        self.entries.values()
    }

    /// Merges a backend listing. Backend rows only ever move a run forward;
    /// live progress from the channel is never rolled back.
    pub fn reconcile(
        &mut self,
        records: Vec<RunRecord>,
        stages: &StageList,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for record in records {
            let run_id = record.trial_id.clone();
            if self.deleted.contains(&run_id) {
                continue;
            }
            let from_backend = RunEntry::from_record(record.clone(), stages, now);
            match self.entries.get_mut(&run_id) {
                None => {
                    report.added.push(run_id);
                    self.upsert(from_backend);
                }
                Some(existing) => {
                    existing.record = Some(record);
                    if from_backend.progress() > existing.progress()
                        && !self.in_flight.contains(&run_id)
                    {
                        let mut advanced = from_backend;
                        advanced.last_message = existing.last_message.take();
                        report.advanced.push(run_id);
                        self.upsert(advanced);
                    } else {
                        report.kept_live.push(run_id);
                    }
                }
            }
        }
        report
    }

    /// Records a backend acknowledgement. Returns false when the ack is
    /// older than what was already acknowledged or ahead of the live state.
    pub fn absorb_ack(&mut self, ack: &CheckpointAck) -> bool {
        let Some(entry) = self.entries.get_mut(&ack.run_id) else {
            return false;
        };
        let mark = ProgressMark::new(ack.phase, ack.cycle, ack.stage);
        let stale = entry.persisted.is_some_and(|persisted| mark < persisted);
        if stale || mark > entry.progress() {
            debug!(run_id = %ack.run_id, ?mark, "registry: discarding out-of-order checkpoint ack");
            return false;
        }
        entry.persisted = Some(mark);
        true
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
