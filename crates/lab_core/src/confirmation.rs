use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lab_shared::{domain::RunId, protocol::ConfirmResponse};
use tracing::{debug, info};

use crate::error::GateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub run_id: RunId,
    pub prompt: String,
    pub cycle: Option<u32>,
    pub created_at: DateTime<Utc>,
    /// Distinguishes a replacement prompt from the one it replaced.
    pub instance: u64,
}

impl PendingConfirmation {
    pub fn response(&self, confirmed: bool, now: DateTime<Utc>) -> ConfirmResponse {
        ConfirmResponse {
            test_id: self.run_id.clone(),
            confirmed,
            timestamp: now,
        }
    }
}

/// At most one outstanding operator prompt per run. A new request replaces
/// the previous one instead of queueing behind it.
#[derive(Debug, Default)]
pub struct ConfirmationGate {
    pending: HashMap<RunId, PendingConfirmation>,
    issued: u64,
}

impl ConfirmationGate {
    pub fn request(
        &mut self,
        run_id: RunId,
        prompt: String,
        cycle: Option<u32>,
        now: DateTime<Utc>,
    ) -> PendingConfirmation {
        self.issued += 1;
        let pending = PendingConfirmation {
            run_id: run_id.clone(),
            prompt,
            cycle,
            created_at: now,
            instance: self.issued,
        };
        if let Some(replaced) = self.pending.insert(run_id.clone(), pending.clone()) {
            debug!(
                run_id = %run_id,
                replaced = replaced.instance,
                "gate: replacing pending confirmation"
            );
        }
        info!(run_id = %run_id, cycle = ?cycle, "gate: confirmation requested");
        pending
    }

    pub fn pending(&self, run_id: &RunId) -> Option<&PendingConfirmation> {
        self.pending.get(run_id)
    }

    pub fn all_pending(&self) -> Vec<PendingConfirmation> {
        let mut all: Vec<_> = self.pending.values().cloned().collect();
        all.sort_by_key(|pending| pending.instance);
        all
    }

    /// Removes the prompt so exactly one caller gets to answer it.
    pub fn take(&mut self, run_id: &RunId) -> Result<PendingConfirmation, GateError> {
        self.pending
            .remove(run_id)
            .ok_or_else(|| GateError::NothingPending(run_id.clone()))
    }

    /// Puts back a prompt whose answer could not be sent, unless a newer
    /// prompt arrived in the meantime.
    pub fn restore(&mut self, pending: PendingConfirmation) -> bool {
        if self.pending.contains_key(&pending.run_id) {
            return false;
        }
        self.pending.insert(pending.run_id.clone(), pending);
        true
    }

    pub fn discard(&mut self, run_id: &RunId) -> Option<PendingConfirmation> {
        let discarded = self.pending.remove(run_id);
        if discarded.is_some() {
            debug!(run_id = %run_id, "gate: discarded pending confirmation");
        }
        discarded
    }
}

#[cfg(test)]
#[path = "tests/confirmation_tests.rs"]
mod tests;
