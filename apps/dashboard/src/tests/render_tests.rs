use super::*;

use chrono::Utc;
use lab_core::{
    confirmation::PendingConfirmation,
    projection::{CaptureRequest, ProgressView},
    registry::RunEntry,
};
use lab_shared::domain::{RunId, RunPhase, StageList};

fn snapshot(phase: RunPhase, stage: u32, cycle: u32) -> ViewSnapshot {
    let mut entry = RunEntry::new(RunId::from(42), Utc::now());
    entry.phase = phase;
    entry.stage = stage;
    entry.cycle = cycle;
    let (_view, rx) = ProgressView::open(&entry, StageList::default(), 5, None, None);
    let snapshot = rx.borrow().clone();
    snapshot
}

#[test]
fn snapshot_shows_cycle_and_stepper() {
    let text = render_snapshot(&snapshot(RunPhase::Running, 2, 1));
    assert!(text.starts_with("Run 42 (running)"));
    assert!(text.contains("cycle 1/5, stage 2"));
    assert!(text.contains("[x]"));
    assert!(text.contains("[>]"));
}

#[test]
fn preparation_has_no_cycle_number() {
    let text = render_snapshot(&snapshot(RunPhase::Started, 0, 0));
    assert!(text.contains("preparing, stage 0"));
}

#[test]
fn prompts_and_capture_requests_are_listed() {
    let mut shown = snapshot(RunPhase::Running, 4, 2);
    shown.confirmation = Some(PendingConfirmation {
        run_id: RunId::from(42),
        prompt: "Cycle 2 complete. Continue?".into(),
        cycle: Some(2),
        created_at: Utc::now(),
        instance: 1,
    });
    shown.capture = Some(CaptureRequest { cycle: Some(2) });
    let text = render_snapshot(&shown);
    assert!(text.contains("? Cycle 2 complete. Continue? [y/n]"));
    assert!(text.contains("camera capture requested for cycle 2"));
}

#[test]
fn run_list_counts_active_runs() {
    let items = vec![RunListItem {
        run_id: RunId::from(7),
        name: "Cement A".into(),
        operator: "lee".into(),
        created: None,
        phase: RunPhase::Running,
        stage: 3,
        cycle: 1,
        progress_percent: 43,
        active: true,
        awaiting_confirmation: true,
        in_sync: true,
    }];
    let text = render_run_list(&items);
    assert!(text.starts_with("1 runs, 1 active"));
    assert!(text.contains("live, awaiting confirmation"));
    assert_eq!(render_run_list(&[]), "no runs");
}

#[test]
fn diagnostics_render_with_level() {
    let line = render_event(&DashboardEvent::Diagnostic {
        level: DiagnosticLevel::Warning,
        message: "checkpoint failed".into(),
    });
    assert_eq!(line.as_deref(), Some("[warn] checkpoint failed"));
}
