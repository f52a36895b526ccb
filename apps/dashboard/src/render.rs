use std::fmt::Write as _;

use lab_core::{
    projection::{DissolutionState, RunListItem, ViewSnapshot},
    supervisor::{DashboardEvent, DiagnosticLevel},
};
use lab_shared::domain::{SolutionType, StepStatus};

fn step_marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Done => "[x]",
        StepStatus::Active => "[>]",
        StepStatus::Waiting => "[ ]",
        StepStatus::Failed => "[!]",
    }
}

pub fn render_run_list(items: &[RunListItem]) -> String {
    if items.is_empty() {
        return "no runs".to_string();
    }
    let active = items.iter().filter(|item| item.active).count();
    let mut out = format!("{} runs, {active} active\n", items.len());
    for item in items {
        let mut markers = Vec::new();
        if item.active {
            markers.push("live");
        }
        if item.awaiting_confirmation {
            markers.push("awaiting confirmation");
        }
        if !item.in_sync {
            markers.push("unsaved");
        }
        let _ = writeln!(
            out,
            "{:>6}  {:<24} {:<12} {:<15} {:>3}%  {}",
            item.run_id.to_string(),
            item.name,
            item.operator,
            item.phase.to_string(),
            item.progress_percent,
            markers.join(", "),
        );
    }
    out
}

pub fn render_snapshot(snapshot: &ViewSnapshot) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} ({})", snapshot.title, snapshot.phase);
    if let Some(operator) = &snapshot.operator {
        let _ = write!(out, " by {operator}");
    }
    out.push('\n');

    let cycle = if snapshot.cycle == 0 {
        "preparing".to_string()
    } else {
        format!("cycle {}/{}", snapshot.cycle, snapshot.max_cycles)
    };
    let _ = writeln!(
        out,
        "{cycle}, stage {} {}, {}%",
        snapshot.stage,
        snapshot.stage_name.as_deref().unwrap_or("-"),
        snapshot.progress_percent
    );
    for step in &snapshot.steps {
        let _ = writeln!(out, "  {} {}", step_marker(step.status), step.name);
    }

    if let Some(message) = &snapshot.last_message {
        let _ = writeln!(out, "controller: {message}");
    }
    match snapshot.dissolution {
        DissolutionState::Idle => {}
        DissolutionState::Waiting { ends_at } => {
            let _ = writeln!(out, "dissolution wait until {}", ends_at.format("%H:%M:%S"));
        }
        DissolutionState::Elapsed => out.push_str("dissolution wait complete\n"),
        DissolutionState::Skipped => out.push_str("dissolution wait skipped\n"),
    }
    if let Some(prompt) = &snapshot.confirmation {
        let _ = writeln!(out, "? {} [y/n]", prompt.prompt);
    }
    if let Some(capture) = snapshot.capture {
        match capture.cycle {
            Some(cycle) => {
                let _ = writeln!(out, "camera capture requested for cycle {cycle}");
            }
            None => out.push_str("camera capture requested\n"),
        }
    }

    if snapshot.summary.has_results {
        for tag in SolutionType::ALL {
            let count = snapshot
                .results
                .iter()
                .filter(|result| result.solution_type == tag)
                .count();
            if count > 0 {
                let average = match tag {
                    SolutionType::Al => snapshot.summary.aluminum,
                    SolutionType::Si => snapshot.summary.silicon,
                };
                let _ = writeln!(out, "{}: {count} images, avg {average:.2}", tag.label());
            }
        }
        let _ = writeln!(
            out,
            "dissolution index {:.2}, Si/Al {:.2}",
            snapshot.summary.dissolution_index, snapshot.summary.si_al_ratio
        );
    }
    out
}

/// One line for the diagnostic console, or nothing for events the view
/// already shows.
pub fn render_event(event: &DashboardEvent) -> Option<String> {
    match event {
        DashboardEvent::Diagnostic { level, message } => {
            let label = match level {
                DiagnosticLevel::Info => "info",
                DiagnosticLevel::Warning => "warn",
                DiagnosticLevel::Error => "error",
            };
            Some(format!("[{label}] {message}"))
        }
        DashboardEvent::CaptureFinished { run_id, sent } => Some(if *sent {
            format!("capture for run {run_id} sent")
        } else {
            format!("capture for run {run_id} cancelled")
        }),
        DashboardEvent::ImageReceived { result, .. } => Some(format!(
            "image received: {} ({})",
            result.solution_type.label(),
            result.image.mime
        )),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
