use super::*;

#[test]
fn second_request_replaces_the_first() {
    let mut gate = ConfirmationGate::default();
    let run = RunId::from(7);
    let first = gate.request(run.clone(), "Continue after cycle 1?".into(), Some(1), Utc::now());
    let second = gate.request(run.clone(), "Continue after cycle 2?".into(), Some(2), Utc::now());

    assert_ne!(first.instance, second.instance);
    assert_eq!(gate.all_pending(), vec![second.clone()]);
    assert_eq!(gate.pending(&run), Some(&second));
}

#[test]
fn take_answers_exactly_once() {
    let mut gate = ConfirmationGate::default();
    let run = RunId::from(7);
    gate.request(run.clone(), "Continue?".into(), Some(1), Utc::now());

    let taken = gate.take(&run).expect("pending");
    assert!(matches!(gate.take(&run), Err(GateError::NothingPending(id)) if id == run));

    let response = taken.response(false, Utc::now());
    assert_eq!(response.test_id, run);
    assert!(!response.confirmed);
}

#[test]
fn restore_does_not_clobber_a_newer_prompt() {
    let mut gate = ConfirmationGate::default();
    let run = RunId::from(3);
    gate.request(run.clone(), "first".into(), None, Utc::now());
    let taken = gate.take(&run).expect("pending");

    let newer = gate.request(run.clone(), "second".into(), None, Utc::now());
    assert!(!gate.restore(taken.clone()));
    assert_eq!(gate.pending(&run), Some(&newer));

    gate.discard(&run);
    assert!(gate.restore(taken.clone()));
    assert_eq!(gate.pending(&run), Some(&taken));
}

#[test]
fn prompts_are_tracked_per_run() {
    let mut gate = ConfirmationGate::default();
    gate.request(RunId::from(1), "a".into(), None, Utc::now());
    gate.request(RunId::from(2), "b".into(), None, Utc::now());
    assert_eq!(gate.all_pending().len(), 2);
    assert!(gate.discard(&RunId::from(1)).is_some());
    assert!(gate.discard(&RunId::from(1)).is_none());
    assert_eq!(gate.all_pending()[0].run_id, RunId::from(2));
}
