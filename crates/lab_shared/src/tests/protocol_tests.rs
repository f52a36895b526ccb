use super::*;
use crate::domain::RunId;

const STAGE_TOPIC: &str = "ur2/test/stage";

#[test]
fn topics_are_built_from_prefix() {
    let topics = TopicMap::with_prefix("lab/");
    assert_eq!(topics.run_init, "lab/init");
    assert_eq!(topics.image_raw, "lab/image/raw");
    assert_eq!(topics.classify("lab/camera/trigger"), Some(InboundTopic::CameraTrigger));
    assert_eq!(topics.classify("lab/init"), None);
    assert_eq!(topics.inbound().len(), 4);
}

#[test]
fn parses_running_event_with_stage_and_cycle() {
    let message = StageMessage::parse(
        STAGE_TOPIC,
        br#"{"testId": 42, "run_status": "running", "run_stage": 3, "cycle": 1, "timestamp": "2024-01-01T00:00:00"}"#,
    )
    .expect("parse");
    assert_eq!(message.run_id, RunId::from(42));
    assert_eq!(
        message.event,
        StageEvent::Running {
            stage: Some(3),
            cycle: Some(1)
        }
    );
}

#[test]
fn accepts_legacy_stage_completed_shape() {
    let message = StageMessage::parse(
        STAGE_TOPIC,
        br#"{"testId": "abc", "status": "stage_completed", "stage": "2"}"#,
    )
    .expect("parse");
    assert_eq!(
        message.event,
        StageEvent::Running {
            stage: Some(2),
            cycle: None
        }
    );
}

#[test]
fn waiting_confirmation_keeps_prompt() {
    let message = StageMessage::parse(
        STAGE_TOPIC,
        br#"{"testId": 7, "run_status": "waiting_confirmation", "message": "Cycle 1/5 completed", "cycle": 1}"#,
    )
    .expect("parse");
    assert_eq!(
        message.event,
        StageEvent::WaitingConfirmation { cycle: Some(1) }
    );
    assert_eq!(message.message.as_deref(), Some("Cycle 1/5 completed"));
}

#[test]
fn rejects_unknown_status_and_missing_fields() {
    assert_eq!(
        StageMessage::parse(STAGE_TOPIC, br#"{"testId": 1, "run_status": "dancing"}"#),
        Err(ProtocolError::UnknownStatus("dancing".to_string()))
    );
    assert!(matches!(
        StageMessage::parse(STAGE_TOPIC, br#"{"run_status": "running"}"#),
        Err(ProtocolError::MissingField { field: "testId", .. })
    ));
    assert!(matches!(
        StageMessage::parse(STAGE_TOPIC, b"not json"),
        Err(ProtocolError::Malformed { .. })
    ));
}

#[test]
fn image_meta_reads_material_alias() {
    let meta = ImageMeta::parse(
        "ur2/test/image",
        br#"{"material": "silicon", "concentration": 0.8, "timestamp": "t"}"#,
    )
    .expect("meta");
    assert_eq!(meta.solution(), Some(SolutionType::Si));
    assert_eq!(meta.concentration, Some(0.8));
}

#[test]
fn start_command_carries_both_id_keys() {
    let timestamp = "2024-05-01T10:00:00Z".parse().expect("timestamp");
    let value = serde_json::to_value(StartCommand::new(RunId::from(9), timestamp)).expect("json");
    assert_eq!(value["command"], "start");
    assert_eq!(value["runId"], 9);
    assert_eq!(value["testId"], 9);
    assert_eq!(value["timestamp"], "2024-05-01T10:00:00Z");
}

#[test]
fn advisory_flattens_details() {
    let timestamp = "2024-05-01T10:00:00Z".parse().expect("timestamp");
    let advisory = Advisory::new(Some(RunId::from(3)), timestamp).with_detail("temperature_c", 90);
    let value = serde_json::to_value(&advisory).expect("json");
    assert_eq!(value["testId"], 3);
    assert_eq!(value["temperature_c"], 90);
}
