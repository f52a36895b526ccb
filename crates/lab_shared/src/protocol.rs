use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{RunId, SolutionType},
    error::ProtocolError,
};

pub const DEFAULT_TOPIC_PREFIX: &str = "ur2/test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    Stage,
    ImageMeta,
    ImageRaw,
    CameraTrigger,
}

/// Concrete topic names shared with the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMap {
    pub run_init: String,
    pub run_stage: String,
    pub run_confirm: String,
    pub image_meta: String,
    pub image_raw: String,
    pub camera_trigger: String,
    pub camera_image: String,
    pub camera_image_raw: String,
    pub camera_ready: String,
    pub heat_confirmed: String,
    pub stirring_confirmed: String,
    pub wait_complete: String,
}

impl TopicMap {
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        let topic = |suffix: &str| format!("{prefix}/{suffix}");
        Self {
            run_init: topic("init"),
            run_stage: topic("stage"),
            run_confirm: topic("confirm"),
            image_meta: topic("image"),
            image_raw: topic("image/raw"),
            camera_trigger: topic("camera/trigger"),
            camera_image: topic("camera/image"),
            camera_image_raw: topic("camera/image/raw"),
            camera_ready: topic("camera/ready"),
            heat_confirmed: topic("manual/heat_confirmed"),
            stirring_confirmed: topic("manual/stirring_confirmed"),
            wait_complete: topic("manual/wait_complete"),
        }
    }

    /// Topics the dashboard subscribes to on every (re)connect.
    pub fn inbound(&self) -> Vec<String> {
        vec![
            self.run_stage.clone(),
            self.image_meta.clone(),
            self.image_raw.clone(),
            self.camera_trigger.clone(),
        ]
    }

    pub fn classify(&self, topic: &str) -> Option<InboundTopic> {
        if topic == self.run_stage {
            Some(InboundTopic::Stage)
        } else if topic == self.image_meta {
            Some(InboundTopic::ImageMeta)
        } else if topic == self.image_raw {
            Some(InboundTopic::ImageRaw)
        } else if topic == self.camera_trigger {
            Some(InboundTopic::CameraTrigger)
        } else {
            None
        }
    }

    pub fn advisory(&self, kind: AdvisoryKind) -> &str {
        match kind {
            AdvisoryKind::HeatConfirmed => &self.heat_confirmed,
            AdvisoryKind::StirringConfirmed => &self.stirring_confirmed,
            AdvisoryKind::WaitComplete => &self.wait_complete,
        }
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_TOPIC_PREFIX)
    }
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawNumber {
        Int(u64),
        Float(f64),
        Text(String),
    }

    match Option::<RawNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawNumber::Int(value)) => u32::try_from(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(RawNumber::Float(value))
            if value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) =>
        {
            Ok(Some(value as u32))
        }
        Some(RawNumber::Float(value)) => Err(serde::de::Error::custom(format!(
            "expected a whole number, got {value}"
        ))),
        Some(RawNumber::Text(value)) if value.trim().is_empty() => Ok(None),
        Some(RawNumber::Text(value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct RawStageMessage {
    #[serde(default, rename = "testId")]
    test_id: Option<RunId>,
    #[serde(default, alias = "status")]
    run_status: Option<String>,
    #[serde(default, alias = "stage", deserialize_with = "lenient_u32")]
    run_stage: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    cycle: Option<u32>,
    #[serde(default)]
    message: Option<String>,
}

/// Controller status event, one variant per `run_status` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Started,
    AlreadyRunning,
    CycleStart { cycle: Option<u32> },
    Running { stage: Option<u32>, cycle: Option<u32> },
    Completed { stage: Option<u32>, cycle: Option<u32> },
    Failed { cycle: Option<u32> },
    Error,
    Stopped,
    WaitingConfirmation { cycle: Option<u32> },
    WaitingCameraPreview { cycle: Option<u32> },
    CameraCapture { cycle: Option<u32> },
}

impl StageEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Error | Self::Stopped
        )
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyRunning => "already_running",
            Self::CycleStart { .. } => "cycle_start",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::WaitingConfirmation { .. } => "waiting_confirmation",
            Self::WaitingCameraPreview { .. } => "waiting_camera_preview",
            Self::CameraCapture { .. } => "camera_capture",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMessage {
    pub run_id: RunId,
    pub event: StageEvent,
    pub message: Option<String>,
}

impl StageMessage {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawStageMessage =
            serde_json::from_slice(payload).map_err(|err| ProtocolError::malformed(topic, err))?;
        let run_id = raw.test_id.ok_or_else(|| ProtocolError::MissingField {
            topic: topic.to_string(),
            field: "testId",
        })?;
        let status = raw.run_status.ok_or_else(|| ProtocolError::MissingField {
            topic: topic.to_string(),
            field: "run_status",
        })?;
        let (stage, cycle) = (raw.run_stage, raw.cycle);
        let event = match status.trim().to_ascii_lowercase().as_str() {
            "started" => StageEvent::Started,
            "already_running" => StageEvent::AlreadyRunning,
            "cycle_start" => StageEvent::CycleStart { cycle },
            "running" | "stage_update" | "stage_completed" => StageEvent::Running { stage, cycle },
            "completed" => StageEvent::Completed { stage, cycle },
            "failed" => StageEvent::Failed { cycle },
            "error" => StageEvent::Error,
            "stopped" | "stopped_by_user" => StageEvent::Stopped,
            "waiting_confirmation" => StageEvent::WaitingConfirmation { cycle },
            "waiting_camera_preview" => StageEvent::WaitingCameraPreview { cycle },
            "camera_capture" => StageEvent::CameraCapture { cycle },
            _ => return Err(ProtocolError::UnknownStatus(status)),
        };
        Ok(Self {
            run_id,
            event,
            message: raw.message.filter(|message| !message.trim().is_empty()),
        })
    }
}

/// Metadata announcing the next raw image on the image topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    #[serde(default, alias = "material", skip_serializing_if = "Option::is_none")]
    pub solution_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concentration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rgb: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub cycle: Option<u32>,
    #[serde(default, rename = "testId", skip_serializing_if = "Option::is_none")]
    pub test_id: Option<RunId>,
}

impl ImageMeta {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|err| ProtocolError::malformed(topic, err))
    }

    pub fn solution(&self) -> Option<SolutionType> {
        self.solution_type.as_deref().and_then(SolutionType::from_tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CameraTrigger {
    #[serde(rename = "testId")]
    pub test_id: RunId,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub cycle: Option<u32>,
}

impl CameraTrigger {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|err| ProtocolError::malformed(topic, err))
    }
}

/// Start command. The run id is written under both keys the controller
/// revisions have read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartCommand {
    pub command: String,
    #[serde(rename = "runId")]
    pub run_id: RunId,
    #[serde(rename = "testId")]
    pub test_id: RunId,
    pub timestamp: DateTime<Utc>,
}

impl StartCommand {
    pub fn new(run_id: RunId, timestamp: DateTime<Utc>) -> Self {
        Self {
            command: "start".to_string(),
            test_id: run_id.clone(),
            run_id,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    #[serde(rename = "testId")]
    pub test_id: RunId,
    pub confirmed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMeta {
    #[serde(rename = "testId")]
    pub test_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    pub mime: String,
    pub size: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraReady {
    #[serde(rename = "testId")]
    pub test_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryKind {
    HeatConfirmed,
    StirringConfirmed,
    WaitComplete,
}

/// Fire-and-forget notice about a manual bench step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "testId", skip_serializing_if = "Option::is_none")]
    pub test_id: Option<RunId>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Advisory {
    pub fn new(test_id: Option<RunId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            test_id,
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
