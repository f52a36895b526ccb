use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the backend. Older endpoints use `error`, newer
/// ones `message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn into_message(self) -> Option<String> {
        self.message.or(self.error)
    }
}

/// Inbound payload that could not be turned into a typed message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
    #[error("payload on {topic} is missing `{field}`")]
    MissingField { topic: String, field: &'static str },
    #[error("unknown run_status '{0}'")]
    UnknownStatus(String),
    #[error("raw image dropped: {0}")]
    UncorrelatedImage(String),
    #[error("message on unsubscribed topic {0}")]
    UnexpectedTopic(String),
}

impl ProtocolError {
    pub fn malformed(topic: &str, reason: impl ToString) -> Self {
        Self::Malformed {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
