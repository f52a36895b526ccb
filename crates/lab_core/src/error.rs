use lab_shared::domain::RunId;
use thiserror::Error;

/// Transport-level failures. Cloneable so a shared in-flight connect can hand
/// the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("invalid broker url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("connection attempt was cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("backend response did not include a run id")]
    MissingRunId,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("no confirmation is pending for run {0}")]
    NothingPending(RunId),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no camera capture is open for run {0}")]
    NoSession(RunId),
    #[error("capture device failed: {0}")]
    Device(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Error returned by operator actions on the supervisor.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("run {0} is not known to the dashboard")]
    UnknownRun(RunId),
    #[error("no progress view is open")]
    NoOpenView,
}
