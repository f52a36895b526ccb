//! Dashboard core: broker channel, run tracking, operator interactions and
//! the REST persistence gateway.

pub mod channel;
pub mod confirmation;
pub mod error;
pub mod imaging;
pub mod lifecycle;
pub mod mqtt;
pub mod persistence;
pub mod projection;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use channel::{BrokerSettings, ChannelClient, ConnectionState, InboundMessage};
pub use error::{BackendError, CaptureError, ChannelError, DashboardError, GateError};
pub use imaging::{CaptureDevice, FileCaptureDevice};
pub use mqtt::MqttConnector;
pub use persistence::{HttpPersistence, PersistenceGateway};
pub use projection::{RunListItem, ViewSnapshot};
pub use registry::RunEntry;
pub use session::{FileSessionStore, MemorySessionStore, SessionStore};
pub use supervisor::{
    CreatedRun, DashboardEvent, DiagnosticLevel, RunSupervisor, SupervisorConfig, ViewIntent,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
