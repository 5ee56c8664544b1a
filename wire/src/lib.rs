//! Wire message schemas shared by the worker manager (host) and the
//! internal controller (guest): the bootstrap handshake, the persistent
//! channel's execution protocol, and the metrics shapes each side reports.

pub mod execution;
pub mod handshake;
pub mod lifecycle;
pub mod metrics;
pub mod node;
pub mod units;

/// Guest's fixed bootstrap WebSocket listener port (§4.6, §6).
pub const GUEST_BOOTSTRAP_PORT: u16 = 39019;

pub use execution::{ArgumentValue, ExecutionCommand, ExecutionRequest, ExecutionResponse, ExecutionResult};
pub use handshake::{HandshakeReceptionMessage, HandshakeResponse, HandshakeStatus, RegistrationDetails};
pub use lifecycle::GuestLifecycle;
pub use metrics::{NamespaceDetails, PodDetails, WorkerMetrics};
pub use node::NodeDetails;
