//! Channel Supervisor
//!
//! Owns the push channel that announces remote changes: connects, retries
//! with exponential backoff, parses frames and forwards change events for
//! one entity type.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (retry)
//!                                         \-> Closed (teardown)
//! ```

pub mod message;
pub mod policy;
pub mod supervisor;
pub mod transport;

pub use message::{liveness_probe, ChannelMessage, FrameRouter, Routed};
pub use policy::{CloseDecision, ReconnectPolicy, ReconnectTracker, ABNORMAL_CLOSE, NORMAL_CLOSE};
pub use supervisor::{ChannelState, ChannelSupervisor, SupervisorHandle};
pub use transport::{ChannelConnection, ChannelTransport, Frame, WebSocketTransport};
