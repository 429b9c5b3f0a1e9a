//! Transport, link and resource engines for the Trellis mesh stack.
//!
//! The engine is a pure state machine: the host feeds it framed datagrams,
//! outbound requests and a monotonic clock, and applies the action batches
//! it returns. A reference tokio embedding lives in [`host`].

pub mod hdlc;
pub mod host;
pub mod iface;
pub mod link;
pub mod resource;
pub mod transport;

pub use iface::{InterfaceDesc, InterfaceId, InterfaceMode};
pub use link::{Link, LinkId, LinkStatus};
pub use resource::{ResourceEvent, ResourceManager};
pub use transport::{EngineStats, TransportAction, TransportConfig, TransportEngine};
