//! # ssm-fleet
//!
//! Host-wide view of the game servers:
//! - Registry: the set of instances, loaded from storage at boot
//! - Ports: allocation from the configured range
//! - Channel: per-instance live telemetry with secret handshake

pub mod channel;
pub mod ports;
pub mod registry;

pub use channel::{ChannelMessage, ChannelSession, ClientRequest, TelemetryHub};
pub use ports::{allocate_port, is_port_free, PortRange};
pub use registry::Fleet;
