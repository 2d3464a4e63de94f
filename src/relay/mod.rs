//! Packet Relay Module
//!
//! Bidirectional forwarding between the client and the upstream server with
//! rule-driven holding of client packets.

pub mod engine;
pub mod monitor;
pub mod session;

pub use engine::{LoopExit, RelayEngine, UpstreamWriter};
pub use monitor::{PacketEvent, PacketKind, PacketMonitor};
pub use session::{RelaySession, SessionStats};
