//! Peer-to-peer networking
//!
//! Provides the transfer protocol and the runtime that carries it.
//!
//! # Features
//! - Signed frames over a broadcast and a directed channel
//! - WHOIS/IAM identity discovery with deferred delivery
//! - Transfer, acknowledgement, proposal and confirmation rounds
//! - In-memory transport and a deterministic in-process cluster

pub mod cluster;
pub mod message;
pub mod node;
pub mod protocol;
pub mod transport;

pub use cluster::Cluster;
pub use message::{
    Frame, MessageTag, Payload, PeerAddress, BROADCAST_HOST, BROADCAST_NAME, BROADCAST_PORT,
};
pub use node::{Node, NodeError, NodeStatus};
pub use protocol::{Outbound, PeerProtocol, PendingDelivery, ProtocolError, TransferState};
pub use transport::{
    InboundFrame, MemoryNetwork, Transport, TransportEndpoint, TransportError, Transports,
    MEMORY_BASE_PORT,
};
