//! Transport abstraction
//!
//! The protocol sees two channels: a best-effort broadcast channel that
//! reaches every other peer and a directed channel addressed by
//! `PeerAddress`. Both only move bytes; neither promises delivery or order.
//!
//! `MemoryNetwork` is an in-process implementation used by the simulator
//! and the tests.

use crate::network::message::PeerAddress;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// First port handed out by `MemoryNetwork::join`
pub const MEMORY_BASE_PORT: u16 = 5000;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No peer listening at {0}")]
    UnknownDestination(PeerAddress),
    #[error("Address already in use: {0}")]
    AddressInUse(PeerAddress),
    #[error("Transport closed")]
    Closed,
}

/// A frame as received from a transport
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub sender: PeerAddress,
    pub bytes: Bytes,
}

/// Sending half of a transport
pub trait Transport: Send + Sync {
    /// Address other peers reach this node at
    fn local_address(&self) -> &PeerAddress;

    /// Hand `bytes` to the transport for `destination`
    fn send(&self, destination: &PeerAddress, bytes: Bytes) -> Result<(), TransportError>;
}

/// One channel as seen by a node: how to send, and the inbound stream
pub struct TransportEndpoint {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Both channels of one node
pub struct Transports {
    pub broadcast: TransportEndpoint,
    pub directed: TransportEndpoint,
}

impl Transports {
    /// The node's directed address (what IAM advertises)
    pub fn local_address(&self) -> PeerAddress {
        self.directed.transport.local_address().clone()
    }
}

#[derive(Default)]
struct NetworkState {
    directed: HashMap<PeerAddress, mpsc::UnboundedSender<InboundFrame>>,
    group: HashMap<PeerAddress, mpsc::UnboundedSender<InboundFrame>>,
    next_port: u16,
}

/// In-process network connecting any number of nodes
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a node on `host` with the next free port
    pub fn join(&self, host: &str) -> Result<Transports, TransportError> {
        let port = {
            let mut state = self.state();
            let port = MEMORY_BASE_PORT + state.next_port;
            state.next_port += 1;
            port
        };
        self.join_at(PeerAddress::new(host, port))
    }

    /// Attach a node at a specific address
    pub fn join_at(&self, address: PeerAddress) -> Result<Transports, TransportError> {
        let mut state = self.state();
        if state.directed.contains_key(&address) {
            return Err(TransportError::AddressInUse(address));
        }

        let (group_tx, group_rx) = mpsc::unbounded_channel();
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        state.group.insert(address.clone(), group_tx);
        state.directed.insert(address.clone(), direct_tx);

        Ok(Transports {
            broadcast: TransportEndpoint {
                transport: Arc::new(MemoryBroadcast {
                    network: self.clone(),
                    local: address.clone(),
                }),
                inbound: group_rx,
            },
            directed: TransportEndpoint {
                transport: Arc::new(MemoryDirected {
                    network: self.clone(),
                    local: address,
                }),
                inbound: direct_rx,
            },
        })
    }

    /// Detach a node; frames sent to it afterwards are undeliverable
    pub fn leave(&self, address: &PeerAddress) {
        let mut state = self.state();
        state.group.remove(address);
        state.directed.remove(address);
    }

    pub fn members(&self) -> usize {
        self.state().directed.len()
    }
}

struct MemoryBroadcast {
    network: MemoryNetwork,
    local: PeerAddress,
}

impl Transport for MemoryBroadcast {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    /// Deliver to every group member except the sender
    fn send(&self, _group: &PeerAddress, bytes: Bytes) -> Result<(), TransportError> {
        let mut state = self.network.state();
        state.group.retain(|address, tx| {
            if *address == self.local {
                return true;
            }
            tx.send(InboundFrame {
                sender: self.local.clone(),
                bytes: bytes.clone(),
            })
            .is_ok()
        });
        Ok(())
    }
}

struct MemoryDirected {
    network: MemoryNetwork,
    local: PeerAddress,
}

impl Transport for MemoryDirected {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    fn send(&self, destination: &PeerAddress, bytes: Bytes) -> Result<(), TransportError> {
        let mut state = self.network.state();
        let tx = state
            .directed
            .get(destination)
            .ok_or_else(|| TransportError::UnknownDestination(destination.clone()))?;
        let frame = InboundFrame {
            sender: self.local.clone(),
            bytes,
        };
        if tx.send(frame).is_err() {
            state.directed.remove(destination);
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}
