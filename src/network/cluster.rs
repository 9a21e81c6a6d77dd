//! Deterministic in-process cluster
//!
//! Drives a set of `PeerProtocol`s from a single FIFO of outbound actions,
//! without threads or sockets. Mining happens inline on the node that was
//! asked to mine.

use crate::config::NodeConfig;
use crate::core::TxId;
use crate::crypto::{KeyError, Signer};
use crate::mining::Miner;
use crate::network::message::PeerAddress;
use crate::network::protocol::{Outbound, PeerProtocol};
use crate::network::transport::MEMORY_BASE_PORT;
use crate::wallet::WalletError;
use bytes::Bytes;
use log::debug;
use std::collections::VecDeque;

/// Host every cluster member is placed on
pub const CLUSTER_HOST: &str = "127.0.0.1";

/// Upper bound on actions processed by one `run`
pub const MAX_STEPS: usize = 100_000;

pub struct Cluster {
    nodes: Vec<PeerProtocol>,
    miner: Miner,
    queue: VecDeque<(usize, Outbound)>,
    /// Deliver every frame twice
    duplicate_delivery: bool,
    delivered: usize,
}

impl Cluster {
    /// One node per config, each with a fresh identity
    pub fn new(configs: &[NodeConfig]) -> Result<Self, KeyError> {
        let nodes = configs
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let address = PeerAddress::new(CLUSTER_HOST, MEMORY_BASE_PORT + i as u16);
                PeerProtocol::new(config, address, Signer::generate())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            nodes,
            miner: Miner::default(),
            queue: VecDeque::new(),
            duplicate_delivery: false,
            delivered: 0,
        })
    }

    pub fn with_duplicate_delivery(mut self, enabled: bool) -> Self {
        self.duplicate_delivery = enabled;
        self
    }

    pub fn nodes(&self) -> &[PeerProtocol] {
        &self.nodes
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name() == name)
    }

    pub fn node(&self, name: &str) -> Option<&PeerProtocol> {
        self.index_of(name).map(|i| &self.nodes[i])
    }

    /// Frames handed to a node so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Start a transfer on node `from`; run the cluster to carry it out
    pub fn send_coin(&mut self, from: usize, to: &str, value: u64) -> Result<TxId, WalletError> {
        let (id, out) = self.nodes[from].send_coin(to, value, "")?;
        self.enqueue(from, out);
        Ok(id)
    }

    /// Hand raw bytes to node `to` as if they arrived from the network
    pub fn inject(&mut self, to: usize, bytes: &[u8]) {
        self.deliver(to, bytes);
    }

    /// Process one queued action. Returns false once the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some((origin, action)) = self.queue.pop_front() else {
            return false;
        };

        match action {
            Outbound::Broadcast(bytes) => {
                for i in 0..self.nodes.len() {
                    if i != origin {
                        self.deliver_frame(i, &bytes);
                    }
                }
            }
            Outbound::Direct { to, bytes } => {
                match self.nodes.iter().position(|node| *node.address() == to) {
                    Some(i) => self.deliver_frame(i, &bytes),
                    None => debug!("cluster: nobody at {}", to),
                }
            }
            Outbound::Mine(block) => match self.miner.mine(block.clone()) {
                Some((mined, _stats)) => {
                    let out = self.nodes[origin].mined(mined);
                    self.enqueue(origin, out);
                }
                None => self.nodes[origin].mining_failed(&block),
            },
        }
        true
    }

    /// Step until quiet. Returns the number of actions processed.
    pub fn run(&mut self) -> usize {
        let mut steps = 0;
        while steps < MAX_STEPS && self.step() {
            steps += 1;
        }
        steps
    }

    fn deliver_frame(&mut self, to: usize, bytes: &Bytes) {
        self.deliver(to, bytes);
        if self.duplicate_delivery {
            self.deliver(to, bytes);
        }
    }

    fn deliver(&mut self, to: usize, bytes: &[u8]) {
        self.delivered += 1;
        let out = self.nodes[to].handle_frame(bytes);
        self.enqueue(to, out);
    }

    fn enqueue(&mut self, origin: usize, out: Vec<Outbound>) {
        self.queue
            .extend(out.into_iter().map(|action| (origin, action)));
    }
}
