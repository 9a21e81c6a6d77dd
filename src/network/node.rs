//! Node runtime
//!
//! Runs one `PeerProtocol` on the tokio runtime. Worker tasks:
//! - broadcast receiver and directed receiver feed frames to the protocol
//! - broadcast sender and directed sender drain the outbound queues
//! - miner searches nonces for candidate blocks on the blocking pool
//!
//! The protocol sits behind a single async mutex, so frames are processed
//! one at a time. Receivers wake every poll interval to check the shutdown
//! flag.

use crate::config::{ConfigError, NodeConfig};
use crate::core::{Block, TxId};
use crate::crypto::{KeyError, Signer};
use crate::mining::Miner;
use crate::network::message::PeerAddress;
use crate::network::protocol::{Outbound, PeerProtocol, TransferState};
use crate::network::transport::{InboundFrame, Transport, TransportError, Transports};
use crate::wallet::WalletError;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] KeyError),
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Node status information
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub address: String,
    pub height: usize,
    pub latest_hash: String,
    pub balance: i64,
    pub spendable: u64,
}

type OutboundQueue = mpsc::Sender<(PeerAddress, Bytes)>;

/// Routes protocol actions to the sender and miner queues
#[derive(Clone)]
struct Dispatcher {
    name: String,
    broadcast: OutboundQueue,
    directed: OutboundQueue,
    mining: mpsc::UnboundedSender<Block>,
}

impl Dispatcher {
    fn dispatch(&self, actions: Vec<Outbound>) {
        for action in actions {
            match action {
                Outbound::Broadcast(bytes) => {
                    let group = PeerAddress::broadcast_group();
                    if let Err(e) = self.broadcast.try_send((group, bytes)) {
                        log::warn!("{}: broadcast dropped: {}", self.name, e);
                    }
                }
                Outbound::Direct { to, bytes } => {
                    if let Err(e) = self.directed.try_send((to, bytes)) {
                        log::warn!("{}: directed frame dropped: {}", self.name, e);
                    }
                }
                Outbound::Mine(block) => {
                    if let Err(e) = self.mining.send(block) {
                        log::warn!("{}: mining request dropped: {}", self.name, e);
                    }
                }
            }
        }
    }
}

/// A running node
pub struct Node {
    name: String,
    address: PeerAddress,
    poll_interval: Duration,
    protocol: Arc<Mutex<PeerProtocol>>,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node with a fresh identity
    pub async fn start(config: NodeConfig, transports: Transports) -> Result<Self, NodeError> {
        Self::start_with_signer(config, Signer::generate(), transports).await
    }

    /// Start a node on the given transports and spawn its workers
    pub async fn start_with_signer(
        config: NodeConfig,
        signer: Signer,
        transports: Transports,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let address = transports.local_address();
        let protocol = Arc::new(Mutex::new(PeerProtocol::new(
            &config,
            address.clone(),
            signer,
        )?));

        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.outbound_queue_capacity);
        let (directed_tx, directed_rx) = mpsc::channel(config.outbound_queue_capacity);
        let (mining_tx, mining_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            name: config.name.clone(),
            broadcast: broadcast_tx,
            directed: directed_tx,
            mining: mining_tx,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let poll = config.poll_interval();
        let Transports {
            broadcast,
            directed,
        } = transports;

        let workers = vec![
            tokio::spawn(receive_loop(
                config.name.clone(),
                broadcast.inbound,
                protocol.clone(),
                dispatcher.clone(),
                shutdown.clone(),
                poll,
            )),
            tokio::spawn(receive_loop(
                config.name.clone(),
                directed.inbound,
                protocol.clone(),
                dispatcher.clone(),
                shutdown.clone(),
                poll,
            )),
            tokio::spawn(send_loop(
                config.name.clone(),
                broadcast.transport,
                broadcast_rx,
                shutdown.clone(),
                poll,
            )),
            tokio::spawn(send_loop(
                config.name.clone(),
                directed.transport,
                directed_rx,
                shutdown.clone(),
                poll,
            )),
            tokio::spawn(mine_loop(
                protocol.clone(),
                dispatcher.clone(),
                Miner::new(config.mining_workers).with_cancel(shutdown.clone()),
                mining_rx,
                shutdown.clone(),
                poll,
            )),
        ];

        log::info!("Node {} started at {}", config.name, address);

        Ok(Self {
            name: config.name,
            address,
            poll_interval: poll,
            protocol,
            dispatcher,
            shutdown,
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Pay `value` to the node called `to`
    pub async fn send_coin(&self, to: &str, value: u64) -> Result<TxId, NodeError> {
        let (id, out) = self.protocol.lock().await.send_coin(to, value, "")?;
        self.dispatcher.dispatch(out);
        Ok(id)
    }

    pub async fn balance(&self, name: &str) -> i64 {
        self.protocol.lock().await.balance(name)
    }

    pub async fn latest_hash(&self) -> Vec<u8> {
        self.protocol.lock().await.ledger().latest_hash().to_vec()
    }

    pub async fn height(&self) -> usize {
        self.protocol.lock().await.ledger().height()
    }

    pub async fn transfer_state(&self, id: &TxId) -> Option<TransferState> {
        self.protocol.lock().await.transfer_state(id)
    }

    pub async fn status(&self) -> NodeStatus {
        let protocol = self.protocol.lock().await;
        NodeStatus {
            name: self.name.clone(),
            address: self.address.to_string(),
            height: protocol.ledger().height(),
            latest_hash: hex::encode(protocol.ledger().latest_hash()),
            balance: protocol.balance(&self.name),
            spendable: protocol.spendable(),
        }
    }

    /// Wait until the chain reaches `height`. Returns false on timeout.
    pub async fn wait_for_height(&self, height: usize, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.height().await >= height {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop every worker and wait for them to finish
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::warn!("{}: worker ended abnormally: {}", self.name, e);
            }
        }
        log::info!("Node {} stopped", self.name);
    }
}

async fn receive_loop(
    name: String,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    protocol: Arc<Mutex<PeerProtocol>>,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match timeout(poll, inbound.recv()).await {
            Ok(Some(frame)) => {
                log::trace!("{}: {} bytes from {}", name, frame.bytes.len(), frame.sender);
                let out = protocol.lock().await.handle_frame(&frame.bytes);
                dispatcher.dispatch(out);
            }
            Ok(None) => {
                log::debug!("{}: inbound channel closed", name);
                break;
            }
            Err(_) => {}
        }
    }
}

async fn send_loop(
    name: String,
    transport: Arc<dyn Transport>,
    mut queue: mpsc::Receiver<(PeerAddress, Bytes)>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match timeout(poll, queue.recv()).await {
            Ok(Some((destination, bytes))) => {
                if let Err(e) = transport.send(&destination, bytes) {
                    log::warn!("{}: send to {} failed: {}", name, destination, e);
                }
            }
            Ok(None) => break,
            Err(_) => {}
        }
    }
}

async fn mine_loop(
    protocol: Arc<Mutex<PeerProtocol>>,
    dispatcher: Dispatcher,
    miner: Miner,
    mut queue: mpsc::UnboundedReceiver<Block>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let block = match timeout(poll, queue.recv()).await {
            Ok(Some(block)) => block,
            Ok(None) => break,
            Err(_) => continue,
        };

        let worker = miner.clone();
        let candidate = block.clone();
        match tokio::task::spawn_blocking(move || worker.mine(candidate)).await {
            Ok(Some((mined, _stats))) => {
                let out = protocol.lock().await.mined(mined);
                dispatcher.dispatch(out);
            }
            Ok(None) if shutdown.load(Ordering::SeqCst) => break,
            Ok(None) => {
                log::warn!(
                    "{}: no nonce found for block {}",
                    dispatcher.name,
                    block.short_hash()
                );
                protocol.lock().await.mining_failed(&block);
            }
            Err(e) => {
                log::error!("{}: mining task failed: {}", dispatcher.name, e);
                protocol.lock().await.mining_failed(&block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisConfig;
    use crate::network::transport::MemoryNetwork;

    fn config(name: &str) -> NodeConfig {
        NodeConfig {
            required_zero_bits: 4,
            genesis: GenesisConfig {
                beneficiary: "n1".to_string(),
                stake: 10,
            },
            poll_interval_ms: 10,
            ..NodeConfig::named(name)
        }
    }

    #[tokio::test]
    async fn test_node_creation() {
        let network = MemoryNetwork::new();
        let node = Node::start(config("n1"), network.join("127.0.0.1").unwrap())
            .await
            .unwrap();

        let status = node.status().await;
        assert_eq!(status.name, "n1");
        assert_eq!(status.height, 0);
        assert_eq!(status.balance, 10);
        assert_eq!(status.spendable, 10);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let result = Node::start(NodeConfig::named(""), network.join("127.0.0.1").unwrap()).await;
        assert!(matches!(result, Err(NodeError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transfer_between_nodes() {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for name in ["n1", "n2", "n3"] {
            let transports = network.join("127.0.0.1").unwrap();
            nodes.push(Node::start(config(name), transports).await.unwrap());
        }

        let id = nodes[0].send_coin("n2", 3).await.unwrap();
        for node in &nodes {
            assert!(node.wait_for_height(1, Duration::from_secs(10)).await);
        }

        assert_eq!(
            nodes[0].transfer_state(&id).await,
            Some(TransferState::Confirmed)
        );
        let head = nodes[0].latest_hash().await;
        for node in &nodes {
            assert_eq!(node.balance("n1").await, 7);
            assert_eq!(node.balance("n2").await, 3);
            assert_eq!(node.latest_hash().await, head);
        }

        for node in nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_interrupts_mining() {
        let network = MemoryNetwork::new();
        let node = Node::start(config("n3"), network.join("127.0.0.1").unwrap())
            .await
            .unwrap();

        let signer = Signer::generate();
        let tx = crate::core::Transaction::leaf("n1", "n2", 3, "")
            .signed(&signer)
            .unwrap();
        let hopeless = Block::new("n1", vec![5u8; 32], tx, 200);
        node.dispatcher.dispatch(vec![Outbound::Mine(hopeless)]);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), node.shutdown()).await;
        assert!(stopped.is_ok());
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let network = MemoryNetwork::new();
        let node = Node::start(config("n1"), network.join("127.0.0.1").unwrap())
            .await
            .unwrap();

        let result = node.send_coin("n2", 100).await;
        assert!(matches!(
            result,
            Err(NodeError::Wallet(WalletError::InsufficientFunds { .. }))
        ));
        node.shutdown().await;
    }
}
