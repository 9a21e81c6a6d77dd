//! Peer protocol state machine
//!
//! Turns inbound frames into key-directory and ledger operations and drives
//! a transfer through its rounds:
//!
//! ```text
//! CREATED -> SENT -> ACKED -> PROPOSED -> GOSSIPING -> CONFIRMED
//!        \ ABANDONED (parked on a missing key or address, resumes on IAM)
//!
//! PROPOSED, GOSSIPING -> ABANDONED (outrun by a competing block)
//! ```
//!
//! A transfer outrun by a competing block at the same height is abandoned
//! for good and the sender's inputs are released, so it can pay again.
//!
//! The state machine does no I/O. Every entry point returns the `Outbound`
//! actions the caller must carry out: frames for the broadcast or directed
//! transport, and candidate blocks to mine.

use crate::codec::{CodecError, Decode, Encode};
use crate::config::NodeConfig;
use crate::core::{Block, Ledger, LedgerError, Transaction, TxId};
use crate::crypto::{public_key_from_bytes, KeyDirectory, KeyError, Signer};
use crate::mining::pow;
use crate::network::message::{Frame, Payload, PeerAddress, BROADCAST_NAME};
use crate::wallet::{Wallet, WalletError};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Errors raised while handling one frame. None of them escape the router:
/// `NoPublicKey` defers the frame, everything else drops it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("No public key for {0}")]
    NoPublicKey(String),
    #[error("Bad signature by {0}")]
    BadSignature(String),
    #[error("Incorrect nonce for block {0}")]
    IncorrectNonce(String),
    #[error("Unexpected message from {from}: {reason}")]
    Unexpected { from: String, reason: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] KeyError),
}

impl ProtocolError {
    fn unexpected(from: &str, reason: &str) -> Self {
        ProtocolError::Unexpected {
            from: from.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Work the caller must perform on behalf of the state machine
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Send on the broadcast channel
    Broadcast(Bytes),
    /// Send on the directed channel
    Direct { to: PeerAddress, bytes: Bytes },
    /// Search a nonce for this candidate and report back via `mined`
    Mine(Block),
}

/// Where a transfer stands from this node's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Created,
    Sent,
    Acked,
    Proposed,
    Gossiping,
    Confirmed,
    /// Parked until a missing key or address is resolved, or outrun by a
    /// competing block
    Abandoned,
}

impl TransferState {
    fn rank(self) -> u8 {
        match self {
            TransferState::Created | TransferState::Abandoned => 0,
            TransferState::Sent => 1,
            TransferState::Acked => 2,
            TransferState::Proposed => 3,
            TransferState::Gossiping => 4,
            TransferState::Confirmed => 5,
        }
    }
}

/// A message waiting for a peer identity to be resolved
#[derive(Debug, Clone)]
pub enum PendingDelivery {
    /// A transaction (or its acknowledgement) to send once the address is known
    Send {
        is_ack: bool,
        transaction: Transaction,
    },
    /// A received frame to re-run once the key is known
    Receive { frame: Frame },
}

/// A block this node proposed or received as recipient, not yet confirmed
#[derive(Debug, Clone)]
struct Candidate {
    prev_hash: Vec<u8>,
    transaction: Transaction,
}

/// Protocol state of one node
pub struct PeerProtocol {
    name: String,
    address: PeerAddress,
    signer: Signer,
    keys: KeyDirectory,
    peers: HashMap<String, PeerAddress>,
    send_queue: HashMap<String, VecDeque<PendingDelivery>>,
    recv_queue: HashMap<String, VecDeque<PendingDelivery>>,
    ledger: Ledger,
    wallet: Wallet,
    transfers: HashMap<TxId, TransferState>,
    /// Our own transfers waiting for confirmation, by transaction id
    candidates: HashMap<TxId, Candidate>,
    /// Hashes of candidate blocks already handed out for mining
    mining: HashSet<Vec<u8>>,
    /// Candidates asking for more zero bits are not mined
    max_required_zero_bits: u32,
}

impl PeerProtocol {
    pub fn new(config: &NodeConfig, address: PeerAddress, signer: Signer) -> Result<Self, KeyError> {
        let mut keys = KeyDirectory::new()?;
        keys.record(&config.name, signer.public_key());

        Ok(Self {
            name: config.name.clone(),
            address,
            signer,
            keys,
            peers: HashMap::new(),
            send_queue: HashMap::new(),
            recv_queue: HashMap::new(),
            ledger: Ledger::new(&config.genesis, config.required_zero_bits)?,
            wallet: Wallet::new(&config.name),
            transfers: HashMap::new(),
            candidates: HashMap::new(),
            mining: HashSet::new(),
            max_required_zero_bits: config.max_required_zero_bits,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn balance(&self, name: &str) -> i64 {
        self.ledger.balance(name)
    }

    /// Value this node can commit to a new transfer
    pub fn spendable(&self) -> u64 {
        self.wallet.spendable(&self.ledger)
    }

    pub fn transfer_state(&self, id: &TxId) -> Option<TransferState> {
        self.transfers.get(id).copied()
    }

    pub fn peer_address(&self, name: &str) -> Option<&PeerAddress> {
        self.peers.get(name)
    }

    pub fn knows_key(&self, name: &str) -> bool {
        self.keys.contains(name)
    }

    pub fn pending_sends(&self, name: &str) -> usize {
        self.send_queue.get(name).map_or(0, VecDeque::len)
    }

    pub fn pending_receives(&self, name: &str) -> usize {
        self.recv_queue.get(name).map_or(0, VecDeque::len)
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Pay `value` to `to`. Declined without any state change when the
    /// wallet cannot cover it.
    pub fn send_coin(
        &mut self,
        to: &str,
        value: u64,
        memo: &str,
    ) -> Result<(TxId, Vec<Outbound>), WalletError> {
        let transaction = self
            .wallet
            .build_transfer(&self.signer, &self.ledger, to, value, memo)?;
        let id = transaction.id();
        self.transfers.insert(id, TransferState::Created);
        info!("{}: paying {} to {} ({})", self.name, value, to, id);

        let mut out = Vec::new();
        self.deliver_transaction(to, false, transaction, &mut out);
        Ok((id, out))
    }

    /// Send an already signed transaction to `to`, resolving the address
    /// first if needed.
    pub fn send_transaction(&mut self, to: &str, transaction: Transaction) -> Vec<Outbound> {
        self.transfers
            .entry(transaction.id())
            .or_insert(TransferState::Created);
        let mut out = Vec::new();
        self.deliver_transaction(to, false, transaction, &mut out);
        out
    }

    /// Route one raw frame. Undecodable and invalid frames are logged and
    /// dropped.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Vec<Outbound> {
        let mut out = Vec::new();
        match Frame::from_bytes(bytes) {
            Ok(frame) => self.process(frame, &mut out),
            Err(e) => warn!("{}: dropping undecodable frame: {}", self.name, e),
        }
        out
    }

    /// Report a mined candidate. The block joins the local chain and is
    /// gossiped as confirmed.
    pub fn mined(&mut self, block: Block) -> Vec<Outbound> {
        let mut out = Vec::new();
        if !block.is_valid_pow() {
            warn!(
                "{}: discarding mined block {} with an invalid nonce",
                self.name,
                block.short_hash()
            );
            self.mining.remove(&block.hash);
            return out;
        }

        match self.ledger.add_block(block.clone()) {
            Ok(()) => {
                self.admitted(&block);
                self.broadcast(Payload::Validation(block), &mut out);
            }
            Err(LedgerError::Duplicate) => {
                debug!("{}: mined block {} already on chain", self.name, block.short_hash());
            }
            Err(LedgerError::BadHash) if self.ledger.get_block_by_hash(&block.hash).is_some() => {
                debug!(
                    "{}: mined block {} was confirmed elsewhere first",
                    self.name,
                    block.short_hash()
                );
            }
            Err(LedgerError::BadHash) if self.forks_chain(&block) => {
                warn!(
                    "{}: competing branch: mined block {} extends {} but the head is {}",
                    self.name,
                    block.short_hash(),
                    short_hex(&block.prev_hash),
                    short_hex(self.ledger.latest_hash())
                );
            }
            Err(e) => {
                debug!(
                    "{}: mined block {} is stale: {}",
                    self.name,
                    block.short_hash(),
                    e
                );
            }
        }
        out
    }

    /// Forget a candidate whose mining failed, so a later delivery retries it
    pub fn mining_failed(&mut self, block: &Block) {
        self.mining.remove(&block.hash);
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn process(&mut self, frame: Frame, out: &mut Vec<Outbound>) {
        if frame.from == self.name {
            return;
        }
        if !frame.is_broadcast() && frame.to != self.name {
            debug!(
                "{}: ignoring {} addressed to {}",
                self.name,
                frame.tag(),
                frame.to
            );
            return;
        }

        debug!("{}: {} from {}", self.name, frame.tag(), frame.from);
        match self.dispatch(&frame, out) {
            Ok(()) => {}
            Err(ProtocolError::NoPublicKey(missing)) => self.defer_receive(missing, frame, out),
            Err(ProtocolError::Ledger(LedgerError::Duplicate)) => {
                debug!(
                    "{}: {} from {} is a duplicate",
                    self.name,
                    frame.tag(),
                    frame.from
                );
            }
            Err(e) => warn!(
                "{}: dropped {} from {}: {}",
                self.name,
                frame.tag(),
                frame.from,
                e
            ),
        }
    }

    fn dispatch(&mut self, frame: &Frame, out: &mut Vec<Outbound>) -> Result<(), ProtocolError> {
        match &frame.payload {
            Payload::Whois(name) => {
                self.on_whois(name, out);
                Ok(())
            }
            Payload::Iam(key) => self.on_iam(frame, key, out),
            Payload::Transaction(tx) => self.on_transaction(frame, tx, out),
            Payload::TransactionAck(tx) => self.on_ack(frame, tx, out),
            Payload::Block(block) => self.on_block(frame, block, out),
            Payload::Validation(block) if block.confirmed => self.on_confirmed(frame, block),
            Payload::Validation(block) => self.on_unconfirmed(frame, block, out),
        }
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    fn on_whois(&self, name: &str, out: &mut Vec<Outbound>) {
        if name == self.name {
            self.broadcast(Payload::Iam(self.signer.public_key_bytes()), out);
        }
    }

    /// An IAM must be signed by the key it announces
    fn on_iam(&mut self, frame: &Frame, key: &[u8], out: &mut Vec<Outbound>) -> Result<(), ProtocolError> {
        let key = public_key_from_bytes(key)?;
        if !self.signer.verify(&key, &frame.signature, &frame.payload_bytes()) {
            return Err(ProtocolError::BadSignature(frame.from.clone()));
        }

        if self.keys.record(&frame.from, key) {
            info!("{}: learned {} at {}", self.name, frame.from, frame.source);
        }
        self.peers.insert(frame.from.clone(), frame.source.clone());
        self.replay(&frame.from, out);
        Ok(())
    }

    /// Flush everything parked on `name`: sends first, then receives, both FIFO
    fn replay(&mut self, name: &str, out: &mut Vec<Outbound>) {
        let sends = self.send_queue.remove(name).unwrap_or_default();
        let receives = self.recv_queue.remove(name).unwrap_or_default();
        if !sends.is_empty() || !receives.is_empty() {
            debug!(
                "{}: replaying {} sends and {} receives for {}",
                self.name,
                sends.len(),
                receives.len(),
                name
            );
        }

        for entry in sends {
            if let PendingDelivery::Send {
                is_ack,
                transaction,
            } = entry
            {
                self.deliver_transaction(name, is_ack, transaction, out);
            }
        }
        for entry in receives {
            if let PendingDelivery::Receive { frame } = entry {
                self.process(frame, out);
            }
        }
    }

    fn defer_receive(&mut self, missing: String, frame: Frame, out: &mut Vec<Outbound>) {
        debug!(
            "{}: parking {} from {} until {} is known",
            self.name,
            frame.tag(),
            frame.from,
            missing
        );
        if let Some(tx) = transaction_of(&frame.payload) {
            if tx.involves(&self.name) {
                self.advance(tx.id(), TransferState::Abandoned);
            }
        }
        self.recv_queue
            .entry(missing.clone())
            .or_default()
            .push_back(PendingDelivery::Receive { frame });
        self.whois(&missing, out);
    }

    // =========================================================================
    // Transfer rounds
    // =========================================================================

    fn deliver_transaction(
        &mut self,
        to: &str,
        is_ack: bool,
        transaction: Transaction,
        out: &mut Vec<Outbound>,
    ) {
        let id = transaction.id();
        let Some(address) = self.peers.get(to).cloned() else {
            debug!("{}: no address for {}, asking", self.name, to);
            if !is_ack {
                self.advance(id, TransferState::Abandoned);
            }
            self.send_queue
                .entry(to.to_string())
                .or_default()
                .push_back(PendingDelivery::Send {
                    is_ack,
                    transaction,
                });
            self.whois(to, out);
            return;
        };

        if is_ack {
            self.direct(to, address, Payload::TransactionAck(transaction), out);
        } else {
            self.direct(to, address, Payload::Transaction(transaction), out);
            self.advance(id, TransferState::Sent);
        }
    }

    /// Recipient side: authenticate and acknowledge
    fn on_transaction(
        &mut self,
        frame: &Frame,
        tx: &Transaction,
        out: &mut Vec<Outbound>,
    ) -> Result<(), ProtocolError> {
        self.verify_envelope(frame)?;
        if tx.to != self.name || tx.from != frame.from {
            return Err(ProtocolError::unexpected(
                &frame.from,
                "transaction parties do not match the envelope",
            ));
        }
        self.verify_transaction(tx)?;

        self.advance(tx.id(), TransferState::Acked);
        self.deliver_transaction(&frame.from, true, tx.clone(), out);
        Ok(())
    }

    /// Sender side: the recipient acknowledged, propose the block to it
    fn on_ack(
        &mut self,
        frame: &Frame,
        tx: &Transaction,
        out: &mut Vec<Outbound>,
    ) -> Result<(), ProtocolError> {
        self.verify_envelope(frame)?;
        if tx.from != self.name || tx.to != frame.from {
            return Err(ProtocolError::unexpected(
                &frame.from,
                "acknowledgement for a transfer we did not send to it",
            ));
        }

        let id = tx.id();
        match self.transfers.get(&id) {
            Some(TransferState::Sent) => {}
            Some(state) => {
                debug!("{}: ignoring ack for {} in state {:?}", self.name, id, state);
                return Ok(());
            }
            None => {
                return Err(ProtocolError::unexpected(
                    &frame.from,
                    "acknowledgement for an unknown transfer",
                ));
            }
        }
        self.advance(id, TransferState::Acked);

        let block = self.ledger.next_block(&self.name, tx.clone());
        info!(
            "{}: proposing block {} to {}",
            self.name,
            block.short_hash(),
            frame.from
        );
        self.remember_candidate(&block);
        self.direct(&frame.from, frame.source.clone(), Payload::Block(block), out);
        self.advance(id, TransferState::Proposed);
        Ok(())
    }

    /// Recipient side: check the chain link, then open the gossip round
    fn on_block(
        &mut self,
        frame: &Frame,
        block: &Block,
        out: &mut Vec<Outbound>,
    ) -> Result<(), ProtocolError> {
        self.verify_envelope(frame)?;
        if block.proposer != frame.from {
            return Err(ProtocolError::unexpected(
                &frame.from,
                "block proposed on behalf of another peer",
            ));
        }
        self.verify_transaction(&block.transaction)?;
        self.ledger.check_hash(block)?;

        self.remember_candidate(block);
        self.advance(block.transaction.id(), TransferState::Gossiping);
        self.broadcast(Payload::Validation(block.clone().unconfirmed()), out);
        Ok(())
    }

    /// Third parties mine candidates; the transfer's own parties wait
    fn on_unconfirmed(
        &mut self,
        frame: &Frame,
        block: &Block,
        out: &mut Vec<Outbound>,
    ) -> Result<(), ProtocolError> {
        self.verify_envelope(frame)?;
        if block.transaction.involves(&self.name) {
            // Gossip about an outrun candidate must not revive it.
            if self.ledger.check_hash(block).is_ok() {
                self.advance(block.transaction.id(), TransferState::Gossiping);
            }
            return Ok(());
        }
        if self.mining.contains(&block.hash) {
            return Ok(());
        }

        if block.required_zero_bits < self.ledger.required_zero_bits() {
            return Err(ProtocolError::unexpected(
                &frame.from,
                "candidate target below the local floor",
            ));
        }
        if block.required_zero_bits > self.max_required_zero_bits {
            return Err(ProtocolError::unexpected(
                &frame.from,
                "candidate target above the local ceiling",
            ));
        }
        self.verify_transaction(&block.transaction)?;
        self.ledger.check_hash(block)?;

        self.mining.insert(block.hash.clone());
        out.push(Outbound::Mine(block.clone()));
        Ok(())
    }

    /// Every peer: check the work, the signatures, then admit
    fn on_confirmed(&mut self, frame: &Frame, block: &Block) -> Result<(), ProtocolError> {
        self.verify_envelope(frame)?;
        if block.required_zero_bits < self.ledger.required_zero_bits()
            || !pow::check(&block.hash, block.nonce, block.required_zero_bits)
        {
            return Err(ProtocolError::IncorrectNonce(block.short_hash()));
        }
        self.verify_transaction(&block.transaction)?;
        match self.ledger.add_block(block.clone()) {
            Ok(()) => {}
            Err(LedgerError::BadHash) if self.ledger.get_block_by_hash(&block.hash).is_some() => {
                debug!(
                    "{}: block {} from {} is already confirmed under another nonce",
                    self.name,
                    block.short_hash(),
                    frame.from
                );
                return Ok(());
            }
            Err(LedgerError::BadHash) if self.forks_chain(block) => {
                warn!(
                    "{}: competing branch: block {} from {} extends {} but the head is {}",
                    self.name,
                    block.short_hash(),
                    frame.from,
                    short_hex(&block.prev_hash),
                    short_hex(self.ledger.latest_hash())
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.admitted(block);
        Ok(())
    }

    fn admitted(&mut self, block: &Block) {
        let tx = &block.transaction;
        let id = tx.id();
        if tx.from == self.name {
            self.wallet.release(tx);
        }
        if tx.involves(&self.name) {
            self.advance(id, TransferState::Confirmed);
        }
        self.candidates.remove(&id);
        info!(
            "{}: confirmed block {} ({} -> {}: {}), height {}",
            self.name,
            block.short_hash(),
            tx.from,
            tx.to,
            tx.value,
            self.ledger.height()
        );
        self.abandon_outrun_candidates();
    }

    fn remember_candidate(&mut self, block: &Block) {
        self.candidates.insert(
            block.transaction.id(),
            Candidate {
                prev_hash: block.prev_hash.clone(),
                transaction: block.transaction.clone(),
            },
        );
    }

    /// Drop candidates that no longer extend the head. Their blocks can
    /// never be admitted, so the sender's inputs are released.
    fn abandon_outrun_candidates(&mut self) {
        let latest = self.ledger.latest_hash().to_vec();
        let outrun: Vec<TxId> = self
            .candidates
            .iter()
            .filter(|(_, candidate)| candidate.prev_hash != latest)
            .map(|(id, _)| *id)
            .collect();

        for id in outrun {
            let Some(candidate) = self.candidates.remove(&id) else {
                continue;
            };
            if candidate.transaction.from == self.name {
                self.wallet.release(&candidate.transaction);
            }
            // Abandoned ranks lowest, so bypass `advance`.
            self.transfers.insert(id, TransferState::Abandoned);
            warn!(
                "{}: transfer {} ({} -> {}: {}) was outrun by a competing block",
                self.name,
                id,
                candidate.transaction.from,
                candidate.transaction.to,
                candidate.transaction.value
            );
        }
    }

    /// Whether `block` hangs off an earlier block of our chain rather than the head
    fn forks_chain(&self, block: &Block) -> bool {
        block.prev_hash != self.ledger.latest_hash()
            && self.ledger.get_block_by_hash(&block.prev_hash).is_some()
    }

    /// Move a transfer forward; late duplicates never move it back
    fn advance(&mut self, id: TxId, next: TransferState) {
        let current = self.transfers.entry(id).or_insert(next);
        if next.rank() >= current.rank() {
            *current = next;
        }
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Check the envelope signature and refresh the sender's address
    fn verify_envelope(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let key = *self
            .keys
            .lookup(&frame.from)
            .ok_or_else(|| ProtocolError::NoPublicKey(frame.from.clone()))?;
        if !self.signer.verify(&key, &frame.signature, &frame.payload_bytes()) {
            return Err(ProtocolError::BadSignature(frame.from.clone()));
        }
        self.peers.insert(frame.from.clone(), frame.source.clone());
        Ok(())
    }

    /// Check the signature of `tx` and, recursively, of its inputs and outputs
    fn verify_transaction(&self, tx: &Transaction) -> Result<(), ProtocolError> {
        let key = self
            .keys
            .lookup(&tx.from)
            .ok_or_else(|| ProtocolError::NoPublicKey(tx.from.clone()))?;
        if !self.signer.verify(key, &tx.signature, &tx.signing_bytes()) {
            return Err(ProtocolError::BadSignature(tx.from.clone()));
        }
        for child in tx.inputs.iter().chain(tx.outputs.iter()) {
            self.verify_transaction(child)?;
        }
        Ok(())
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn encode_frame(&self, to: &str, destination: PeerAddress, payload: Payload) -> Option<Bytes> {
        match Frame::signed(
            &self.name,
            to,
            self.address.clone(),
            destination,
            payload,
            &self.signer,
        ) {
            Ok(frame) => Some(Bytes::from(frame.to_bytes())),
            Err(e) => {
                error!("{}: failed to sign frame: {}", self.name, e);
                None
            }
        }
    }

    fn broadcast(&self, payload: Payload, out: &mut Vec<Outbound>) {
        if let Some(bytes) =
            self.encode_frame(BROADCAST_NAME, PeerAddress::broadcast_group(), payload)
        {
            out.push(Outbound::Broadcast(bytes));
        }
    }

    fn direct(&self, to: &str, address: PeerAddress, payload: Payload, out: &mut Vec<Outbound>) {
        if let Some(bytes) = self.encode_frame(to, address.clone(), payload) {
            out.push(Outbound::Direct { to: address, bytes });
        }
    }

    fn whois(&self, name: &str, out: &mut Vec<Outbound>) {
        self.broadcast(Payload::Whois(name.to_string()), out);
    }
}

fn short_hex(hash: &[u8]) -> String {
    let encoded = hex::encode(hash);
    encoded.chars().take(16).collect()
}

fn transaction_of(payload: &Payload) -> Option<&Transaction> {
    match payload {
        Payload::Transaction(tx) | Payload::TransactionAck(tx) => Some(tx),
        Payload::Block(block) | Payload::Validation(block) => Some(&block.transaction),
        Payload::Whois(_) | Payload::Iam(_) => None,
    }
}
