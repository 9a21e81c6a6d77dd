//! Protocol messages and the transport envelope
//!
//! Frame layout:
//!
//! ```text
//! tag[16] | from | to | src_host | src_port:u16 | dst_host | dst_port:u16 | signature | payload
//! ```
//!
//! Every variable-length field is a `u32` length followed by the bytes.
//! The signature covers the payload bytes only.

use crate::codec::{CodecError, Decode, Encode, WireReader, WireWriter, TAG_LEN};
use crate::core::{Block, Transaction};
use crate::crypto::{KeyError, Signer};
use std::fmt;

/// `to` of frames addressed to every peer
pub const BROADCAST_NAME: &str = "*";

/// Group address of the broadcast channel
pub const BROADCAST_HOST: &str = "230.0.0.1";
pub const BROADCAST_PORT: u16 = 4446;

/// Message type carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Whois,
    Iam,
    Transaction,
    TransactionAck,
    Block,
    Validation,
}

impl MessageTag {
    pub const ALL: [MessageTag; 6] = [
        MessageTag::Whois,
        MessageTag::Iam,
        MessageTag::Transaction,
        MessageTag::TransactionAck,
        MessageTag::Block,
        MessageTag::Validation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageTag::Whois => "WHOIS",
            MessageTag::Iam => "IAM",
            MessageTag::Transaction => "TRANSACTION",
            MessageTag::TransactionAck => "TRANSACTION_ACK",
            MessageTag::Block => "BLOCK",
            MessageTag::Validation => "VALIDATION",
        }
    }

    /// The tag as 16 ASCII bytes, space padded
    pub fn to_wire(&self) -> [u8; TAG_LEN] {
        let mut tag = [b' '; TAG_LEN];
        let name = self.name().as_bytes();
        tag[..name.len()].copy_from_slice(name);
        tag
    }

    pub fn from_wire(tag: &[u8; TAG_LEN]) -> Result<Self, CodecError> {
        MessageTag::ALL
            .into_iter()
            .find(|candidate| &candidate.to_wire() == tag)
            .ok_or_else(|| {
                CodecError::UnknownMessageType(String::from_utf8_lossy(tag).trim_end().to_string())
            })
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport address of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Address of the broadcast group
    pub fn broadcast_group() -> Self {
        Self::new(BROADCAST_HOST, BROADCAST_PORT)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Message body, one variant per tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Name being looked up
    Whois(String),
    /// Public key of the announcing node
    Iam(Vec<u8>),
    Transaction(Transaction),
    TransactionAck(Transaction),
    Block(Block),
    Validation(Block),
}

impl Payload {
    pub fn tag(&self) -> MessageTag {
        match self {
            Payload::Whois(_) => MessageTag::Whois,
            Payload::Iam(_) => MessageTag::Iam,
            Payload::Transaction(_) => MessageTag::Transaction,
            Payload::TransactionAck(_) => MessageTag::TransactionAck,
            Payload::Block(_) => MessageTag::Block,
            Payload::Validation(_) => MessageTag::Validation,
        }
    }

    pub fn decode_as(tag: MessageTag, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = WireReader::new(bytes);
        let payload = match tag {
            MessageTag::Whois => Payload::Whois(reader.get_string()?),
            MessageTag::Iam => Payload::Iam(reader.get_bytes()?),
            MessageTag::Transaction => Payload::Transaction(reader.get_decoded()?),
            MessageTag::TransactionAck => Payload::TransactionAck(reader.get_decoded()?),
            MessageTag::Block => Payload::Block(reader.get_decoded()?),
            MessageTag::Validation => Payload::Validation(reader.get_decoded()?),
        };
        reader.finish()?;
        Ok(payload)
    }
}

impl Encode for Payload {
    fn encode(&self, writer: &mut WireWriter) {
        match self {
            Payload::Whois(name) => writer.put_str(name),
            Payload::Iam(key) => writer.put_bytes(key),
            Payload::Transaction(tx) | Payload::TransactionAck(tx) => writer.put_encoded(tx),
            Payload::Block(block) | Payload::Validation(block) => writer.put_encoded(block),
        }
    }
}

/// A signed envelope around one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub from: String,
    pub to: String,
    pub source: PeerAddress,
    pub destination: PeerAddress,
    /// Signature of `from` over the payload bytes
    pub signature: Vec<u8>,
    pub payload: Payload,
}

impl Frame {
    /// Build a frame and sign its payload
    pub fn signed(
        from: &str,
        to: &str,
        source: PeerAddress,
        destination: PeerAddress,
        payload: Payload,
        signer: &Signer,
    ) -> Result<Self, KeyError> {
        let signature = signer.sign(&payload.to_bytes())?;
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            source,
            destination,
            signature,
            payload,
        })
    }

    pub fn tag(&self) -> MessageTag {
        self.payload.tag()
    }

    /// The bytes the envelope signature covers
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.payload.to_bytes()
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_NAME
    }
}

impl Encode for Frame {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_tag(&self.tag().to_wire());
        writer.put_str(&self.from);
        writer.put_str(&self.to);
        writer.put_str(&self.source.host);
        writer.put_u16(self.source.port);
        writer.put_str(&self.destination.host);
        writer.put_u16(self.destination.port);
        writer.put_bytes(&self.signature);
        writer.put_encoded(&self.payload);
    }
}

impl Decode for Frame {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let tag = MessageTag::from_wire(&reader.get_tag()?)?;
        let from = reader.get_string()?;
        let to = reader.get_string()?;
        let source = PeerAddress {
            host: reader.get_string()?,
            port: reader.get_u16()?,
        };
        let destination = PeerAddress {
            host: reader.get_string()?,
            port: reader.get_u16()?,
        };
        let signature = reader.get_bytes()?;
        let payload = Payload::decode_as(tag, &reader.get_bytes()?)?;

        Ok(Self {
            from,
            to,
            source,
            destination,
            signature,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisConfig;
    use crate::core::Ledger;

    fn frame(payload: Payload, signer: &Signer) -> Frame {
        Frame::signed(
            "n1",
            "n2",
            PeerAddress::new("10.0.0.1", 5001),
            PeerAddress::new("10.0.0.2", 5002),
            payload,
            signer,
        )
        .unwrap()
    }

    fn payloads(signer: &Signer) -> Vec<Payload> {
        let ledger = Ledger::new(&GenesisConfig::default(), 4).unwrap();
        let genesis = ledger.chain()[0].clone();
        let tx = Transaction::leaf("n1", "n2", 3, "memo").signed(signer).unwrap();
        let block = ledger.next_block("n1", tx.clone());

        vec![
            Payload::Whois("n2".to_string()),
            Payload::Iam(signer.public_key_bytes()),
            Payload::Transaction(tx.clone()),
            Payload::TransactionAck(tx),
            Payload::Block(block.clone()),
            Payload::Validation(block),
            Payload::Validation(genesis),
        ]
    }

    #[test]
    fn test_every_message_round_trips() {
        let signer = Signer::generate();
        for payload in payloads(&signer) {
            let frame = frame(payload, &signer);
            let decoded = Frame::from_bytes(&frame.to_bytes()).unwrap();
            assert_eq!(decoded, frame, "tag {}", frame.tag());
        }
    }

    #[test]
    fn test_header_tag_layout() {
        let signer = Signer::generate();
        let bytes = frame(Payload::Whois("n2".to_string()), &signer).to_bytes();
        assert_eq!(&bytes[..TAG_LEN], b"WHOIS           ");
        assert_eq!(
            &MessageTag::TransactionAck.to_wire(),
            b"TRANSACTION_ACK "
        );
    }

    #[test]
    fn test_signature_covers_payload() {
        let signer = Signer::generate();
        let frame = frame(Payload::Whois("n2".to_string()), &signer);
        assert!(signer.verify(&signer.public_key(), &frame.signature, &frame.payload_bytes()));

        let mut forged = frame;
        forged.payload = Payload::Whois("n3".to_string());
        assert!(!signer.verify(&signer.public_key(), &forged.signature, &forged.payload_bytes()));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let signer = Signer::generate();
        let mut bytes = frame(Payload::Whois("n2".to_string()), &signer).to_bytes();
        bytes[..TAG_LEN].copy_from_slice(b"GOSSIP          ");
        assert_eq!(
            Frame::from_bytes(&bytes),
            Err(CodecError::UnknownMessageType("GOSSIP".to_string()))
        );
    }

    #[test]
    fn test_truncated_frames_are_malformed() {
        let signer = Signer::generate();
        for payload in payloads(&signer) {
            let bytes = frame(payload, &signer).to_bytes();
            for cut in [TAG_LEN - 1, TAG_LEN + 3, bytes.len() - 1] {
                assert!(matches!(
                    Frame::from_bytes(&bytes[..cut]),
                    Err(CodecError::MalformedMessage(_))
                ));
            }
        }
    }

    #[test]
    fn test_payload_tag_mismatch_is_malformed() {
        let signer = Signer::generate();
        let mut frame = frame(Payload::Whois("n2".to_string()), &signer);
        frame.payload = Payload::Iam(vec![1, 2, 3]);
        let mut bytes = frame.to_bytes();
        bytes[..TAG_LEN].copy_from_slice(&MessageTag::Block.to_wire());
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(CodecError::MalformedMessage(_))
        ));
    }
}
