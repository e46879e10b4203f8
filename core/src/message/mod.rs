//! Message meta-model
//!
//! A `MetaMessage` composes one authentication, resolution, distribution and
//! destination policy. A `Message` is a concrete instance: decoded from a
//! packet or built locally before encoding.
//!
//! Processing outcomes are values, not exceptions: decoding yields
//! `Result<Message, Rejection>` and policy checks yield a `Verdict`.

pub mod meta;
pub mod policy;

use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::community::member::Member;
use crate::network::bloom::BloomError;
use crate::network::encoding::EncodingError;
use crate::network::payload::Payload;
use crate::network::wire::WireError;
use crate::security::digest::Mid;
use crate::security::sign::SIGNATURE_LENGTH;

pub use meta::{DispersyMessage, MetaKind, MetaMessage, MetaMessageError};
pub use policy::{Authentication, Destination, Direction, Distribution, MemberEncoding, Resolution};

/// Where an outgoing message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Received messages carry no target
    None,
    Addresses(Vec<SocketAddrV4>),
    Members(Vec<Arc<Member>>),
    /// Random candidates, per the meta's destination policy
    Community,
}

/// A concrete message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub meta: Arc<MetaMessage>,
    pub cid: Mid,
    pub community_version: u8,
    /// Signers in order; empty for no-authentication
    pub members: Vec<Arc<Member>>,
    /// One slot per signer, all zeros when unsigned
    pub signatures: Vec<[u8; SIGNATURE_LENGTH]>,
    /// Index into the dynamic resolution policies
    pub resolution_index: Option<u8>,
    pub global_time: u64,
    pub sequence_number: Option<u32>,
    pub target: Target,
    pub payload: Payload,
    pub packet: Vec<u8>,
    /// Assigned when stored
    pub packet_id: Option<i64>,
    /// Address the packet arrived from
    pub source: Option<SocketAddrV4>,
}

impl Message {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// The first (or only) signer.
    pub fn member(&self) -> Option<&Arc<Member>> {
        self.members.first()
    }

    /// Packet bytes covered by the signatures.
    pub fn signed_region(&self) -> &[u8] {
        let suffix = self.signatures.len() * SIGNATURE_LENGTH;
        &self.packet[..self.packet.len().saturating_sub(suffix)]
    }

    /// Whether signature slot `index` holds a valid signature.
    pub fn is_slot_signed(&self, index: usize) -> bool {
        match (self.members.get(index), self.signatures.get(index)) {
            (Some(member), Some(signature)) => member.verify(self.signed_region(), signature),
            _ => false,
        }
    }

    /// True only when every signature slot is valid.
    pub fn is_signed(&self) -> bool {
        (0..self.members.len()).all(|i| self.is_slot_signed(i))
    }
}

/// Why a packet was not turned into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Malformed or invalid bytes; discard silently
    Drop(String),
    /// A referenced member is unknown; ask for its identity and retry
    DelayByMissingMember { mid: Mid },
    /// A referenced message is unknown; ask for it and retry
    DelayByMissingMessage {
        member: Arc<Member>,
        global_times: Vec<u64>,
    },
}

impl Rejection {
    pub fn drop(reason: impl Into<String>) -> Self {
        Rejection::Drop(reason.into())
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Drop(reason) => write!(f, "drop: {}", reason),
            Rejection::DelayByMissingMember { mid } => {
                write!(f, "delay: missing member {}", hex::encode(mid))
            }
            Rejection::DelayByMissingMessage { member, global_times } => write!(
                f,
                "delay: missing messages {:?} of member {}",
                global_times,
                hex::encode(member.mid)
            ),
        }
    }
}

impl From<WireError> for Rejection {
    fn from(e: WireError) -> Self {
        Rejection::Drop(e.to_string())
    }
}

impl From<BloomError> for Rejection {
    fn from(e: BloomError) -> Self {
        Rejection::Drop(e.to_string())
    }
}

impl From<EncodingError> for Rejection {
    fn from(e: EncodingError) -> Self {
        Rejection::Drop(e.to_string())
    }
}

impl From<rusqlite::Error> for Rejection {
    fn from(e: rusqlite::Error) -> Self {
        Rejection::Drop(format!("database error: {}", e))
    }
}

/// Outcome of the runtime and community policy checks on a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Duplicate, superseded or otherwise unwanted
    Drop(String),
    /// Dropped, and the packets proving why go back to the source
    DropByProof { reason: String, proof: Vec<Vec<u8>> },
    /// Waiting for the sequence numbers in `[missing_low, missing_high]`
    DelayBySequence { missing_low: u32, missing_high: u32 },
    /// Waiting for the permission proof of the author
    DelayByProof,
    /// Waiting for the author's subjective set
    DelayBySubjectiveSet { member: Arc<Member>, cluster: u8 },
}

impl Verdict {
    pub fn drop(reason: impl Into<String>) -> Self {
        Verdict::Drop(reason.into())
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}
