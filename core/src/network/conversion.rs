//! Binary conversion between messages and packets
//!
//! # Packet Layout
//!
//! ```text
//!  off  len  field
//!  0     1   dispersy version (0x00)
//!  1     1   community version
//!  2    20   cid
//! 22     1   message id
//! 23    ..   authentication (mid or u16-prefixed public key per signer)
//!  ..   ..   resolution (dynamic: 1 byte policy index)
//!  ..   ..   distribution (8 byte global time [+ 4 byte sequence])
//!  ..   ..   payload
//!  ..   N    signatures (64 bytes per signer)
//! ```
//!
//! Signatures cover every byte in front of the signature slots.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use rusqlite::Connection;

use crate::community::member::{Member, MemberCache};
use crate::message::meta::{FIRST_RESERVED_ID, FORBIDDEN_ID};
use crate::message::{
    DispersyMessage, MemberEncoding, Message, MetaKind, MetaMessage,
    MetaMessageError, Rejection, Resolution, Target,
};
use crate::security::create_key_pair::KeyPair;
use crate::security::digest::{MID_LENGTH, Mid};
use crate::security::sign::{SIGNATURE_LENGTH, sign_bytes};

use super::payload::{decode_payload, encode_payload};
use super::wire::{Reader, WireError, Writer};

/// Dispersy protocol version byte
pub const DISPERSY_VERSION: u8 = 0x00;
/// Length of the prefix in front of the message id
pub const PREFIX_LENGTH: usize = 22;
/// Smallest possible packet: prefix plus message id
pub const MIN_PACKET_LENGTH: usize = PREFIX_LENGTH + 1;

/// Errors when encoding a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// The meta message has no wire id in this conversion
    UnknownMeta(String),
    /// Signer count does not match the authentication policy
    SignerCount { expected: usize, actual: usize },
    /// Sequence-numbered message without a sequence number
    MissingSequenceNumber,
    Wire(WireError),
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionError::UnknownMeta(name) => write!(f, "no wire id for {}", name),
            ConversionError::SignerCount { expected, actual } => {
                write!(f, "expected {} signers, got {}", expected, actual)
            }
            ConversionError::MissingSequenceNumber => write!(f, "missing sequence number"),
            ConversionError::Wire(e) => write!(f, "wire error: {}", e),
        }
    }
}

impl std::error::Error for ConversionError {}

impl From<WireError> for ConversionError {
    fn from(e: WireError) -> Self {
        ConversionError::Wire(e)
    }
}

/// What the decoder may consult while resolving references.
pub struct DecodeContext<'a> {
    pub conn: &'a Connection,
    pub members: &'a mut MemberCache,
    pub community_id: i64,
}

/// Wire mapping of one community version.
#[derive(Debug, Clone)]
pub struct Conversion {
    cid: Mid,
    community_version: u8,
    by_id: HashMap<u8, Arc<MetaMessage>>,
    by_name: HashMap<String, u8>,
}

impl Conversion {
    /// Build a conversion. Dispersy messages get their reserved ids; every
    /// application message must appear in `assignments`.
    pub fn new(
        cid: Mid,
        community_version: u8,
        metas: &[Arc<MetaMessage>],
        assignments: &[(String, u8)],
    ) -> Result<Self, MetaMessageError> {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();

        for meta in metas {
            if let MetaKind::Dispersy(kind) = meta.kind {
                by_id.insert(kind.wire_id(), meta.clone());
                by_name.insert(meta.name.clone(), kind.wire_id());
            }
        }

        for (name, id) in assignments {
            if *id == FORBIDDEN_ID {
                return Err(MetaMessageError::ForbiddenWireId);
            }
            if *id >= FIRST_RESERVED_ID {
                return Err(MetaMessageError::ReservedWireId(*id));
            }
            if by_id.contains_key(id) {
                return Err(MetaMessageError::DuplicateWireId(*id));
            }
            if by_name.contains_key(name) {
                return Err(MetaMessageError::DuplicateName(name.clone()));
            }
            let meta = metas
                .iter()
                .find(|m| &m.name == name && m.kind == MetaKind::Application)
                .ok_or_else(|| MetaMessageError::UnknownName(name.clone()))?;
            by_id.insert(*id, meta.clone());
            by_name.insert(name.clone(), *id);
        }

        Ok(Self {
            cid,
            community_version,
            by_id,
            by_name,
        })
    }

    pub fn community_version(&self) -> u8 {
        self.community_version
    }

    pub fn prefix(&self) -> [u8; PREFIX_LENGTH] {
        let mut prefix = [0u8; PREFIX_LENGTH];
        prefix[0] = DISPERSY_VERSION;
        prefix[1] = self.community_version;
        prefix[2..].copy_from_slice(&self.cid);
        prefix
    }

    pub fn wire_id(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn meta_by_wire_id(&self, id: u8) -> Option<Arc<MetaMessage>> {
        self.by_id.get(&id).cloned()
    }

    /// Encode `message` into its packet, signing the slots whose key is given.
    ///
    /// Slots without a key keep the signature already in `message.signatures`
    /// (zeros for a fresh message). Fills `packet` and `signatures`.
    pub fn encode(&self, message: &mut Message, signers: &[Option<&KeyPair>]) -> Result<(), ConversionError> {
        let meta = &message.meta;
        let wire_id = self
            .wire_id(&meta.name)
            .ok_or_else(|| ConversionError::UnknownMeta(meta.name.clone()))?;
        let count = meta.authentication.signature_count();
        if message.members.len() != count {
            return Err(ConversionError::SignerCount {
                expected: count,
                actual: message.members.len(),
            });
        }

        let mut w = Writer::with_capacity(128);
        w.bytes(&self.prefix()).u8(wire_id);

        if let Some(encoding) = meta.authentication.encoding() {
            for member in &message.members {
                match encoding {
                    MemberEncoding::Sha1 => {
                        w.bytes(&member.mid);
                    }
                    MemberEncoding::Bin => {
                        w.long_bytes(&member.public_key)?;
                    }
                }
            }
        }

        if meta.resolution.is_dynamic() {
            w.u8(message.resolution_index.unwrap_or(0));
        }

        w.u64(message.global_time);
        if meta.distribution.has_sequence_number() {
            w.u32(message.sequence_number.ok_or(ConversionError::MissingSequenceNumber)?);
        }

        encode_payload(&message.payload, self, &mut w)?;

        let mut packet = w.into_bytes();
        let region_len = packet.len();
        let mut signatures = Vec::with_capacity(count);
        for index in 0..count {
            let signature = match signers.get(index).copied().flatten() {
                Some(key_pair) => sign_bytes(&key_pair.private_key, &packet[..region_len]),
                None => message
                    .signatures
                    .get(index)
                    .copied()
                    .unwrap_or([0; SIGNATURE_LENGTH]),
            };
            signatures.push(signature);
        }
        for signature in &signatures {
            packet.extend_from_slice(signature);
        }

        message.packet = packet;
        message.signatures = signatures;
        Ok(())
    }

    /// Decode a received packet.
    pub fn decode(
        &self,
        packet: &[u8],
        source: Option<SocketAddrV4>,
        ctx: &mut DecodeContext<'_>,
    ) -> Result<Message, Rejection> {
        let mut message = self.decode_inner(packet, ctx, false)?;
        message.source = source;
        Ok(message)
    }

    /// Decode a packet carried inside a signature request.
    pub(crate) fn decode_embedded(
        &self,
        packet: &[u8],
        ctx: &mut DecodeContext<'_>,
    ) -> Result<Message, Rejection> {
        self.decode_inner(packet, ctx, true)
    }

    fn decode_inner(
        &self,
        packet: &[u8],
        ctx: &mut DecodeContext<'_>,
        embedded: bool,
    ) -> Result<Message, Rejection> {
        if packet.len() < MIN_PACKET_LENGTH {
            return Err(Rejection::drop("packet too short"));
        }
        if packet[..PREFIX_LENGTH] != self.prefix() {
            return Err(Rejection::drop("prefix mismatch"));
        }
        let meta = self
            .meta_by_wire_id(packet[PREFIX_LENGTH])
            .ok_or_else(|| Rejection::drop(format!("unknown message id {}", packet[PREFIX_LENGTH])))?;
        if embedded && meta.is(DispersyMessage::SignatureRequest) {
            return Err(Rejection::drop("nested signature request"));
        }

        let mut r = Reader::new(packet);
        r.bytes(MIN_PACKET_LENGTH)?;

        // Authentication: candidates per signer slot
        let count = meta.authentication.signature_count();
        let mut candidates: Vec<Vec<Arc<Member>>> = Vec::with_capacity(count);
        if let Some(encoding) = meta.authentication.encoding() {
            for _ in 0..count {
                match encoding {
                    MemberEncoding::Sha1 => {
                        let mid: Mid = r.array::<MID_LENGTH>()?;
                        let members = ctx.members.get_by_mid(ctx.conn, &mid)?;
                        if members.is_empty() {
                            return Err(Rejection::DelayByMissingMember { mid });
                        }
                        candidates.push(members);
                    }
                    MemberEncoding::Bin => {
                        let public_key = r.long_bytes()?;
                        if !MemberCache::is_valid_public_key(public_key) {
                            return Err(Rejection::drop("invalid public key"));
                        }
                        candidates.push(vec![ctx.members.get_or_create(ctx.conn, public_key)?]);
                    }
                }
            }
        }

        let resolution_index = match &meta.resolution {
            Resolution::Dynamic { policies } => {
                let index = r.u8()?;
                if index as usize >= policies.len() {
                    return Err(Rejection::drop("invalid resolution policy index"));
                }
                Some(index)
            }
            _ => None,
        };

        let global_time = r.u64()?;
        if global_time == 0 {
            return Err(Rejection::drop("global time must be positive"));
        }
        let sequence_number = if meta.distribution.has_sequence_number() {
            let sequence = r.u32()?;
            if sequence == 0 {
                return Err(Rejection::drop("sequence number must be positive"));
            }
            Some(sequence)
        } else {
            None
        };

        // Signatures are checked before the payload touches the database
        let suffix = count * SIGNATURE_LENGTH;
        if r.remaining() < suffix {
            return Err(Rejection::drop("packet too short for signatures"));
        }
        let region_len = packet.len() - suffix;
        let region = &packet[..region_len];

        let mut members = Vec::with_capacity(count);
        let mut signatures = Vec::with_capacity(count);
        for (index, slot_candidates) in candidates.into_iter().enumerate() {
            let start = region_len + index * SIGNATURE_LENGTH;
            let signature: [u8; SIGNATURE_LENGTH] = packet[start..start + SIGNATURE_LENGTH]
                .try_into()
                .map_err(|_| Rejection::drop("packet too short for signatures"))?;
            let unsigned = signature == [0; SIGNATURE_LENGTH];

            let signer = slot_candidates
                .iter()
                .find(|member| member.verify(region, &signature))
                .cloned();
            let member = match (signer, unsigned) {
                (Some(member), _) => member,
                (None, true) if count > 1 => slot_candidates[0].clone(),
                _ => return Err(Rejection::drop("Invalid signature")),
            };
            members.push(member);
            signatures.push(signature);
        }
        if count > 1 && signatures.iter().all(|s| *s == [0; SIGNATURE_LENGTH]) {
            return Err(Rejection::drop("Invalid signature"));
        }

        let payload_bytes = &packet[r.offset()..region_len];
        let mut payload_reader = Reader::new(payload_bytes);
        let payload = decode_payload(meta.dispersy_kind(), &mut payload_reader, self, ctx)?;

        Ok(Message {
            meta,
            cid: self.cid,
            community_version: self.community_version,
            members,
            signatures,
            resolution_index,
            global_time,
            sequence_number,
            target: Target::None,
            payload,
            packet: packet.to_vec(),
            packet_id: None,
            source: None,
        })
    }
}

/// Install a signature into slot `index`, updating the packet tail.
pub fn install_signature(message: &mut Message, index: usize, signature: [u8; SIGNATURE_LENGTH]) -> bool {
    let count = message.signatures.len();
    if index >= count {
        return false;
    }
    let start = message.packet.len() - (count - index) * SIGNATURE_LENGTH;
    message.packet[start..start + SIGNATURE_LENGTH].copy_from_slice(&signature);
    message.signatures[index] = signature;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::candidate::ConnectionType;
    use crate::community::timeline::Permission;
    use crate::data::start::start_memory_db;
    use crate::message::{Authentication, Destination, Direction, Distribution};
    use crate::network::bloom::BloomFilter;
    use crate::network::encoding::Value;
    use crate::network::payload::{
        IntroductionRequestPayload, Payload, PermissionTriple, SyncRequest,
    };
    use crate::network::wire::no_address;
    use crate::security::create_key_pair::generate_key_pair;
    use std::net::Ipv4Addr;

    struct Fixture {
        conn: Connection,
        members: MemberCache,
        conversion: Conversion,
    }

    impl Fixture {
        fn decode(&mut self, packet: &[u8], source: Option<SocketAddrV4>) -> Result<Message, Rejection> {
            let mut ctx = DecodeContext {
                conn: &self.conn,
                members: &mut self.members,
                community_id: 1,
            };
            self.conversion.decode(packet, source, &mut ctx)
        }

        fn meta(&self, name: &str) -> Arc<MetaMessage> {
            self.conversion
                .meta_by_wire_id(self.conversion.wire_id(name).unwrap())
                .unwrap()
        }
    }

    fn metas() -> Vec<Arc<MetaMessage>> {
        let mut metas: Vec<Arc<MetaMessage>> = DispersyMessage::ALL
            .iter()
            .map(|kind| Arc::new(kind.meta()))
            .collect();
        metas.push(Arc::new(
            MetaMessage::new(
                "text",
                Authentication::Member {
                    encoding: MemberEncoding::Sha1,
                },
                Resolution::Dynamic {
                    policies: vec![Resolution::Public, Resolution::Linear],
                },
                Distribution::FullSync {
                    enable_sequence_number: true,
                    direction: Direction::Asc,
                },
                Destination::Community { node_count: 5 },
            )
            .unwrap(),
        ));
        metas.push(Arc::new(
            MetaMessage::new(
                "record",
                Authentication::MultiMember {
                    count: 2,
                    encoding: MemberEncoding::Bin,
                },
                Resolution::Public,
                Distribution::FullSync {
                    enable_sequence_number: false,
                    direction: Direction::Asc,
                },
                Destination::Community { node_count: 5 },
            )
            .unwrap(),
        ));
        metas
    }

    fn fixture() -> Fixture {
        let conversion = Conversion::new(
            [7; 20],
            1,
            &metas(),
            &[("text".to_string(), 1), ("record".to_string(), 2)],
        )
        .unwrap();
        Fixture {
            conn: start_memory_db().unwrap(),
            members: MemberCache::new(),
            conversion,
        }
    }

    fn draft(meta: Arc<MetaMessage>, members: Vec<Arc<Member>>, payload: Payload) -> Message {
        Message {
            meta,
            cid: [7; 20],
            community_version: 1,
            members,
            signatures: Vec::new(),
            resolution_index: None,
            global_time: 42,
            sequence_number: None,
            target: Target::None,
            payload,
            packet: Vec::new(),
            packet_id: None,
            source: None,
        }
    }

    #[test]
    fn test_reserved_ids_enforced() {
        let metas = metas();
        assert_eq!(
            Conversion::new([0; 20], 1, &metas, &[("text".to_string(), 240)]).unwrap_err(),
            MetaMessageError::ReservedWireId(240)
        );
        assert_eq!(
            Conversion::new([0; 20], 1, &metas, &[("text".to_string(), 255)]).unwrap_err(),
            MetaMessageError::ForbiddenWireId
        );
        assert_eq!(
            Conversion::new(
                [0; 20],
                1,
                &metas,
                &[("text".to_string(), 1), ("record".to_string(), 1)]
            )
            .unwrap_err(),
            MetaMessageError::DuplicateWireId(1)
        );
        assert_eq!(
            Conversion::new([0; 20], 1, &metas, &[("nope".to_string(), 3)]).unwrap_err(),
            MetaMessageError::UnknownName("nope".to_string())
        );
    }

    #[test]
    fn test_application_round_trip_and_layout() {
        let mut f = fixture();
        let key_pair = generate_key_pair();
        let me = f.members.register_key_pair(&f.conn, &key_pair).unwrap();

        let mut message = draft(
            f.meta("text"),
            vec![me.member.clone()],
            Payload::Application(Value::from("hello")),
        );
        message.resolution_index = Some(1);
        message.sequence_number = Some(3);
        f.conversion.encode(&mut message, &[Some(&key_pair)]).unwrap();

        let packet = message.packet.clone();
        assert_eq!(packet[0], DISPERSY_VERSION);
        assert_eq!(packet[1], 1);
        assert_eq!(&packet[2..22], &[7; 20]);
        assert_eq!(packet[22], 1);
        assert_eq!(&packet[23..43], &me.member.mid);
        assert_eq!(packet[43], 1);
        assert_eq!(&packet[44..52], &42u64.to_be_bytes());
        assert_eq!(&packet[52..56], &3u32.to_be_bytes());

        let source = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5);
        let decoded = f.decode(&packet, Some(source)).unwrap();
        assert!(decoded.is_signed());
        assert_eq!(decoded.source, Some(source));
        assert_eq!(decoded.resolution_index, Some(1));
        assert_eq!(decoded.sequence_number, Some(3));
        assert_eq!(decoded.payload, Payload::Application(Value::from("hello")));
        assert_eq!(decoded.members[0].public_key, key_pair.public_key.to_vec());
    }

    #[test]
    fn test_unknown_mid_delays() {
        let mut f = fixture();
        let key_pair = generate_key_pair();
        let me = f.members.register_key_pair(&f.conn, &key_pair).unwrap();
        let mut message = draft(
            f.meta("text"),
            vec![me.member.clone()],
            Payload::Application(Value::None),
        );
        message.sequence_number = Some(1);
        f.conversion.encode(&mut message, &[Some(&key_pair)]).unwrap();

        // A peer that never saw the public key cannot resolve the mid
        let mut other = fixture();
        assert_eq!(
            other.decode(&message.packet, None).unwrap_err(),
            Rejection::DelayByMissingMember { mid: me.member.mid }
        );
    }

    #[test]
    fn test_tampered_packet_dropped() {
        let mut f = fixture();
        let key_pair = generate_key_pair();
        let me = f.members.register_key_pair(&f.conn, &key_pair).unwrap();
        let mut message = draft(
            f.meta("dispersy-identity"),
            vec![me.member.clone()],
            Payload::Identity,
        );
        f.conversion.encode(&mut message, &[Some(&key_pair)]).unwrap();

        let mut packet = message.packet.clone();
        let last_field = packet.len() - SIGNATURE_LENGTH - 1;
        packet[last_field] ^= 0xff;
        assert_eq!(
            f.decode(&packet, None).unwrap_err(),
            Rejection::drop("Invalid signature")
        );
    }

    #[test]
    fn test_multi_member_partial_signatures() {
        let mut f = fixture();
        let a = generate_key_pair();
        let b = generate_key_pair();
        let ma = f.members.register_key_pair(&f.conn, &a).unwrap();
        let mb = f.members.get_or_create(&f.conn, &b.public_key).unwrap();

        let mut message = draft(
            f.meta("record"),
            vec![ma.member.clone(), mb.clone()],
            Payload::Application(Value::Int(5)),
        );
        f.conversion.encode(&mut message, &[Some(&a), None]).unwrap();

        let decoded = f.decode(&message.packet, None).unwrap();
        assert!(decoded.is_slot_signed(0));
        assert!(!decoded.is_slot_signed(1));
        assert!(!decoded.is_signed());

        // Second signer fills its slot over the same region
        let signature = sign_bytes(&b.private_key, decoded.signed_region());
        let mut completed = decoded.clone();
        assert!(install_signature(&mut completed, 1, signature));
        let decoded = f.decode(&completed.packet, None).unwrap();
        assert!(decoded.is_signed());

        // A garbage signature in the second slot is rejected
        let mut garbage = completed.clone();
        install_signature(&mut garbage, 1, [1; SIGNATURE_LENGTH]);
        assert!(f.decode(&garbage.packet, None).is_err());
    }

    #[test]
    fn test_authorize_and_introduction_payloads() {
        let mut f = fixture();
        let key_pair = generate_key_pair();
        let me = f.members.register_key_pair(&f.conn, &key_pair).unwrap();
        let other = f.members.get_or_create(&f.conn, &[9; 32]).unwrap();

        let mut authorize = draft(
            f.meta("dispersy-authorize"),
            vec![me.member.clone()],
            Payload::Authorize {
                permissions: vec![
                    PermissionTriple {
                        member: other.clone(),
                        meta: f.meta("text"),
                        permission: Permission::Permit,
                    },
                    PermissionTriple {
                        member: other.clone(),
                        meta: f.meta("text"),
                        permission: Permission::Undo,
                    },
                ],
            },
        );
        f.conversion.encode(&mut authorize, &[Some(&key_pair)]).unwrap();
        let decoded = f.decode(&authorize.packet, None).unwrap();
        assert_eq!(decoded.payload, authorize.payload);

        let mut bloom = BloomFilter::new(64, 2, vec![3]).unwrap();
        bloom.add(b"x");
        let address = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1000);
        let mut request = draft(
            f.meta("dispersy-introduction-request"),
            vec![me.member.clone()],
            Payload::IntroductionRequest(IntroductionRequestPayload {
                destination_address: address,
                source_lan_address: address,
                source_wan_address: no_address(),
                advice: true,
                connection_type: ConnectionType::SymmetricNat,
                tunnel: false,
                sync: Some(SyncRequest {
                    time_low: 1,
                    time_high: 0,
                    bloom,
                }),
                identifier: 77,
            }),
        );
        f.conversion.encode(&mut request, &[Some(&key_pair)]).unwrap();
        let decoded = f.decode(&request.packet, None).unwrap();
        assert_eq!(decoded.payload, request.payload);
    }

    #[test]
    fn test_malformed_packets() {
        let mut f = fixture();
        let mut packet = f.conversion.prefix().to_vec();
        assert_eq!(
            f.decode(&packet, None).unwrap_err(),
            Rejection::drop("packet too short")
        );

        packet.push(FORBIDDEN_ID);
        assert_eq!(
            f.decode(&packet, None).unwrap_err(),
            Rejection::drop("unknown message id 255")
        );

        // Missing-identity with a truncated mid
        let mut truncated = f.conversion.prefix().to_vec();
        truncated.push(DispersyMessage::MissingIdentity.wire_id());
        truncated.extend_from_slice(&1u64.to_be_bytes());
        truncated.extend_from_slice(&[0; 10]);
        assert!(matches!(
            f.decode(&truncated, None),
            Err(Rejection::Drop(_))
        ));
    }
}
