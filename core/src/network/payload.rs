//! Payloads of the built-in Dispersy messages and their byte layouts
//!
//! Member references carry the length-prefixed public key, except
//! `dispersy-missing-identity` and `dispersy-missing-sequence` which carry
//! the 20-byte mid. Application payloads use the self-describing encoding.

use std::net::SocketAddrV4;
use std::sync::Arc;

use crate::community::candidate::ConnectionType;
use crate::community::member::{Member, MemberCache};
use crate::community::timeline::Permission;
use crate::data::sync::StoredPacket;
use crate::message::{DispersyMessage, Message, MetaMessage, Rejection};
use crate::security::digest::Mid;
use crate::security::sign::SIGNATURE_LENGTH;

use super::bloom::BloomFilter;
use super::conversion::{Conversion, ConversionError, DecodeContext};
use super::encoding::{self, Value};
use super::wire::{Reader, Writer};

const FLAG_ADVICE: u8 = 0b0000_0001;
const FLAG_SYNC: u8 = 0b0000_0010;
const FLAG_TUNNEL: u8 = 0b0000_0100;
const CONNECTION_TYPE_SHIFT: u8 = 3;
const CONNECTION_TYPE_MASK: u8 = 0b0001_1000;

/// Bloom filter window carried by an introduction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub time_low: u64,
    /// 0 means "and anything newer"
    pub time_high: u64,
    pub bloom: BloomFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionRequestPayload {
    /// The receiver's address as seen by the sender
    pub destination_address: SocketAddrV4,
    pub source_lan_address: SocketAddrV4,
    pub source_wan_address: SocketAddrV4,
    pub advice: bool,
    pub connection_type: ConnectionType,
    pub tunnel: bool,
    pub sync: Option<SyncRequest>,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionResponsePayload {
    /// The receiver's address as seen by the sender
    pub destination_address: SocketAddrV4,
    pub source_lan_address: SocketAddrV4,
    pub source_wan_address: SocketAddrV4,
    /// Unspecified when nobody was introduced
    pub lan_introduction_address: SocketAddrV4,
    pub wan_introduction_address: SocketAddrV4,
    pub connection_type: ConnectionType,
    pub tunnel: bool,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunctureRequestPayload {
    pub lan_walker_address: SocketAddrV4,
    pub wan_walker_address: SocketAddrV4,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuncturePayload {
    pub source_lan_address: SocketAddrV4,
    pub source_wan_address: SocketAddrV4,
    pub identifier: u16,
}

/// One `(member, meta, permission)` grant or revocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionTriple {
    pub member: Arc<Member>,
    pub meta: Arc<MetaMessage>,
    pub permission: Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyDegree {
    /// Freeze at the destroy message's global time
    SoftKill,
    /// Keep only the destroy message and its authorization chain
    HardKill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoPayload {
    pub member: Arc<Member>,
    pub global_time: u64,
    /// The undone packet, resolved while decoding
    pub packet: Option<StoredPacket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSequencePayload {
    pub mid: Mid,
    pub meta: Arc<MetaMessage>,
    pub missing_low: u32,
    pub missing_high: u32,
}

/// Payload of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Identity,
    MissingIdentity { mid: Mid },
    MissingSequence(MissingSequencePayload),
    MissingMessage { member: Arc<Member>, global_times: Vec<u64> },
    MissingProof { member: Arc<Member>, global_time: u64 },
    MissingLastMessage { member: Arc<Member>, meta: Arc<MetaMessage>, count: u8 },
    MissingSubjectiveSet { cluster: u8, members: Vec<Arc<Member>> },
    SignatureRequest { identifier: u16, message: Box<Message> },
    SignatureResponse { identifier: u16, signature: [u8; SIGNATURE_LENGTH] },
    PunctureRequest(PunctureRequestPayload),
    Puncture(PuncturePayload),
    IntroductionRequest(IntroductionRequestPayload),
    IntroductionResponse(IntroductionResponsePayload),
    DestroyCommunity { degree: DestroyDegree },
    Authorize { permissions: Vec<PermissionTriple> },
    Revoke { permissions: Vec<PermissionTriple> },
    SubjectiveSet { cluster: u8, filter: BloomFilter },
    UndoOwn(UndoPayload),
    UndoOther(UndoPayload),
    DynamicSettings { policies: Vec<(Arc<MetaMessage>, u8)> },
    Application(Value),
}

impl Payload {
    /// The built-in message this payload belongs to, `None` for application payloads.
    pub fn kind(&self) -> Option<DispersyMessage> {
        use DispersyMessage as D;
        Some(match self {
            Payload::Identity => D::Identity,
            Payload::MissingIdentity { .. } => D::MissingIdentity,
            Payload::MissingSequence(_) => D::MissingSequence,
            Payload::MissingMessage { .. } => D::MissingMessage,
            Payload::MissingProof { .. } => D::MissingProof,
            Payload::MissingLastMessage { .. } => D::MissingLastMessage,
            Payload::MissingSubjectiveSet { .. } => D::MissingSubjectiveSet,
            Payload::SignatureRequest { .. } => D::SignatureRequest,
            Payload::SignatureResponse { .. } => D::SignatureResponse,
            Payload::PunctureRequest(_) => D::PunctureRequest,
            Payload::Puncture(_) => D::Puncture,
            Payload::IntroductionRequest(_) => D::IntroductionRequest,
            Payload::IntroductionResponse(_) => D::IntroductionResponse,
            Payload::DestroyCommunity { .. } => D::DestroyCommunity,
            Payload::Authorize { .. } => D::Authorize,
            Payload::Revoke { .. } => D::Revoke,
            Payload::SubjectiveSet { .. } => D::SubjectiveSet,
            Payload::UndoOwn(_) => D::UndoOwn,
            Payload::UndoOther(_) => D::UndoOther,
            Payload::DynamicSettings { .. } => D::DynamicSettings,
            Payload::Application(_) => return None,
        })
    }

    pub fn as_application(&self) -> Option<&Value> {
        match self {
            Payload::Application(value) => Some(value),
            _ => None,
        }
    }
}

fn write_member(w: &mut Writer, member: &Member) -> Result<(), ConversionError> {
    w.long_bytes(&member.public_key)?;
    Ok(())
}

fn write_meta(w: &mut Writer, conversion: &Conversion, meta: &MetaMessage) -> Result<(), ConversionError> {
    let id = conversion
        .wire_id(&meta.name)
        .ok_or_else(|| ConversionError::UnknownMeta(meta.name.clone()))?;
    w.u8(id);
    Ok(())
}

fn flags(advice: bool, sync: bool, tunnel: bool, connection_type: ConnectionType) -> u8 {
    let mut flags = 0;
    if advice {
        flags |= FLAG_ADVICE;
    }
    if sync {
        flags |= FLAG_SYNC;
    }
    if tunnel {
        flags |= FLAG_TUNNEL;
    }
    flags | (connection_type.to_bits() << CONNECTION_TYPE_SHIFT)
}

/// Encode a payload after the distribution fields.
pub fn encode_payload(payload: &Payload, conversion: &Conversion, w: &mut Writer) -> Result<(), ConversionError> {
    match payload {
        Payload::Identity => {}
        Payload::MissingIdentity { mid } => {
            w.bytes(mid);
        }
        Payload::MissingSequence(p) => {
            w.bytes(&p.mid);
            write_meta(w, conversion, &p.meta)?;
            w.u32(p.missing_low).u32(p.missing_high);
        }
        Payload::MissingMessage { member, global_times } => {
            write_member(w, member)?;
            for global_time in global_times {
                w.u64(*global_time);
            }
        }
        Payload::MissingProof { member, global_time } => {
            write_member(w, member)?;
            w.u64(*global_time);
        }
        Payload::MissingLastMessage { member, meta, count } => {
            write_member(w, member)?;
            write_meta(w, conversion, meta)?;
            w.u8(*count);
        }
        Payload::MissingSubjectiveSet { cluster, members } => {
            w.u8(*cluster);
            for member in members {
                write_member(w, member)?;
            }
        }
        Payload::SignatureRequest { identifier, message } => {
            w.u16(*identifier).bytes(&message.packet);
        }
        Payload::SignatureResponse { identifier, signature } => {
            w.u16(*identifier).bytes(signature);
        }
        Payload::PunctureRequest(p) => {
            w.address(&p.lan_walker_address)
                .address(&p.wan_walker_address)
                .u16(p.identifier);
        }
        Payload::Puncture(p) => {
            w.address(&p.source_lan_address)
                .address(&p.source_wan_address)
                .u16(p.identifier);
        }
        Payload::IntroductionRequest(p) => {
            w.address(&p.destination_address)
                .address(&p.source_lan_address)
                .address(&p.source_wan_address)
                .u8(flags(p.advice, p.sync.is_some(), p.tunnel, p.connection_type))
                .u16(p.identifier);
            if let Some(sync) = &p.sync {
                w.u64(sync.time_low).u64(sync.time_high);
                sync.bloom.encode(w);
            }
        }
        Payload::IntroductionResponse(p) => {
            w.address(&p.destination_address)
                .address(&p.source_lan_address)
                .address(&p.source_wan_address)
                .address(&p.lan_introduction_address)
                .address(&p.wan_introduction_address)
                .u8(flags(false, false, p.tunnel, p.connection_type))
                .u16(p.identifier);
        }
        Payload::DestroyCommunity { degree } => {
            w.u8(match degree {
                DestroyDegree::SoftKill => 0,
                DestroyDegree::HardKill => 1,
            });
        }
        Payload::Authorize { permissions } | Payload::Revoke { permissions } => {
            for triple in permissions {
                write_member(w, &triple.member)?;
                write_meta(w, conversion, &triple.meta)?;
                w.u8(triple.permission.bit());
            }
        }
        Payload::SubjectiveSet { cluster, filter } => {
            w.u8(*cluster);
            filter.encode(w);
        }
        Payload::UndoOwn(p) | Payload::UndoOther(p) => {
            write_member(w, &p.member)?;
            w.u64(p.global_time);
        }
        Payload::DynamicSettings { policies } => {
            for (meta, index) in policies {
                write_meta(w, conversion, meta)?;
                w.u8(*index);
            }
        }
        Payload::Application(value) => {
            w.bytes(&encoding::encode(value));
        }
    }
    Ok(())
}

fn read_member(r: &mut Reader<'_>, ctx: &mut DecodeContext<'_>) -> Result<Arc<Member>, Rejection> {
    let public_key = r.long_bytes()?;
    if !MemberCache::is_valid_public_key(public_key) {
        return Err(Rejection::drop("invalid public key in payload"));
    }
    Ok(ctx.members.get_or_create(ctx.conn, public_key)?)
}

fn read_meta(r: &mut Reader<'_>, conversion: &Conversion) -> Result<Arc<MetaMessage>, Rejection> {
    let id = r.u8()?;
    conversion
        .meta_by_wire_id(id)
        .ok_or_else(|| Rejection::drop(format!("unknown message id {} in payload", id)))
}

fn read_flags(flags: u8) -> Result<(bool, bool, bool, ConnectionType), Rejection> {
    if flags & !(FLAG_ADVICE | FLAG_SYNC | FLAG_TUNNEL | CONNECTION_TYPE_MASK) != 0 {
        return Err(Rejection::drop("reserved flag bits set"));
    }
    let connection_type = ConnectionType::from_bits((flags & CONNECTION_TYPE_MASK) >> CONNECTION_TYPE_SHIFT)
        .ok_or_else(|| Rejection::drop("invalid connection type"))?;
    Ok((
        flags & FLAG_ADVICE != 0,
        flags & FLAG_SYNC != 0,
        flags & FLAG_TUNNEL != 0,
        connection_type,
    ))
}

fn read_undo(r: &mut Reader<'_>, ctx: &mut DecodeContext<'_>) -> Result<UndoPayload, Rejection> {
    let member = read_member(r, ctx)?;
    let global_time = r.u64()?;
    let packet = crate::data::sync::get_packet_at(ctx.conn, ctx.community_id, member.database_id, global_time)?;
    if packet.is_none() {
        return Err(Rejection::DelayByMissingMessage {
            member,
            global_times: vec![global_time],
        });
    }
    Ok(UndoPayload {
        member,
        global_time,
        packet,
    })
}

/// Decode the payload of `kind` from `r`, which holds exactly the payload bytes.
pub fn decode_payload(
    kind: Option<DispersyMessage>,
    r: &mut Reader<'_>,
    conversion: &Conversion,
    ctx: &mut DecodeContext<'_>,
) -> Result<Payload, Rejection> {
    use DispersyMessage as D;

    let Some(kind) = kind else {
        let value = encoding::decode(r.rest())?;
        return Ok(Payload::Application(value));
    };

    let payload = match kind {
        D::Identity => Payload::Identity,
        D::MissingIdentity => Payload::MissingIdentity { mid: r.array()? },
        D::MissingSequence => {
            let mid = r.array()?;
            let meta = read_meta(r, conversion)?;
            let missing_low = r.u32()?;
            let missing_high = r.u32()?;
            if missing_low == 0 || missing_low > missing_high {
                return Err(Rejection::drop("invalid missing sequence range"));
            }
            Payload::MissingSequence(MissingSequencePayload {
                mid,
                meta,
                missing_low,
                missing_high,
            })
        }
        D::MissingMessage => {
            let member = read_member(r, ctx)?;
            if r.is_empty() || r.remaining() % 8 != 0 {
                return Err(Rejection::drop("invalid missing message global times"));
            }
            let mut global_times = Vec::with_capacity(r.remaining() / 8);
            while !r.is_empty() {
                global_times.push(r.u64()?);
            }
            Payload::MissingMessage {
                member,
                global_times,
            }
        }
        D::MissingProof => Payload::MissingProof {
            member: read_member(r, ctx)?,
            global_time: r.u64()?,
        },
        D::MissingLastMessage => Payload::MissingLastMessage {
            member: read_member(r, ctx)?,
            meta: read_meta(r, conversion)?,
            count: r.u8()?,
        },
        D::MissingSubjectiveSet => {
            let cluster = r.u8()?;
            let mut members = Vec::new();
            while !r.is_empty() {
                members.push(read_member(r, ctx)?);
            }
            if members.is_empty() {
                return Err(Rejection::drop("missing subjective set names no members"));
            }
            Payload::MissingSubjectiveSet { cluster, members }
        }
        D::SignatureRequest => {
            let identifier = r.u16()?;
            let embedded = r.rest();
            let message = conversion.decode_embedded(embedded, ctx)?;
            if message.signatures.len() < 2 {
                return Err(Rejection::drop("signature request for a single-signer message"));
            }
            Payload::SignatureRequest {
                identifier,
                message: Box::new(message),
            }
        }
        D::SignatureResponse => Payload::SignatureResponse {
            identifier: r.u16()?,
            signature: r.array()?,
        },
        D::PunctureRequest => Payload::PunctureRequest(PunctureRequestPayload {
            lan_walker_address: r.address()?,
            wan_walker_address: r.address()?,
            identifier: r.u16()?,
        }),
        D::Puncture => Payload::Puncture(PuncturePayload {
            source_lan_address: r.address()?,
            source_wan_address: r.address()?,
            identifier: r.u16()?,
        }),
        D::IntroductionRequest => {
            let destination_address = r.address()?;
            let source_lan_address = r.address()?;
            let source_wan_address = r.address()?;
            let (advice, has_sync, tunnel, connection_type) = read_flags(r.u8()?)?;
            let identifier = r.u16()?;
            let sync = if has_sync {
                let time_low = r.u64()?;
                let time_high = r.u64()?;
                if time_low == 0 || (time_high != 0 && time_high < time_low) {
                    return Err(Rejection::drop("invalid sync range"));
                }
                Some(SyncRequest {
                    time_low,
                    time_high,
                    bloom: BloomFilter::decode(r)?,
                })
            } else {
                None
            };
            Payload::IntroductionRequest(IntroductionRequestPayload {
                destination_address,
                source_lan_address,
                source_wan_address,
                advice,
                connection_type,
                tunnel,
                sync,
                identifier,
            })
        }
        D::IntroductionResponse => {
            let destination_address = r.address()?;
            let source_lan_address = r.address()?;
            let source_wan_address = r.address()?;
            let lan_introduction_address = r.address()?;
            let wan_introduction_address = r.address()?;
            let (_, _, tunnel, connection_type) = read_flags(r.u8()?)?;
            Payload::IntroductionResponse(IntroductionResponsePayload {
                destination_address,
                source_lan_address,
                source_wan_address,
                lan_introduction_address,
                wan_introduction_address,
                connection_type,
                tunnel,
                identifier: r.u16()?,
            })
        }
        D::DestroyCommunity => Payload::DestroyCommunity {
            degree: match r.u8()? {
                0 => DestroyDegree::SoftKill,
                1 => DestroyDegree::HardKill,
                _ => return Err(Rejection::drop("invalid destroy degree")),
            },
        },
        D::Authorize | D::Revoke => {
            let mut permissions = Vec::new();
            while !r.is_empty() {
                let member = read_member(r, ctx)?;
                let meta = read_meta(r, conversion)?;
                let bits = r.u8()?;
                let granted = Permission::from_bits(bits);
                if granted.is_empty() || bits & !Permission::ALL_BITS != 0 {
                    return Err(Rejection::drop("invalid permission bitmap"));
                }
                for permission in granted {
                    permissions.push(PermissionTriple {
                        member: member.clone(),
                        meta: meta.clone(),
                        permission,
                    });
                }
            }
            if permissions.is_empty() {
                return Err(Rejection::drop("empty permission list"));
            }
            if kind == D::Authorize {
                Payload::Authorize { permissions }
            } else {
                Payload::Revoke { permissions }
            }
        }
        D::SubjectiveSet => Payload::SubjectiveSet {
            cluster: r.u8()?,
            filter: BloomFilter::decode(r)?,
        },
        D::UndoOwn => Payload::UndoOwn(read_undo(r, ctx)?),
        D::UndoOther => Payload::UndoOther(read_undo(r, ctx)?),
        D::DynamicSettings => {
            let mut policies = Vec::new();
            while !r.is_empty() {
                let meta = read_meta(r, conversion)?;
                let index = r.u8()?;
                match meta.resolution.resolve(Some(index)) {
                    Some(_) if meta.resolution.is_dynamic() => policies.push((meta, index)),
                    _ => return Err(Rejection::drop("invalid dynamic resolution index")),
                }
            }
            if policies.is_empty() {
                return Err(Rejection::drop("empty dynamic settings"));
            }
            Payload::DynamicSettings { policies }
        }
    };

    r.finish()?;
    Ok(payload)
}
