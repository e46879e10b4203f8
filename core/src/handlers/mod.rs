//! Packet handlers
//!
//! Every received datagram goes through the same pipeline:
//! - decode with the conversion matching its prefix
//! - check it against the store, the timeline and the community
//! - store it, update community state and run its handler
//! - release whatever waited for it
//!
//! Messages we create ourselves enter at `accept`.
//! - `footprint`: continuations waiting for a message
//! - `signature`: multi-member signature requests
//! - `introduction`, `puncture`: the walker's side of the wire
//! - `missing`: answers to `dispersy-missing-*` requests
//! - `permission`, `undo`, `destroy`, `subjective`: state-changing messages

pub(crate) mod destroy;
pub mod footprint;
pub(crate) mod introduction;
pub(crate) mod missing;
pub(crate) mod permission;
pub(crate) mod puncture;
pub(crate) mod signature;
pub(crate) mod subjective;
pub(crate) mod undo;

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::community::Community;
use crate::community::member::Member;
use crate::data::sync::{
    NewPacket, delete_packet, get_last_sync_history, get_packet_at, highest_sequence, insert_packet,
};
use crate::message::{Destination, DispersyMessage, Distribution, Message, Rejection, Target, Verdict};
use crate::network::conversion::{DecodeContext, MIN_PACKET_LENGTH, PREFIX_LENGTH};
use crate::network::payload::{DestroyDegree, MissingSequencePayload, Payload};
use crate::protocol::core::{Dispersy, Runtime};
use crate::protocol::create::build_dispersy_message;
use crate::protocol::error::DispersyError;
use crate::resilience::RateLimitResult;
use crate::security::digest::Mid;

use footprint::{Continuation, Footprint};

/// Run one datagram through the pipeline. Never fails; problems are logged.
pub(crate) fn dispatch(d: &mut Dispersy, source: SocketAddrV4, packet: &[u8], now: Instant) {
    if let RateLimitResult::Limited { retry_after } = d.rt.rate_limiter.check(&source, now) {
        d.rt.stats.packets.rate_limited += 1;
        trace!(%source, retry_after_secs = retry_after.as_secs(), "source rate limited");
        return;
    }
    d.rt.stats.packets.received += 1;

    if packet.len() < MIN_PACKET_LENGTH {
        reject(&mut d.rt, source, "packet too short", now);
        return;
    }
    let mut cid: Mid = [0; 20];
    cid.copy_from_slice(&packet[2..PREFIX_LENGTH]);
    if !d.communities.contains_key(&cid) {
        debug!(%source, community = %hex::encode(cid), "packet for unknown community");
        d.rt.stats.packets.dropped += 1;
        return;
    }
    let Ok((rt, community)) = d.split(&cid) else {
        return;
    };
    if community.is_hard_killed() {
        trace!(%source, community = %hex::encode(cid), "community destroyed, ignoring packet");
        rt.stats.packets.dropped += 1;
        return;
    }

    community.candidates.touch(&source, now);
    let decoded = match community.get_conversion(packet) {
        Some(conversion) => {
            let mut ctx = DecodeContext {
                conn: &rt.conn,
                members: &mut rt.members,
                community_id: community.database_id,
            };
            conversion.decode(packet, Some(source), &mut ctx)
        }
        None => Err(Rejection::drop("unknown conversion")),
    };

    let result = match decoded {
        Ok(message) => on_message(rt, community, message, now),
        Err(Rejection::Drop(reason)) => {
            reject(rt, source, &reason, now);
            Ok(())
        }
        Err(Rejection::DelayByMissingMember { mid }) => {
            delay_for_member(rt, community, source, packet, mid, now)
        }
        Err(Rejection::DelayByMissingMessage { member, global_times }) => {
            delay_for_message(rt, community, source, packet, member, global_times, now)
        }
    };
    if let Err(e) = result {
        warn!(%source, community = %hex::encode(cid), error = %e, "failed to handle packet");
    }
}

fn reject(rt: &mut Runtime, source: SocketAddrV4, reason: &str, now: Instant) {
    debug!(%source, reason, "dropping packet");
    rt.stats.packets.dropped += 1;
    rt.rate_limiter.record_drop(source, now);
}

/// Decode a packet read back from the store.
pub(crate) fn decode_stored(rt: &mut Runtime, community: &Community, packet: &[u8]) -> Option<Message> {
    let conversion = community.get_conversion(packet)?;
    let mut ctx = DecodeContext {
        conn: &rt.conn,
        members: &mut rt.members,
        community_id: community.database_id,
    };
    match conversion.decode(packet, None, &mut ctx) {
        Ok(message) => Some(message),
        Err(rejection) => {
            debug!(community = %hex::encode(community.cid), %rejection, "stored packet no longer decodes");
            None
        }
    }
}

/// Send a `dispersy-missing-*` request to `address`.
pub(crate) fn request(
    rt: &mut Runtime,
    community: &mut Community,
    address: SocketAddrV4,
    kind: DispersyMessage,
    payload: Payload,
) -> Result<(), DispersyError> {
    let message = build_dispersy_message(rt, community, kind, payload, Target::Addresses(vec![address]))?;
    rt.send(address, message.packet);
    Ok(())
}

/// Park a packet until a message matching `footprint` is accepted.
fn park(
    rt: &mut Runtime,
    footprint: Footprint,
    source: SocketAddrV4,
    packet: &[u8],
    reason: &str,
    now: Instant,
) {
    rt.stats.packets.delayed += 1;
    if rt.footprints.is_parked(packet) {
        trace!(%source, reason, "packet already delayed");
        return;
    }
    debug!(%source, reason, "delaying packet");
    let deadline = now + rt.config.delayed_packet_timeout();
    rt.footprints.register(
        footprint,
        deadline,
        Continuation::Redrive {
            source,
            packet: packet.to_vec(),
        },
    );
}

fn delay_for_member(
    rt: &mut Runtime,
    community: &mut Community,
    source: SocketAddrV4,
    packet: &[u8],
    mid: Mid,
    now: Instant,
) -> Result<(), DispersyError> {
    if !rt.footprints.is_waiting_for_member(&community.cid, &mid) {
        request(rt, community, source, DispersyMessage::MissingIdentity, Payload::MissingIdentity { mid })?;
    }
    let footprint = Footprint::new(community.cid, DispersyMessage::Identity.name()).with_member(mid);
    park(rt, footprint, source, packet, "missing identity", now);
    Ok(())
}

fn delay_for_message(
    rt: &mut Runtime,
    community: &mut Community,
    source: SocketAddrV4,
    packet: &[u8],
    member: Arc<Member>,
    global_times: Vec<u64>,
    now: Instant,
) -> Result<(), DispersyError> {
    let Some(first) = global_times.first().copied() else {
        reject(rt, source, "empty missing message reference", now);
        return Ok(());
    };
    let footprint = Footprint::any_of(community.cid, member.mid).with_global_time(first);
    request(
        rt,
        community,
        source,
        DispersyMessage::MissingMessage,
        Payload::MissingMessage { member, global_times },
    )?;
    park(rt, footprint, source, packet, "missing message", now);
    Ok(())
}

/// Check a decoded message and act on the verdict.
fn on_message(rt: &mut Runtime, community: &mut Community, message: Message, now: Instant) -> Result<(), DispersyError> {
    let Some(source) = message.source else {
        return Ok(());
    };
    let verdict = check_message(rt, community, &message)?;
    match verdict {
        Verdict::Accept => {
            accept(rt, community, message, now)?;
        }
        Verdict::Drop(reason) => {
            debug!(%source, meta = %message.meta.name, reason, "dropping message");
            rt.stats.packets.dropped += 1;
        }
        Verdict::DropByProof { reason, proof } => {
            debug!(%source, meta = %message.meta.name, reason, proofs = proof.len(), "dropping message, returning proof");
            rt.stats.packets.dropped += 1;
            for packet in proof {
                rt.send(source, packet);
            }
        }
        Verdict::DelayBySequence {
            missing_low,
            missing_high,
        } => {
            let Some(member) = message.member().cloned() else {
                return Ok(());
            };
            request(
                rt,
                community,
                source,
                DispersyMessage::MissingSequence,
                Payload::MissingSequence(MissingSequencePayload {
                    mid: member.mid,
                    meta: message.meta.clone(),
                    missing_low,
                    missing_high,
                }),
            )?;
            let footprint = Footprint::new(community.cid, message.meta.name.clone())
                .with_member(member.mid)
                .with_sequence_number(missing_high);
            park(rt, footprint, source, &message.packet, "missing sequence numbers", now);
        }
        Verdict::DelayByProof => {
            let Some(member) = message.member().cloned() else {
                return Ok(());
            };
            request(
                rt,
                community,
                source,
                DispersyMessage::MissingProof,
                Payload::MissingProof {
                    member,
                    global_time: message.global_time,
                },
            )?;
            let footprint = Footprint::new(community.cid, DispersyMessage::Authorize.name());
            park(rt, footprint, source, &message.packet, "missing permission proof", now);
        }
        Verdict::DelayBySubjectiveSet { member, cluster } => {
            let mid = member.mid;
            request(
                rt,
                community,
                source,
                DispersyMessage::MissingSubjectiveSet,
                Payload::MissingSubjectiveSet {
                    cluster,
                    members: vec![member],
                },
            )?;
            let footprint = Footprint::new(community.cid, DispersyMessage::SubjectiveSet.name()).with_member(mid);
            park(rt, footprint, source, &message.packet, "missing subjective set", now);
        }
    }
    Ok(())
}

/// Decide what to do with a decoded, received message.
pub(crate) fn check_message(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
) -> Result<Verdict, DispersyError> {
    let meta = &message.meta;

    // Accepted messages of every distribution move the clock
    if message.global_time > community.acceptable_global_time(rt.config.acceptable_global_time_range) {
        return Ok(Verdict::drop("global time too far ahead"));
    }

    if meta.distribution.is_synced() {
        if let Some((DestroyDegree::SoftKill, frozen_at)) = community.destroyed {
            if message.global_time > frozen_at {
                return Ok(Verdict::drop("community is frozen"));
            }
        }

        if let Some(member) = message.member() {
            if let Some(stored) = get_packet_at(&rt.conn, community.database_id, member.database_id, message.global_time)? {
                if stored.packet == message.packet {
                    return Ok(Verdict::drop("duplicate"));
                }
                return Ok(Verdict::DropByProof {
                    reason: "different packet stored at this global time".to_string(),
                    proof: vec![stored.packet],
                });
            }

            if let Some(sequence) = message.sequence_number {
                let highest = highest_sequence(&rt.conn, community.database_id, member.database_id, meta.database_id)?;
                if sequence <= highest {
                    return Ok(Verdict::drop("sequence number already used"));
                }
                if sequence > highest + 1 {
                    return Ok(Verdict::DelayBySequence {
                        missing_low: highest + 1,
                        missing_high: sequence - 1,
                    });
                }
            }

            if let Distribution::LastSync {
                history_size,
                cluster,
                ..
            } = meta.distribution
            {
                let history = get_last_sync_history(
                    &rt.conn,
                    community.database_id,
                    member.database_id,
                    meta.database_id,
                    cluster,
                )?;
                let superseded = history.len() >= history_size as usize
                    && history.first().is_some_and(|oldest| message.global_time < oldest.global_time);
                if superseded {
                    return Ok(Verdict::DropByProof {
                        reason: "older than the last-sync history".to_string(),
                        proof: history.into_iter().map(|h| h.packet).collect(),
                    });
                }
            }
        }
    }

    let check = community
        .timeline
        .check(message, |id| community.meta_by_database_id(id).map(|m| m.database_id));
    if !check.allowed {
        return Ok(Verdict::DelayByProof);
    }

    if let Destination::Subjective { cluster, .. } = meta.destination {
        if let Some(author) = message.member() {
            match community.subjective_sets.get(&(author.database_id, cluster)) {
                None => {
                    return Ok(Verdict::DelayBySubjectiveSet {
                        member: author.clone(),
                        cluster,
                    });
                }
                Some(filter) if !filter.contains(&community.my_member.member.public_key) => {
                    return Ok(Verdict::drop("not in the author's subjective set"));
                }
                Some(_) => {}
            }
        }
    }

    Ok(match &message.payload {
        Payload::IntroductionResponse(response) if !community.walker.is_outstanding(response.identifier) => {
            Verdict::drop("no outstanding introduction request")
        }
        Payload::SignatureResponse { identifier, .. } if !rt.signatures.is_pending(*identifier) => {
            Verdict::drop("no pending signature request")
        }
        Payload::UndoOwn(undo) | Payload::UndoOther(undo) if undo.global_time >= message.global_time => {
            Verdict::drop("undo is not newer than its target")
        }
        Payload::UndoOwn(undo) | Payload::UndoOther(undo)
            if undo.packet.as_ref().is_some_and(|p| p.undone) =>
        {
            Verdict::drop("message already undone")
        }
        Payload::Application(_) => community.hooks.check_message(message),
        _ => Verdict::Accept,
    })
}

/// Store a checked message, update community state, run its handler and
/// release whatever waited for it. Returns the message with its packet id.
pub(crate) fn accept(
    rt: &mut Runtime,
    community: &mut Community,
    mut message: Message,
    now: Instant,
) -> Result<Message, DispersyError> {
    let meta = message.meta.clone();
    if meta.distribution.is_synced() {
        if let Some(member) = message.member().cloned() {
            let id = insert_packet(
                &rt.conn,
                &NewPacket {
                    community_id: community.database_id,
                    member_id: member.database_id,
                    meta_message_id: meta.database_id,
                    global_time: message.global_time,
                    sequence: message.sequence_number,
                    packet: &message.packet,
                },
            )?;
            message.packet_id = Some(id);
            rt.stats.packets.stored += 1;
            community
                .sync_ranges
                .add(message.global_time, &message.packet, &mut rt.rng)?;

            if let Distribution::LastSync {
                history_size,
                cluster,
                ..
            } = meta.distribution
            {
                let history = get_last_sync_history(
                    &rt.conn,
                    community.database_id,
                    member.database_id,
                    meta.database_id,
                    cluster,
                )?;
                let excess = history.len().saturating_sub(history_size as usize);
                for old in history.into_iter().take(excess) {
                    trace!(global_time = old.global_time, "evicting last-sync message");
                    delete_packet(&rt.conn, old.id)?;
                }
            }
        }
    }

    community.update_global_time(message.global_time);
    if let (Some(source), Some(member)) = (message.source, message.member()) {
        community.candidates.add_member(&source, member);
    }

    handle(rt, community, &message, now)?;

    for continuation in rt.footprints.take_matching(&message) {
        rt.release(continuation, Some(&message));
    }
    Ok(message)
}

/// Run the handler of an accepted message.
fn handle(rt: &mut Runtime, community: &mut Community, message: &Message, now: Instant) -> Result<(), DispersyError> {
    match &message.payload {
        Payload::Identity => {
            trace!(community = %hex::encode(community.cid), "identity stored");
            Ok(())
        }
        Payload::MissingIdentity { mid } => missing::on_missing_identity(rt, community, message, mid),
        Payload::MissingSequence(request) => missing::on_missing_sequence(rt, community, message, request),
        Payload::MissingMessage { member, global_times } => {
            missing::on_missing_message(rt, community, message, member, global_times)
        }
        Payload::MissingProof { member, global_time } => {
            missing::on_missing_proof(rt, community, message, member, *global_time)
        }
        Payload::MissingLastMessage { member, meta, count } => {
            missing::on_missing_last_message(rt, community, message, member, meta, *count)
        }
        Payload::MissingSubjectiveSet { cluster, members } => {
            missing::on_missing_subjective_set(rt, community, message, *cluster, members)
        }
        Payload::SignatureRequest { identifier, message: inner } => {
            signature::on_signature_request(rt, community, message, *identifier, inner)
        }
        Payload::SignatureResponse { identifier, signature } => {
            signature::on_signature_response(rt, community, *identifier, signature, now)
        }
        Payload::PunctureRequest(request) => puncture::on_puncture_request(rt, community, message, request),
        Payload::Puncture(puncture) => {
            puncture::on_puncture(community, message, puncture, now);
            Ok(())
        }
        Payload::IntroductionRequest(request) => {
            introduction::on_introduction_request(rt, community, message, request, now)
        }
        Payload::IntroductionResponse(response) => {
            introduction::on_introduction_response(rt, community, message, response, now)
        }
        Payload::DestroyCommunity { degree } => destroy::on_destroy(rt, community, message, *degree),
        Payload::Authorize { .. } | Payload::Revoke { .. } => {
            permission::on_permissions(community, message);
            Ok(())
        }
        Payload::DynamicSettings { policies } => {
            permission::on_dynamic_settings(community, message, policies);
            Ok(())
        }
        Payload::SubjectiveSet { cluster, filter } => {
            subjective::on_subjective_set(community, message, *cluster, filter);
            Ok(())
        }
        Payload::UndoOwn(undo) | Payload::UndoOther(undo) => undo::on_undo(rt, community, message, undo),
        Payload::Application(_) => {
            community.hooks.on_messages(std::slice::from_ref(message));
            Ok(())
        }
    }
}
