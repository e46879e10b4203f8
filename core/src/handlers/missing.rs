//! Answers to `dispersy-missing-*` requests
//!
//! Each request is answered with stored packets sent straight back to the
//! requesting address. Nothing is answered when we do not have it.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::community::Community;
use crate::community::member::Member;
use crate::data::sync::{get_newest_packets, get_packet_at, get_packets_at, get_packets_by_sequence};
use crate::message::{DispersyMessage, Message, MetaMessage};
use crate::network::payload::MissingSequencePayload;
use crate::protocol::core::Runtime;
use crate::protocol::error::DispersyError;
use crate::security::digest::Mid;

use super::decode_stored;

/// Send `packets` to `address`, stopping at the sync response limit.
fn respond(rt: &mut Runtime, address: SocketAddrV4, packets: impl IntoIterator<Item = Vec<u8>>) -> usize {
    let mut budget = rt.config.sync_response_limit;
    let mut sent = 0;
    for packet in packets {
        if packet.len() > budget {
            break;
        }
        budget -= packet.len();
        rt.send(address, packet);
        sent += 1;
    }
    sent
}

pub(crate) fn on_missing_identity(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    mid: &Mid,
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    let identity = community.dispersy_meta(DispersyMessage::Identity)?;
    let mut packets = Vec::new();
    for member in rt.members.get_by_mid(&rt.conn, mid)? {
        for stored in get_newest_packets(&rt.conn, community.database_id, member.database_id, identity.database_id, 1)? {
            packets.push(stored.packet);
        }
    }
    let sent = respond(rt, source, packets);
    trace!(%source, mid = %hex::encode(mid), sent, "answered missing identity");
    Ok(())
}

pub(crate) fn on_missing_sequence(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    missing: &MissingSequencePayload,
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    if missing.missing_low == 0 || missing.missing_low > missing.missing_high {
        debug!(%source, low = missing.missing_low, high = missing.missing_high, "invalid sequence range");
        return Ok(());
    }
    let mut packets = Vec::new();
    for member in rt.members.get_by_mid(&rt.conn, &missing.mid)? {
        for stored in get_packets_by_sequence(
            &rt.conn,
            community.database_id,
            member.database_id,
            missing.meta.database_id,
            missing.missing_low,
            missing.missing_high,
        )? {
            packets.push(stored.packet);
        }
    }
    let sent = respond(rt, source, packets);
    trace!(%source, meta = %missing.meta.name, sent, "answered missing sequence");
    Ok(())
}

pub(crate) fn on_missing_message(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    member: &Arc<Member>,
    global_times: &[u64],
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    let packets = get_packets_at(&rt.conn, community.database_id, member.database_id, global_times)?;
    respond(rt, source, packets.into_iter().map(|p| p.packet));
    Ok(())
}

/// Send the permission chain that allowed a stored message.
pub(crate) fn on_missing_proof(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    member: &Arc<Member>,
    global_time: u64,
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    let Some(stored) = get_packet_at(&rt.conn, community.database_id, member.database_id, global_time)? else {
        trace!(%source, global_time, "proof requested for unknown message");
        return Ok(());
    };
    let Some(message) = decode_stored(rt, community, &stored.packet) else {
        return Ok(());
    };
    let check = community
        .timeline
        .check(&message, |id| community.meta_by_database_id(id).map(|m| m.database_id));
    let sent = respond(rt, source, check.proofs);
    trace!(%source, global_time, sent, "answered missing proof");
    Ok(())
}

pub(crate) fn on_missing_last_message(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    member: &Arc<Member>,
    meta: &Arc<MetaMessage>,
    count: u8,
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    let packets = get_newest_packets(
        &rt.conn,
        community.database_id,
        member.database_id,
        meta.database_id,
        count as u32,
    )?;
    respond(rt, source, packets.into_iter().map(|p| p.packet));
    Ok(())
}

pub(crate) fn on_missing_subjective_set(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    cluster: u8,
    members: &[Arc<Member>],
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    let meta = community.dispersy_meta(DispersyMessage::SubjectiveSet)?;
    let mut packets = Vec::new();
    for member in members {
        for stored in get_newest_packets(&rt.conn, community.database_id, member.database_id, meta.database_id, 1)? {
            packets.push(stored.packet);
        }
    }
    let sent = respond(rt, source, packets);
    trace!(%source, cluster, sent, "answered missing subjective set");
    Ok(())
}
