//! `dispersy-destroy-community`
//!
//! A soft kill freezes the community at the destroy message's global time:
//! newer synced messages are refused, older ones still sync. A hard kill
//! deletes everything except the destroy message and the authorize chain
//! that allowed it, stops auto loading and ignores further packets.

use tracing::info;

use crate::community::Community;
use crate::data::community::{set_auto_load, set_destroyed};
use crate::data::sync::{get_all_packets, get_packets_of_meta, delete_packets_except};
use crate::message::{DispersyMessage, Message};
use crate::network::payload::DestroyDegree;
use crate::protocol::core::Runtime;
use crate::protocol::error::DispersyError;

pub(crate) fn on_destroy(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
    degree: DestroyDegree,
) -> Result<(), DispersyError> {
    if community.is_hard_killed() {
        return Ok(());
    }
    match degree {
        DestroyDegree::SoftKill => {
            set_destroyed(&rt.conn, community.database_id, 0, message.global_time)?;
            community.destroyed = Some((DestroyDegree::SoftKill, message.global_time));
        }
        DestroyDegree::HardKill => hard_kill(rt, community, message)?,
    }
    community.hooks.on_destroyed(degree);
    info!(
        community = %hex::encode(community.cid),
        ?degree,
        global_time = message.global_time,
        "community destroyed"
    );
    Ok(())
}

fn hard_kill(rt: &mut Runtime, community: &mut Community, message: &Message) -> Result<(), DispersyError> {
    let proofs = community
        .timeline
        .check(message, |id| community.meta_by_database_id(id).map(|m| m.database_id))
        .proofs;

    let mut keep: Vec<i64> = message.packet_id.into_iter().collect();
    for kind in [DispersyMessage::Authorize, DispersyMessage::DynamicSettings] {
        let meta = community.dispersy_meta(kind)?;
        for stored in get_packets_of_meta(&rt.conn, community.database_id, meta.database_id)? {
            if proofs.contains(&stored.packet) {
                keep.push(stored.id);
            }
        }
    }
    let deleted = delete_packets_except(&rt.conn, community.database_id, &keep)?;

    let packets = get_all_packets(&rt.conn, community.database_id)?;
    community.sync_ranges.rebuild(&packets, &mut rt.rng)?;
    set_destroyed(&rt.conn, community.database_id, 1, message.global_time)?;
    set_auto_load(&rt.conn, community.database_id, false)?;
    community.destroyed = Some((DestroyDegree::HardKill, message.global_time));

    for continuation in rt.footprints.cancel_community(&community.cid) {
        rt.release(continuation, None);
    }
    for callback in rt.signatures.cancel_community(&community.cid) {
        rt.ready.push((callback, None));
    }
    info!(community = %hex::encode(community.cid), kept = keep.len(), deleted, "community storage reclaimed");
    Ok(())
}
