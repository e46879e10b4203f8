//! `dispersy-undo-own` and `dispersy-undo-other`
//!
//! The undone packet stays stored with its undone flag set, so it keeps
//! being synced and a later duplicate is still recognised.

use tracing::{debug, trace};

use crate::community::Community;
use crate::data::sync::set_undone;
use crate::message::Message;
use crate::network::payload::UndoPayload;
use crate::protocol::core::Runtime;
use crate::protocol::error::DispersyError;

use super::decode_stored;

pub(crate) fn on_undo(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
    undo: &UndoPayload,
) -> Result<(), DispersyError> {
    let Some(stored) = &undo.packet else {
        trace!(global_time = undo.global_time, "undo of an unknown message");
        return Ok(());
    };
    set_undone(&rt.conn, stored.id, true)?;
    debug!(
        community = %hex::encode(community.cid),
        member = %hex::encode(undo.member.mid),
        global_time = undo.global_time,
        "message undone"
    );

    let wants_callback = community
        .meta_by_database_id(stored.meta_message_id)
        .is_some_and(|meta| meta.undo_callback);
    if wants_callback {
        if let Some(undone) = decode_stored(rt, community, &stored.packet) {
            community.hooks.undo_message(&undone, message);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::communities::simple::SimpleCommunity;
    use crate::data::start::start_memory_db;
    use crate::data::sync::get_packet_at;
    use crate::network::payload::{Payload, UndoPayload};
    use crate::protocol::config::DispersyConfig;
    use crate::protocol::core::Dispersy;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Instant;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    fn node(seed: u64, last: u8) -> Dispersy {
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(seed)).unwrap();
        d.set_lan_address(addr(last));
        d
    }

    #[test]
    fn test_received_undo_flags_and_calls_back() {
        let now = Instant::now();
        let mut a = node(1, 1);
        let cid = a.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let mut b = node(2, 2);
        b.join_community(&master, Box::new(SimpleCommunity::new()), now).unwrap();
        b.take_outgoing();

        let founder_grant = {
            let community = a.community(&cid).unwrap();
            let meta = community.get_meta_message("dispersy-authorize").unwrap();
            crate::data::sync::get_packets_of_meta(a.connection(), community.database_id(), meta.database_id).unwrap()
        };
        let moderated = a
            .create_value_message(&cid, "moderated", SimpleCommunity::text_value("oops"), now)
            .unwrap();
        let me = a.my_member().member.clone();
        let undo = a.create_undo(&cid, &me, moderated.global_time, now).unwrap();
        a.take_outgoing();

        for stored in founder_grant {
            b.on_packet(addr(1), &stored.packet, now);
        }
        b.on_packet(addr(1), &moderated.packet, now);
        b.on_packet(addr(1), &undo.packet, now);

        let author = b.rt.members.get_by_public_key(&b.rt.conn, &me.public_key).unwrap().unwrap();
        let community = b.community(&cid).unwrap();
        let stored = get_packet_at(b.connection(), community.database_id(), author.database_id, moderated.global_time)
            .unwrap()
            .unwrap();
        assert!(stored.undone);
        let hooks = b.community(&cid).unwrap().hooks_as::<SimpleCommunity>().unwrap();
        assert_eq!(hooks.undone(), &[moderated.global_time]);

        // A second undo of the same message is dropped
        let dropped = b.stats().packets.dropped;
        b.on_packet(addr(1), &undo.packet, now);
        assert_eq!(b.stats().packets.dropped, dropped + 1);
    }

    #[test]
    fn test_undo_older_than_target_dropped() {
        let now = Instant::now();
        let mut a = node(3, 1);
        let cid = a.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let mut b = node(4, 2);
        b.join_community(&master, Box::new(SimpleCommunity::new()), now).unwrap();
        b.take_outgoing();

        let founder_grant = {
            let community = a.community(&cid).unwrap();
            let meta = community.get_meta_message("dispersy-authorize").unwrap();
            crate::data::sync::get_packets_of_meta(a.connection(), community.database_id(), meta.database_id).unwrap()
        };
        let moderated = a
            .create_message_at(
                &cid,
                "moderated",
                Payload::Application(SimpleCommunity::text_value("late")),
                50,
            )
            .unwrap();
        let me = a.my_member().member.clone();
        let undo = a
            .create_message_at(
                &cid,
                "dispersy-undo-own",
                Payload::UndoOwn(UndoPayload {
                    member: me.clone(),
                    global_time: 50,
                    packet: None,
                }),
                40,
            )
            .unwrap();

        for stored in founder_grant {
            b.on_packet(addr(1), &stored.packet, now);
        }
        b.on_packet(addr(1), &moderated.packet, now);
        let dropped = b.stats().packets.dropped;
        b.on_packet(addr(1), &undo.packet, now);
        assert_eq!(b.stats().packets.dropped, dropped + 1);

        let author = b.rt.members.get_by_public_key(&b.rt.conn, &me.public_key).unwrap().unwrap();
        let community = b.community(&cid).unwrap();
        let stored = get_packet_at(b.connection(), community.database_id(), author.database_id, 50)
            .unwrap()
            .unwrap();
        assert!(!stored.undone);
        assert!(community.hooks_as::<SimpleCommunity>().unwrap().undone().is_empty());
    }
}
