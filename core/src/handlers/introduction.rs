//! Introduction requests and responses
//!
//! An introduction request is one walker step and, when it carries a
//! Bloom filter, one sync request. The receiver votes on the sender's view
//! of our WAN address, answers with an introduction of a third peer and
//! asks that peer to puncture towards the requester. Packets inside the
//! advertised window that the filter does not know are sent back.

use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace};

use crate::community::Community;
use crate::data::sync::get_sync_packets;
use crate::message::meta::SYNC_PRIORITY_THRESHOLD;
use crate::message::{DispersyMessage, Message, Target};
use crate::network::payload::{
    IntroductionRequestPayload, IntroductionResponsePayload, Payload, PunctureRequestPayload, SyncRequest,
};
use crate::network::wire::{is_valid_address, no_address};
use crate::protocol::core::Runtime;
use crate::protocol::create::build_dispersy_message;
use crate::protocol::error::DispersyError;
use crate::tasks::walker::send_introduction_request;

pub(crate) fn on_introduction_request(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
    request: &IntroductionRequestPayload,
    now: Instant,
) -> Result<(), DispersyError> {
    let Some(source) = message.source else {
        return Ok(());
    };
    rt.vote_wan_address(source, request.destination_address, now);
    community.candidates.stumble(
        source,
        request.source_lan_address,
        source,
        request.connection_type,
        message.member(),
        now,
    );

    let introduced = if request.advice {
        community
            .candidates
            .introduction_target(&source, request.connection_type, &mut rt.rng)
            .map(|c| (c.address, c.lan_address, c.wan_address))
    } else {
        None
    };
    let (lan_introduction_address, wan_introduction_address) = match introduced {
        Some((_, lan, wan)) => (lan, wan),
        None => (no_address(), no_address()),
    };

    let response = build_dispersy_message(
        rt,
        community,
        DispersyMessage::IntroductionResponse,
        Payload::IntroductionResponse(IntroductionResponsePayload {
            destination_address: source,
            source_lan_address: rt.lan_address,
            source_wan_address: rt.wan_address,
            lan_introduction_address,
            wan_introduction_address,
            connection_type: rt.connection_type,
            tunnel: false,
            identifier: request.identifier,
        }),
        Target::Addresses(vec![source]),
    )?;
    rt.send(source, response.packet);
    community.candidates.sent_to(&source, now);

    if let Some((target, _, _)) = introduced {
        let puncture_request = build_dispersy_message(
            rt,
            community,
            DispersyMessage::PunctureRequest,
            Payload::PunctureRequest(PunctureRequestPayload {
                lan_walker_address: request.source_lan_address,
                wan_walker_address: source,
                identifier: request.identifier,
            }),
            Target::Addresses(vec![target]),
        )?;
        rt.send(target, puncture_request.packet);
        community.candidates.sent_to(&target, now);
        debug!(%source, introduced = %target, "introduced candidate");
    } else {
        trace!(%source, advice = request.advice, "nobody to introduce");
    }

    if let Some(sync) = &request.sync {
        respond_to_sync(rt, community, source, sync)?;
    }
    Ok(())
}

/// Send stored packets inside the window of `sync` that its filter misses.
fn respond_to_sync(
    rt: &mut Runtime,
    community: &Community,
    source: SocketAddrV4,
    sync: &SyncRequest,
) -> Result<(), DispersyError> {
    // The open-ended window arrives as time_high 0
    let time_high = match sync.time_high {
        0 => None,
        high => high.checked_add(1),
    };
    let rows = get_sync_packets(
        &rt.conn,
        community.database_id,
        sync.time_low,
        time_high,
        SYNC_PRIORITY_THRESHOLD,
    )?;

    let mut budget = rt.config.sync_response_limit;
    let mut sent = 0;
    for row in rows {
        if sync.bloom.contains(&row.packet) {
            continue;
        }
        if row.packet.len() > budget {
            break;
        }
        budget -= row.packet.len();
        rt.send(source, row.packet);
        sent += 1;
    }
    trace!(
        %source,
        time_low = sync.time_low,
        time_high = sync.time_high,
        sent,
        "answered sync request"
    );
    Ok(())
}

pub(crate) fn on_introduction_response(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
    response: &IntroductionResponsePayload,
    now: Instant,
) -> Result<(), DispersyError> {
    let Some(source) = message.source else {
        return Ok(());
    };
    if community.walker.complete(response.identifier).is_none() {
        return Ok(());
    }
    rt.stats.walk.successes += 1;
    rt.vote_wan_address(source, response.destination_address, now);
    community.candidates.walk_reply(
        source,
        response.source_lan_address,
        source,
        response.connection_type,
        message.member(),
        now,
    );

    let lan = response.lan_introduction_address;
    let wan = response.wan_introduction_address;
    if !is_valid_address(&lan) && !is_valid_address(&wan) {
        trace!(%source, "walk reply without introduction");
        return Ok(());
    }
    // Behind the same NAT the LAN address is the reachable one
    let address = if wan.ip() == rt.wan_address.ip() && is_valid_address(&lan) {
        lan
    } else {
        wan
    };
    if !is_valid_address(&address) || rt.is_own_address(&address) {
        return Ok(());
    }
    community.candidates.introduce(address, lan, wan, now);
    let walked = community.candidates.get(&address).is_some_and(|c| c.is_walk());
    if !walked && !community.walker.pending_addresses().contains(&address) {
        debug!(%source, introduced = %address, "walking to introduced candidate");
        send_introduction_request(rt, community, address, now)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communities::simple::SimpleCommunity;
    use crate::data::start::start_memory_db;
    use crate::protocol::config::DispersyConfig;
    use crate::protocol::core::Dispersy;
    use crate::community::candidate::ConnectionType;
    use crate::network::bloom::BloomFilter;
    use crate::security::digest::Mid;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    fn node(seed: u64, last: u8) -> Dispersy {
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(seed)).unwrap();
        d.set_lan_address(addr(last));
        d
    }

    fn founded(seed: u64, last: u8, now: Instant) -> (Dispersy, Mid) {
        let mut d = node(seed, last);
        let cid = d.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        d.take_outgoing();
        (d, cid)
    }

    /// An introduction request from `d` to `to` with an empty filter over the window.
    fn sync_request(d: &mut Dispersy, cid: &Mid, to: SocketAddrV4, time_low: u64, time_high: u64) -> Vec<u8> {
        let global_time = d.community(cid).unwrap().global_time();
        let payload = Payload::IntroductionRequest(IntroductionRequestPayload {
            destination_address: to,
            source_lan_address: d.lan_address(),
            source_wan_address: d.lan_address(),
            advice: false,
            connection_type: ConnectionType::Unknown,
            tunnel: false,
            sync: Some(SyncRequest {
                time_low,
                time_high,
                bloom: BloomFilter::new(1024, 1, vec![0]).unwrap(),
            }),
            identifier: 7,
        });
        d.create_message_at(cid, "dispersy-introduction-request", payload, global_time)
            .unwrap()
            .packet
    }

    #[test]
    fn test_request_answered_and_stumble_recorded() {
        let now = Instant::now();
        let (mut a, cid) = founded(1, 1, now);
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let mut b = node(2, 2);
        b.join_community(&master, Box::new(SimpleCommunity::new()), now).unwrap();
        b.take_outgoing();

        b.walk_to(&cid, addr(1), now).unwrap();
        let requests = b.take_outgoing();
        assert_eq!(requests.len(), 1);
        a.on_packet(addr(2), &requests[0].packet, now);

        let candidate = a.community(&cid).unwrap().candidates().get(&addr(2)).unwrap().clone();
        assert!(candidate.is_stumble());
        // Response plus every stored packet B's empty filter misses
        let replies = a.take_outgoing();
        assert!(replies.iter().all(|o| o.address == addr(2)));
        assert_eq!(replies.len(), 3);

        for reply in &replies {
            b.on_packet(addr(1), &reply.packet, now);
        }
        let community = b.community(&cid).unwrap();
        assert!(community.candidates().get(&addr(1)).unwrap().last_walk_reply.is_some());
        assert_eq!(community.walker().outstanding_len(), 0);
        assert_eq!(b.stats().walk.successes, 1);
    }

    #[test]
    fn test_unmatched_response_dropped() {
        let now = Instant::now();
        let (mut a, cid) = founded(3, 1, now);
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let mut b = node(4, 2);
        b.join_community(&master, Box::new(SimpleCommunity::new()), now).unwrap();
        b.take_outgoing();

        b.walk_to(&cid, addr(1), now).unwrap();
        let request = b.take_outgoing().remove(0);
        a.on_packet(addr(2), &request.packet, now);
        let response = a.take_outgoing().remove(0);

        b.on_packet(addr(1), &response.packet, now);
        let dropped = b.stats().packets.dropped;
        // The identifier is no longer outstanding
        b.on_packet(addr(1), &response.packet, now);
        assert_eq!(b.stats().packets.dropped, dropped + 1);
        assert_eq!(b.stats().walk.successes, 1);
    }

    #[test]
    fn test_sync_window_up_to_max_time() {
        let now = Instant::now();
        let (mut a, cid) = founded(5, 1, now);
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let mut b = node(6, 2);
        b.join_community(&master, Box::new(SimpleCommunity::new()), now).unwrap();
        b.take_outgoing();

        let request = sync_request(&mut b, &cid, addr(1), 1, u64::MAX);
        a.on_packet(addr(2), &request, now);
        // Response plus both stored packets
        assert_eq!(a.take_outgoing().len(), 3);

        let request = sync_request(&mut b, &cid, addr(1), u64::MAX, u64::MAX);
        a.on_packet(addr(2), &request, now);
        assert_eq!(a.take_outgoing().len(), 1);
    }

    #[test]
    fn test_sync_response_capped() {
        let now = Instant::now();
        let (mut a, cid) = founded(7, 1, now);
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let long = "x".repeat(200);
        for _ in 0..40 {
            a.create_value_message(&cid, "text", SimpleCommunity::text_value(&long), now)
                .unwrap();
        }
        a.take_outgoing();
        let mut b = node(8, 2);
        b.join_community(&master, Box::new(SimpleCommunity::new()), now).unwrap();
        b.take_outgoing();

        let request = sync_request(&mut b, &cid, addr(1), 1, 0);
        a.on_packet(addr(2), &request, now);
        let replies = a.take_outgoing();
        let limit = a.config().sync_response_limit;
        let synced: Vec<usize> = replies[1..].iter().map(|o| o.packet.len()).collect();
        assert!(!synced.is_empty());
        assert!(synced.len() < 42);
        assert!(synced.iter().sum::<usize>() <= limit);
    }
}
