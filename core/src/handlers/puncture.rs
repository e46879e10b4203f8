//! NAT puncturing
//!
//! A peer that introduced a walker to us asks us to send a puncture to
//! that walker. The puncture opens our NAT towards the walker while the
//! walker's next request opens its NAT towards us.

use std::time::Instant;

use tracing::trace;

use crate::community::Community;
use crate::message::{DispersyMessage, Message, Target};
use crate::network::payload::{Payload, PuncturePayload, PunctureRequestPayload};
use crate::protocol::core::Runtime;
use crate::protocol::create::build_dispersy_message;
use crate::protocol::error::DispersyError;

pub(crate) fn on_puncture_request(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
    request: &PunctureRequestPayload,
) -> Result<(), DispersyError> {
    // A walker sharing our WAN address sits behind the same NAT
    let target = if request.wan_walker_address.ip() == rt.wan_address.ip() {
        request.lan_walker_address
    } else {
        request.wan_walker_address
    };
    let puncture = build_dispersy_message(
        rt,
        community,
        DispersyMessage::Puncture,
        Payload::Puncture(PuncturePayload {
            source_lan_address: rt.lan_address,
            source_wan_address: rt.wan_address,
            identifier: request.identifier,
        }),
        Target::Addresses(vec![target]),
    )?;
    trace!(source = ?message.source, %target, "sending puncture");
    rt.send(target, puncture.packet);
    Ok(())
}

pub(crate) fn on_puncture(community: &mut Community, message: &Message, puncture: &PuncturePayload, now: Instant) {
    let Some(source) = message.source else {
        return;
    };
    trace!(%source, identifier = puncture.identifier, "punctured");
    community
        .candidates
        .punctured(source, puncture.source_lan_address, puncture.source_wan_address, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communities::simple::SimpleCommunity;
    use crate::data::start::start_memory_db;
    use crate::protocol::config::DispersyConfig;
    use crate::protocol::core::Dispersy;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(a: u8, b: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, a, b), 6421)
    }

    #[test]
    fn test_puncture_request_targets_walker_wan() {
        let now = Instant::now();
        let conn = start_memory_db().unwrap();
        let mut c = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(5)).unwrap();
        c.set_lan_address(addr(3, 1));
        let cid = c.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        c.take_outgoing();

        let packet = {
            let (rt, community) = c.split(&cid).unwrap();
            build_dispersy_message(
                rt,
                community,
                DispersyMessage::PunctureRequest,
                Payload::PunctureRequest(PunctureRequestPayload {
                    lan_walker_address: addr(1, 1),
                    wan_walker_address: addr(100, 1),
                    identifier: 77,
                }),
                Target::None,
            )
            .unwrap()
            .packet
        };
        c.on_packet(addr(2, 1), &packet, now);

        let out = c.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address, addr(100, 1));
    }

    #[test]
    fn test_puncture_registers_candidate() {
        let now = Instant::now();
        let conn = start_memory_db().unwrap();
        let mut a = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(6)).unwrap();
        a.set_lan_address(addr(1, 1));
        let cid = a.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        a.take_outgoing();

        let packet = {
            let (rt, community) = a.split(&cid).unwrap();
            build_dispersy_message(
                rt,
                community,
                DispersyMessage::Puncture,
                Payload::Puncture(PuncturePayload {
                    source_lan_address: addr(3, 1),
                    source_wan_address: addr(100, 3),
                    identifier: 9,
                }),
                Target::None,
            )
            .unwrap()
            .packet
        };
        a.on_packet(addr(100, 3), &packet, now);

        let candidate = a.community(&cid).unwrap().candidates().get(&addr(100, 3)).unwrap().clone();
        assert_eq!(candidate.lan_address, addr(3, 1));
        assert!(candidate.last_incoming.is_some());
        assert!(a.take_outgoing().is_empty());
    }
}
