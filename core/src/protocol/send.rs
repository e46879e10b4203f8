//! Store, update and forward
//!
//! Messages we create are accepted locally exactly like received ones
//! (stored, handled, continuations released) and then sent to their
//! target. Candidate and member destinations need an explicit target;
//! community and subjective destinations pick random candidates.

use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace};

use crate::community::Community;
use crate::handlers::accept;
use crate::message::{Destination, Message, Target};

use super::core::Runtime;
use super::error::DispersyError;

/// Accept a message we created, then send it to its target.
pub(crate) fn store_update_forward(
    rt: &mut Runtime,
    community: &mut Community,
    message: Message,
    now: Instant,
) -> Result<Message, DispersyError> {
    let message = accept(rt, community, message, now)?;
    forward(rt, community, &message, now);
    Ok(message)
}

/// Send `message` to the addresses its target resolves to.
pub(crate) fn forward(rt: &mut Runtime, community: &mut Community, message: &Message, now: Instant) {
    let addresses = resolve_target(rt, community, message);
    trace!(
        community = %hex::encode(community.cid),
        meta = %message.meta.name,
        count = addresses.len(),
        "forwarding message"
    );
    send_packets(rt, community, &addresses, &message.packet, now);
}

/// Send one packet to several addresses.
pub(crate) fn send_packets(
    rt: &mut Runtime,
    community: &mut Community,
    addresses: &[SocketAddrV4],
    packet: &[u8],
    now: Instant,
) {
    for address in addresses {
        rt.send(*address, packet.to_vec());
        community.candidates.sent_to(address, now);
    }
}

fn resolve_target(rt: &mut Runtime, community: &Community, message: &Message) -> Vec<SocketAddrV4> {
    let mut addresses = match &message.target {
        Target::None => Vec::new(),
        Target::Addresses(addresses) => addresses.clone(),
        Target::Members(members) => members
            .iter()
            .flat_map(|m| community.candidates.addresses_of(m))
            .collect(),
        Target::Community => match message.meta.destination {
            Destination::Community { node_count } => {
                community
                    .candidates
                    .random_peers(node_count as usize, |_| true, &mut rt.rng)
            }
            Destination::Subjective { cluster, node_count } => {
                let me = &community.my_member.member;
                match community.subjective_set(me, cluster) {
                    Some(filter) => community.candidates.random_peers(
                        node_count as usize,
                        |c| c.members.iter().any(|m| filter.contains(&m.public_key)),
                        &mut rt.rng,
                    ),
                    None => {
                        debug!(cluster, "no subjective set of my own, not forwarding");
                        Vec::new()
                    }
                }
            }
            Destination::Candidate | Destination::Member => {
                debug!(meta = %message.meta.name, "destination needs an explicit target");
                Vec::new()
            }
        },
    };
    addresses.sort();
    addresses.dedup();
    addresses.retain(|a| !rt.is_own_address(a));
    addresses
}
