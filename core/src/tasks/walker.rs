//! Walker
//!
//! One walk step per community and interval: pick a target from the
//! candidate table (walks, stumbles and introduced peers at 49% each, the
//! bootstrap list for the rest) and send it an introduction request
//! carrying one sync range.
//!
//! A request holds a single window. Older ranges are still advertised
//! across steps because the range is drawn from a half-normal over all
//! indices, newest first. No second request is sent per step.

use std::net::SocketAddrV4;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::community::Community;
use crate::message::{DispersyMessage, Target};
use crate::network::payload::{IntroductionRequestPayload, Payload};
use crate::protocol::core::{Dispersy, Runtime};
use crate::protocol::create::build_dispersy_message;
use crate::protocol::error::DispersyError;
use crate::security::digest::Mid;

/// Send an introduction request to `address`, returning its identifier.
pub(crate) fn send_introduction_request(
    rt: &mut Runtime,
    community: &mut Community,
    address: SocketAddrV4,
    now: Instant,
) -> Result<u16, DispersyError> {
    let identifier = community
        .walker
        .start(address, rt.config.introduction_timeout(), now, &mut rt.rng);
    community.candidates.walk(address, now);

    let index = community.sync_ranges.pick(&mut rt.rng);
    let sync = community.sync_ranges.request(index);
    let request = build_dispersy_message(
        rt,
        community,
        DispersyMessage::IntroductionRequest,
        Payload::IntroductionRequest(IntroductionRequestPayload {
            destination_address: address,
            source_lan_address: rt.lan_address,
            source_wan_address: rt.wan_address,
            advice: true,
            connection_type: rt.connection_type,
            tunnel: false,
            sync,
            identifier,
        }),
        Target::Addresses(vec![address]),
    )?;
    rt.send(address, request.packet);
    rt.stats.walk.attempts += 1;
    trace!(%address, identifier, sync_range = index, "introduction request sent");
    Ok(identifier)
}

/// Take one walk step in `community`. Returns the walked address.
pub(crate) fn walk_community(
    rt: &mut Runtime,
    community: &mut Community,
    now: Instant,
) -> Result<Option<SocketAddrV4>, DispersyError> {
    if community.is_hard_killed() {
        return Ok(None);
    }
    community.walker.last_step = Some(now);
    let mut exclude = community.walker.pending_addresses();
    exclude.push(rt.lan_address);
    exclude.push(rt.wan_address);
    let Some((address, category)) = community.candidates.walk_target(&exclude, &mut rt.rng) else {
        trace!(community = %hex::encode(community.cid), "no walk target");
        return Ok(None);
    };
    debug!(community = %hex::encode(community.cid), %address, ?category, "walking");
    send_introduction_request(rt, community, address, now)?;
    Ok(Some(address))
}

impl Dispersy {
    /// One walk step in every loaded community.
    pub fn walker_step(&mut self, now: Instant) {
        for cid in self.community_ids() {
            let Ok((rt, community)) = self.split(&cid) else {
                continue;
            };
            if let Err(e) = walk_community(rt, community, now) {
                warn!(community = %hex::encode(cid), error = %e, "walk step failed");
            }
        }
        self.drain(now);
    }

    /// Send an introduction request to a specific address.
    pub fn walk_to(&mut self, cid: &Mid, address: SocketAddrV4, now: Instant) -> Result<u16, DispersyError> {
        let (rt, community) = self.split(cid)?;
        if community.is_hard_killed() {
            return Err(DispersyError::Destroyed);
        }
        let identifier = send_introduction_request(rt, community, address, now)?;
        self.drain(now);
        Ok(identifier)
    }
}
