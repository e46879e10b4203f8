//! Sync rounds
//!
//! Besides the walker's own request, every sync interval sends an
//! introduction request with a sync range to a few random candidates so
//! stores converge faster than the walk alone would allow.

use std::time::Instant;

use tracing::{debug, warn};

use crate::protocol::core::Dispersy;

use super::walker::send_introduction_request;

impl Dispersy {
    /// One sync round in every loaded community.
    pub fn sync_round(&mut self, now: Instant) {
        for cid in self.community_ids() {
            let Ok((rt, community)) = self.split(&cid) else {
                continue;
            };
            if community.is_hard_killed() {
                continue;
            }
            let pending = community.walker.pending_addresses();
            let peers = community.candidates.random_peers(
                rt.config.sync_member_count,
                |c| !pending.contains(&c.address),
                &mut rt.rng,
            );
            debug!(community = %hex::encode(cid), peers = peers.len(), "sync round");
            for address in peers {
                if rt.is_own_address(&address) {
                    continue;
                }
                if let Err(e) = send_introduction_request(rt, community, address, now) {
                    warn!(community = %hex::encode(cid), %address, error = %e, "sync request failed");
                }
            }
        }
        self.drain(now);
    }
}

#[cfg(test)]
mod tests {
    use crate::communities::simple::SimpleCommunity;
    use crate::data::start::start_memory_db;
    use crate::protocol::config::DispersyConfig;
    use crate::protocol::core::Dispersy;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Instant;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    #[test]
    fn test_sync_round_reaches_member_count() {
        let now = Instant::now();
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing()).unwrap();
        d.set_lan_address(addr(1));
        let cid = d.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        {
            let community = d.community_mut(&cid).unwrap();
            for last in 10..15 {
                community.candidates.stumble(
                    addr(last),
                    addr(last),
                    addr(last),
                    Default::default(),
                    None,
                    now,
                );
            }
        }
        d.take_outgoing();

        d.sync_round(now);
        let out = d.take_outgoing();
        assert_eq!(out.len(), d.config().sync_member_count);
        assert_eq!(d.community(&cid).unwrap().walker().outstanding_len(), out.len());
    }
}
