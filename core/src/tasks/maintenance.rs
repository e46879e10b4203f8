//! Maintenance round
//!
//! Expires everything that waits on a deadline: introduction requests,
//! delayed packets and callbacks, signature requests, address votes and
//! rate limiter windows. Also forgets silent candidates and persists the
//! candidate tables.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::handlers::signature::expire_signature_requests;
use crate::protocol::core::Dispersy;

use super::walker::walk_community;

impl Dispersy {
    /// Run one maintenance round.
    pub fn maintenance(&mut self, now: Instant) {
        let release = self.rt.config.identifier_release();
        let cleanup_age = self.rt.config.candidate_cleanup_age();

        for cid in self.community_ids() {
            let Ok((rt, community)) = self.split(&cid) else {
                continue;
            };
            let expired = community.walker.expire(release, now);
            let timeouts = expired.len();
            for request in expired {
                rt.stats.walk.timeouts += 1;
                debug!(community = %hex::encode(cid), address = %request.address, "introduction request timed out");
                community.candidates.remove(&request.address);
            }
            if timeouts > 0 {
                if let Err(e) = walk_community(rt, community, now) {
                    warn!(community = %hex::encode(cid), error = %e, "replacement walk failed");
                }
            }

            let removed = community.candidates.cleanup(cleanup_age, now);
            if removed > 0 {
                debug!(community = %hex::encode(cid), removed, "silent candidates removed");
            }
            if let Err(e) = self.save_routing(&cid, now) {
                warn!(community = %hex::encode(cid), error = %e, "failed to save routing");
            }
        }

        let expired = self.rt.footprints.expire(now);
        if !expired.is_empty() {
            info!(count = expired.len(), "delayed packets and callbacks timed out");
        }
        for continuation in expired {
            self.rt.release(continuation, None);
        }
        expire_signature_requests(self, now);

        let vote_age = self.rt.config.address_vote_age();
        self.rt.votes.expire(vote_age, now);
        self.rt.rate_limiter.cleanup(now);
        self.drain(now);
    }
}

#[cfg(test)]
mod tests {
    use crate::communities::simple::SimpleCommunity;
    use crate::data::start::start_memory_db;
    use crate::handlers::footprint::Footprint;
    use crate::protocol::config::DispersyConfig;
    use crate::protocol::core::Dispersy;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    fn dispersy() -> Dispersy {
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing()).unwrap();
        d.set_lan_address(addr(1));
        d
    }

    #[test]
    fn test_introduction_timeout_evicts_candidate() {
        let now = Instant::now();
        let mut d = dispersy();
        let cid = d.create_community(Box::new(SimpleCommunity::new()), now).unwrap();
        d.walk_to(&cid, addr(2), now).unwrap();
        d.take_outgoing();

        let later = now + d.config().introduction_timeout();
        d.maintenance(later);
        let community = d.community(&cid).unwrap();
        assert!(!community.candidates().contains(&addr(2)));
        assert_eq!(community.walker().outstanding_len(), 0);
        assert_eq!(d.stats().walk.timeouts, 1);
    }

    #[test]
    fn test_await_message_times_out_with_none() {
        let now = Instant::now();
        let mut d = dispersy();
        let cid = d.create_community(Box::new(SimpleCommunity::new()), now).unwrap();

        let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        d.await_message(
            Footprint::new(cid, "text"),
            Duration::from_secs(3),
            Box::new(move |_, message, _| sink.lock().unwrap().push(message.is_some())),
            now,
        );
        d.maintenance(now + Duration::from_secs(2));
        assert!(seen.lock().unwrap().is_empty());
        d.maintenance(now + Duration::from_secs(3));
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_await_message_fires_on_create() {
        let now = Instant::now();
        let mut d = dispersy();
        let cid = d.create_community(Box::new(SimpleCommunity::new()), now).unwrap();

        let seen: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        d.await_message(
            Footprint::new(cid, "text"),
            Duration::from_secs(3),
            Box::new(move |_, message, _| sink.lock().unwrap().push(message.is_some())),
            now,
        );
        d.create_value_message(&cid, "text", SimpleCommunity::text_value("hi"), now)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        d.maintenance(now + Duration::from_secs(5));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
