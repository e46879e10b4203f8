//! Walker bookkeeping
//!
//! Outstanding introduction requests are matched to responses by their
//! 16-bit identifier. A request that times out frees its identifier only
//! after a release delay, so a late response cannot be matched to a newer
//! request. WAN address votes live here as well.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use rand::Rng;

use super::candidate::ConnectionType;

/// An introduction request waiting for its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub address: SocketAddrV4,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// Introduction requests of one community.
#[derive(Debug, Clone, Default)]
pub struct WalkerState {
    outstanding: HashMap<u16, OutstandingRequest>,
    released: HashMap<u16, Instant>,
    /// Time of the last walk step
    pub last_step: Option<Instant>,
}

impl WalkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Addresses with an outstanding request.
    pub fn pending_addresses(&self) -> Vec<SocketAddrV4> {
        self.outstanding.values().map(|r| r.address).collect()
    }

    /// Reserve a fresh identifier for a request to `address`.
    pub fn start<R: Rng>(&mut self, address: SocketAddrV4, timeout: Duration, now: Instant, rng: &mut R) -> u16 {
        let identifier = loop {
            let candidate: u16 = rng.gen();
            if !self.outstanding.contains_key(&candidate) && !self.released.contains_key(&candidate) {
                break candidate;
            }
        };
        self.outstanding.insert(
            identifier,
            OutstandingRequest {
                address,
                sent_at: now,
                deadline: now + timeout,
            },
        );
        identifier
    }

    /// Match a response. Returns the request it answers.
    pub fn complete(&mut self, identifier: u16) -> Option<OutstandingRequest> {
        self.outstanding.remove(&identifier)
    }

    pub fn is_outstanding(&self, identifier: u16) -> bool {
        self.outstanding.contains_key(&identifier)
    }

    /// Expire requests past their deadline, holding their identifiers
    /// back for `release_delay`. Returns the expired requests.
    pub fn expire(&mut self, release_delay: Duration, now: Instant) -> Vec<OutstandingRequest> {
        self.released.retain(|_, until| *until > now);

        let expired: Vec<u16> = self
            .outstanding
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut requests = Vec::with_capacity(expired.len());
        for identifier in expired {
            if let Some(request) = self.outstanding.remove(&identifier) {
                self.released.insert(identifier, request.deadline + release_delay);
                requests.push(request);
            }
        }
        requests.sort_by_key(|r| r.address);
        requests
    }

    pub fn is_released(&self, identifier: u16) -> bool {
        self.released.contains_key(&identifier)
    }
}

/// Votes on our WAN address, cast by the `destination_address` peers
/// report seeing us at.
#[derive(Debug, Clone, Default)]
pub struct AddressVotes {
    /// Keyed by voter, so each peer counts once
    votes: HashMap<SocketAddrV4, (SocketAddrV4, Instant)>,
}

impl AddressVotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn vote(&mut self, voter: SocketAddrV4, address: SocketAddrV4, now: Instant) {
        if crate::network::wire::is_valid_address(&address) {
            self.votes.insert(voter, (address, now));
        }
    }

    pub fn expire(&mut self, max_age: Duration, now: Instant) {
        self.votes
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < max_age);
    }

    /// The address a strict majority of voters agree on.
    pub fn majority(&self) -> Option<SocketAddrV4> {
        let mut tally: HashMap<SocketAddrV4, usize> = HashMap::new();
        for (address, _) in self.votes.values() {
            *tally.entry(*address).or_default() += 1;
        }
        let total = self.votes.len();
        tally
            .into_iter()
            .find(|(_, count)| count * 2 > total)
            .map(|(address, _)| address)
    }

    /// Connection type implied by the votes and our LAN address.
    ///
    /// Voters that agree on our IP but disagree on the port indicate a
    /// symmetric NAT.
    pub fn connection_type(&self, lan: &SocketAddrV4) -> ConnectionType {
        let Some(wan) = self.majority() else {
            return ConnectionType::Unknown;
        };
        if wan == *lan {
            return ConnectionType::Public;
        }
        let ip: Ipv4Addr = *wan.ip();
        let ports = self
            .votes
            .values()
            .filter(|(a, _)| *a.ip() == ip)
            .map(|(a, _)| a.port())
            .collect::<std::collections::HashSet<_>>();
        if ports.len() > 1 {
            ConnectionType::SymmetricNat
        } else {
            ConnectionType::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), port)
    }

    #[test]
    fn test_request_matched_by_identifier() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(1);
        let mut walker = WalkerState::new();
        let id = walker.start(addr(1, 1), Duration::from_secs(5), now, &mut rng);
        assert!(walker.is_outstanding(id));
        assert_eq!(walker.complete(id).unwrap().address, addr(1, 1));
        assert!(walker.complete(id).is_none());
    }

    #[test]
    fn test_timeout_holds_identifier_back() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(2);
        let mut walker = WalkerState::new();
        let id = walker.start(addr(1, 1), Duration::from_secs(5), now, &mut rng);

        assert!(walker.expire(Duration::from_secs(10), now + Duration::from_secs(4)).is_empty());
        let expired = walker.expire(Duration::from_secs(10), now + Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert!(!walker.is_outstanding(id));
        assert!(walker.is_released(id));

        walker.expire(Duration::from_secs(10), now + Duration::from_secs(16));
        assert!(!walker.is_released(id));
    }

    #[test]
    fn test_votes_majority() {
        let now = Instant::now();
        let lan = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 7000);
        let mut votes = AddressVotes::new();
        assert_eq!(votes.majority(), None);
        assert_eq!(votes.connection_type(&lan), ConnectionType::Unknown);

        votes.vote(addr(1, 1), addr(50, 7000), now);
        votes.vote(addr(2, 1), addr(50, 7000), now);
        votes.vote(addr(3, 1), addr(51, 7000), now);
        assert_eq!(votes.majority(), Some(addr(50, 7000)));
        assert_eq!(votes.connection_type(&lan), ConnectionType::Unknown);

        votes.expire(Duration::from_secs(1), now + Duration::from_secs(2));
        assert!(votes.is_empty());
    }

    #[test]
    fn test_votes_detect_public_and_symmetric() {
        let now = Instant::now();
        let public = addr(50, 7000);
        let mut votes = AddressVotes::new();
        votes.vote(addr(1, 1), public, now);
        assert_eq!(votes.connection_type(&public), ConnectionType::Public);

        let lan = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 7000);
        let mut votes = AddressVotes::new();
        votes.vote(addr(1, 1), addr(50, 40001), now);
        votes.vote(addr(2, 1), addr(50, 40001), now);
        votes.vote(addr(3, 1), addr(50, 40002), now);
        assert_eq!(votes.connection_type(&lan), ConnectionType::SymmetricNat);
    }
}
