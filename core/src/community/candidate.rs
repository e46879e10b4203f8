//! Candidate table
//!
//! Remembers peers of one community by the address we exchange packets
//! with. A candidate is a *walk* once we sent it an introduction request,
//! a *stumble* once it sent us one, and *introduced* when a third peer
//! told us about it. Bootstrap addresses are kept separately and only used
//! when no other candidate qualifies.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::seq::SliceRandom;

use super::member::Member;

/// How a peer is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionType {
    #[default]
    Unknown,
    Public,
    SymmetricNat,
}

impl ConnectionType {
    /// Two-bit wire value
    pub fn to_bits(self) -> u8 {
        match self {
            ConnectionType::Unknown => 0,
            ConnectionType::Public => 1,
            ConnectionType::SymmetricNat => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(ConnectionType::Unknown),
            1 => Some(ConnectionType::Public),
            2 => Some(ConnectionType::SymmetricNat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Unknown => "unknown",
            ConnectionType::Public => "public",
            ConnectionType::SymmetricNat => "symmetric-NAT",
        }
    }
}

/// A peer address pair and what we know about it.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Address packets are sent to and arrive from
    pub address: SocketAddrV4,
    pub lan_address: SocketAddrV4,
    pub wan_address: SocketAddrV4,
    pub connection_type: ConnectionType,
    /// Last introduction request we sent
    pub last_walk: Option<Instant>,
    /// Last introduction response we received from it
    pub last_walk_reply: Option<Instant>,
    /// Last introduction request it sent us
    pub last_stumble: Option<Instant>,
    /// Last time a peer introduced it to us
    pub last_intro: Option<Instant>,
    pub last_incoming: Option<Instant>,
    pub last_outgoing: Option<Instant>,
    /// Members seen at this address
    pub members: Vec<Arc<Member>>,
}

impl Candidate {
    pub fn new(address: SocketAddrV4) -> Self {
        Self {
            address,
            lan_address: address,
            wan_address: address,
            connection_type: ConnectionType::Unknown,
            last_walk: None,
            last_walk_reply: None,
            last_stumble: None,
            last_intro: None,
            last_incoming: None,
            last_outgoing: None,
            members: Vec::new(),
        }
    }

    pub fn is_walk(&self) -> bool {
        self.last_walk.is_some()
    }

    pub fn is_stumble(&self) -> bool {
        self.last_stumble.is_some()
    }

    pub fn is_introduced(&self) -> bool {
        self.last_intro.is_some()
    }

    /// Most recent sign of life.
    pub fn last_seen(&self) -> Option<Instant> {
        [self.last_incoming, self.last_intro, self.last_walk]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn has_member(&self, member: &Member) -> bool {
        self.members.iter().any(|m| m.database_id == member.database_id)
    }

    fn add_member(&mut self, member: &Arc<Member>) {
        if !self.has_member(member) {
            self.members.push(member.clone());
        }
    }

    fn set_addresses(&mut self, lan: SocketAddrV4, wan: SocketAddrV4, connection_type: ConnectionType) {
        if crate::network::wire::is_valid_address(&lan) {
            self.lan_address = lan;
        }
        if crate::network::wire::is_valid_address(&wan) {
            self.wan_address = wan;
        }
        self.connection_type = connection_type;
    }
}

/// Walk target categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkCategory {
    Walk,
    Stumble,
    Bootstrap,
}

/// Candidates of one community.
#[derive(Debug, Clone, Default)]
pub struct CandidateTable {
    candidates: HashMap<SocketAddrV4, Candidate>,
    bootstrap: Vec<SocketAddrV4>,
}

impl CandidateTable {
    pub fn new(bootstrap: Vec<SocketAddrV4>) -> Self {
        Self {
            candidates: HashMap::new(),
            bootstrap,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn get(&self, address: &SocketAddrV4) -> Option<&Candidate> {
        self.candidates.get(address)
    }

    pub fn contains(&self, address: &SocketAddrV4) -> bool {
        self.candidates.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.values()
    }

    pub fn bootstrap(&self) -> &[SocketAddrV4] {
        &self.bootstrap
    }

    pub fn is_bootstrap(&self, address: &SocketAddrV4) -> bool {
        self.bootstrap.contains(address)
    }

    fn entry(&mut self, address: SocketAddrV4) -> &mut Candidate {
        self.candidates
            .entry(address)
            .or_insert_with(|| Candidate::new(address))
    }

    /// Any packet from a known candidate refreshes it.
    pub fn touch(&mut self, address: &SocketAddrV4, now: Instant) {
        if let Some(candidate) = self.candidates.get_mut(address) {
            candidate.last_incoming = Some(now);
        }
    }

    /// We sent `address` an introduction request.
    pub fn walk(&mut self, address: SocketAddrV4, now: Instant) -> &mut Candidate {
        let candidate = self.entry(address);
        candidate.last_walk = Some(now);
        candidate.last_outgoing = Some(now);
        candidate
    }

    /// `address` answered our introduction request.
    pub fn walk_reply(
        &mut self,
        address: SocketAddrV4,
        lan: SocketAddrV4,
        wan: SocketAddrV4,
        connection_type: ConnectionType,
        member: Option<&Arc<Member>>,
        now: Instant,
    ) {
        let candidate = self.entry(address);
        candidate.set_addresses(lan, wan, connection_type);
        candidate.last_walk_reply = Some(now);
        candidate.last_incoming = Some(now);
        if let Some(member) = member {
            candidate.add_member(member);
        }
    }

    /// `address` sent us an introduction request.
    pub fn stumble(
        &mut self,
        address: SocketAddrV4,
        lan: SocketAddrV4,
        wan: SocketAddrV4,
        connection_type: ConnectionType,
        member: Option<&Arc<Member>>,
        now: Instant,
    ) {
        let candidate = self.entry(address);
        candidate.set_addresses(lan, wan, connection_type);
        candidate.last_stumble = Some(now);
        candidate.last_incoming = Some(now);
        if let Some(member) = member {
            candidate.add_member(member);
        }
    }

    /// A third peer told us about `address`. Returns true when it was new.
    pub fn introduce(&mut self, address: SocketAddrV4, lan: SocketAddrV4, wan: SocketAddrV4, now: Instant) -> bool {
        let new = !self.candidates.contains_key(&address);
        let candidate = self.entry(address);
        if new {
            candidate.set_addresses(lan, wan, ConnectionType::Unknown);
        }
        candidate.last_intro = Some(now);
        new
    }

    /// `address` sent us a puncture.
    pub fn punctured(&mut self, address: SocketAddrV4, lan: SocketAddrV4, wan: SocketAddrV4, now: Instant) {
        let candidate = self.entry(address);
        if candidate.last_walk_reply.is_none() && candidate.last_stumble.is_none() {
            candidate.set_addresses(lan, wan, candidate.connection_type);
        }
        candidate.last_incoming = Some(now);
    }

    pub fn sent_to(&mut self, address: &SocketAddrV4, now: Instant) {
        if let Some(candidate) = self.candidates.get_mut(address) {
            candidate.last_outgoing = Some(now);
        }
    }

    /// Record that `member` is reachable at `address`.
    pub fn add_member(&mut self, address: &SocketAddrV4, member: &Arc<Member>) {
        if let Some(candidate) = self.candidates.get_mut(address) {
            candidate.add_member(member);
        }
    }

    pub fn remove(&mut self, address: &SocketAddrV4) -> Option<Candidate> {
        self.candidates.remove(address)
    }

    /// Addresses where `member` was seen.
    pub fn addresses_of(&self, member: &Member) -> Vec<SocketAddrV4> {
        let mut addresses: Vec<SocketAddrV4> = self
            .candidates
            .values()
            .filter(|c| c.has_member(member))
            .map(|c| c.address)
            .collect();
        addresses.sort();
        addresses
    }

    /// Pick the next walk target, skipping `exclude`.
    ///
    /// Walks and stumbles (including introduced peers) are chosen with equal
    /// probability of 49% each; the rest falls to the bootstrap list. An empty
    /// category falls through to the next one.
    pub fn walk_target<R: Rng>(&self, exclude: &[SocketAddrV4], rng: &mut R) -> Option<(SocketAddrV4, WalkCategory)> {
        let mut walks = Vec::new();
        let mut stumbles = Vec::new();
        for candidate in self.candidates.values() {
            if exclude.contains(&candidate.address) {
                continue;
            }
            if candidate.is_walk() {
                walks.push(candidate.address);
            } else if candidate.is_stumble() || candidate.is_introduced() {
                stumbles.push(candidate.address);
            }
        }
        // HashMap order is not stable between runs
        walks.sort();
        stumbles.sort();
        let bootstrap: Vec<SocketAddrV4> = self
            .bootstrap
            .iter()
            .filter(|a| !exclude.contains(a))
            .copied()
            .collect();

        let roll: f64 = rng.gen();
        let order = if roll < 0.49 {
            [WalkCategory::Walk, WalkCategory::Stumble, WalkCategory::Bootstrap]
        } else if roll < 0.98 {
            [WalkCategory::Stumble, WalkCategory::Walk, WalkCategory::Bootstrap]
        } else {
            [WalkCategory::Bootstrap, WalkCategory::Walk, WalkCategory::Stumble]
        };
        for category in order {
            let pool = match category {
                WalkCategory::Walk => &walks,
                WalkCategory::Stumble => &stumbles,
                WalkCategory::Bootstrap => &bootstrap,
            };
            if let Some(address) = pool.choose(rng) {
                return Some((*address, category));
            }
        }
        None
    }

    /// Pick a candidate to introduce to `requester`.
    ///
    /// Two symmetric NATs cannot reach each other, so such pairs are skipped.
    pub fn introduction_target<R: Rng>(
        &self,
        requester: &SocketAddrV4,
        requester_type: ConnectionType,
        rng: &mut R,
    ) -> Option<&Candidate> {
        let mut pool: Vec<&Candidate> = self
            .candidates
            .values()
            .filter(|c| c.address != *requester)
            .filter(|c| c.is_walk() || c.is_stumble())
            .filter(|c| c.last_incoming.is_some())
            .filter(|c| {
                !(requester_type == ConnectionType::SymmetricNat
                    && c.connection_type == ConnectionType::SymmetricNat)
            })
            .collect();
        pool.sort_by_key(|c| c.address);
        pool.choose(rng).copied()
    }

    /// Up to `count` random candidates that have been heard from.
    pub fn random_peers<R: Rng>(&self, count: usize, filter: impl Fn(&Candidate) -> bool, rng: &mut R) -> Vec<SocketAddrV4> {
        let mut pool: Vec<SocketAddrV4> = self
            .candidates
            .values()
            .filter(|c| c.last_incoming.is_some() || c.last_walk.is_some())
            .filter(|c| filter(*c))
            .map(|c| c.address)
            .collect();
        pool.sort();
        pool.shuffle(rng);
        pool.truncate(count);
        pool
    }

    /// Remove candidates silent for longer than `max_age`.
    pub fn cleanup(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.candidates.len();
        self.candidates.retain(|_, c| match c.last_seen() {
            Some(seen) => now.saturating_duration_since(seen) < max_age,
            None => false,
        });
        before - self.candidates.len()
    }
}
