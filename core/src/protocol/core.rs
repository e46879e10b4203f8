//! Dispersy runtime
//!
//! `Dispersy` is a sans-IO state machine. It owns the database connection,
//! the member cache, the loaded communities and an outbox of packets.
//! Every entry point takes the current time; the caller moves packets
//! between the outbox and the network. Implementation is split across:
//! - `protocol/` (this module): core struct, community lifecycle, public methods
//! - `handlers/`: the packet dispatcher and per-message handlers
//! - `tasks/`: walker, sync and maintenance rounds

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::community::candidate::ConnectionType;
use crate::community::member::{MemberCache, MyMember};
use crate::community::timeline::Timeline;
use crate::community::walker::AddressVotes;
use crate::community::{Community, CommunityFactory, CommunityHooks};
use crate::data::community::{get_auto_load_communities, get_community_by_cid, insert_community, CommunityRow};
use crate::data::identity::get_or_create_local_member;
use crate::data::routing::{load_routing, save_routing, RoutingEntry};
use crate::data::start::start_db;
use crate::handlers;
use crate::handlers::footprint::{Continuation, Footprint, FootprintRegistry};
use crate::handlers::signature::SignatureRequests;
use crate::message::{DispersyMessage, Message, Target};
use crate::network::payload::{Payload, PermissionTriple};
use crate::resilience::RateLimiter;
use crate::security::create_key_pair::key_pair_from_rng;
use crate::security::digest::{mid_from_public_key, Mid};

use super::config::DispersyConfig;
use super::create::build_message;
use super::error::DispersyError;
use super::send::store_update_forward;
use super::stats::DispersyStats;

/// Continuation invoked with the awaited message, or `None` on timeout.
pub type MessageCallback = Box<dyn FnOnce(&mut Dispersy, Option<Message>, Instant) + Send>;

/// Upper bound on redrive/callback rounds after one entry point
const MAX_DRAIN_ROUNDS: usize = 1024;

/// A packet waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub address: SocketAddrV4,
    pub packet: Vec<u8>,
}

/// State shared by every community.
pub(crate) struct Runtime {
    pub config: DispersyConfig,
    pub conn: Connection,
    pub members: MemberCache,
    pub my_member: MyMember,
    pub lan_address: SocketAddrV4,
    pub wan_address: SocketAddrV4,
    pub connection_type: ConnectionType,
    pub votes: AddressVotes,
    pub outbox: Vec<Outgoing>,
    pub rng: StdRng,
    pub rate_limiter: RateLimiter,
    pub footprints: FootprintRegistry,
    pub signatures: SignatureRequests,
    pub stats: DispersyStats,
    /// Callbacks released by the last packet, fired after it
    pub ready: Vec<(MessageCallback, Option<Message>)>,
    /// Delayed packets released by the last packet
    pub redrive: Vec<(SocketAddrV4, Vec<u8>)>,
}

impl Runtime {
    pub fn is_own_address(&self, address: &SocketAddrV4) -> bool {
        *address == self.lan_address || *address == self.wan_address
    }

    /// Queue a packet, skipping our own and unusable addresses.
    pub fn send(&mut self, address: SocketAddrV4, packet: Vec<u8>) {
        if !crate::network::wire::is_valid_address(&address) || self.is_own_address(&address) {
            debug!(%address, "not sending to own or invalid address");
            return;
        }
        self.stats.packets.sent_packets += 1;
        self.stats.packets.sent_bytes += packet.len() as u64;
        self.outbox.push(Outgoing { address, packet });
    }

    /// Queue a continuation released by a message (or its timeout).
    pub fn release(&mut self, continuation: Continuation, message: Option<&Message>) {
        match continuation {
            Continuation::Redrive { source, packet } => {
                if message.is_some() {
                    self.redrive.push((source, packet));
                } else {
                    debug!(%source, len = packet.len(), "delayed packet timed out");
                }
            }
            Continuation::Callback(callback) => self.ready.push((callback, message.cloned())),
        }
    }

    /// Apply a WAN address vote and re-derive our connection type.
    pub fn vote_wan_address(&mut self, voter: SocketAddrV4, address: SocketAddrV4, now: Instant) {
        if self.is_own_address(&voter) {
            return;
        }
        self.votes.vote(voter, address, now);
        if let Some(wan) = self.votes.majority() {
            if wan != self.wan_address {
                info!(old = %self.wan_address, new = %wan, "WAN address changed");
                self.wan_address = wan;
            }
        }
        self.connection_type = self.votes.connection_type(&self.lan_address);
    }
}

/// The Dispersy runtime
///
/// Owns every community and all shared state. Not thread safe on purpose;
/// `Session` runs it on a single event loop.
pub struct Dispersy {
    pub(crate) rt: Runtime,
    pub(crate) communities: HashMap<Mid, Community>,
    factories: HashMap<String, CommunityFactory>,
}

impl std::fmt::Debug for Dispersy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispersy")
            .field("member", &hex::encode(self.rt.my_member.member.mid))
            .field("lan_address", &self.rt.lan_address)
            .field("wan_address", &self.rt.wan_address)
            .field("communities", &self.communities.len())
            .finish_non_exhaustive()
    }
}

impl Dispersy {
    /// Open (or create) the database from the config and start.
    pub fn open(config: DispersyConfig) -> Result<Self, DispersyError> {
        let db_path = config.resolved_db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = start_db(&db_path)?;
        info!(path = %db_path.display(), "database opened");
        Self::with_connection(conn, config)
    }

    /// Start on an already opened database.
    pub fn with_connection(conn: Connection, config: DispersyConfig) -> Result<Self, DispersyError> {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let key_pair = get_or_create_local_member(&conn, &mut rng)?;
        let mut members = MemberCache::new();
        let my_member = members.register_key_pair(&conn, &key_pair)?;
        let lan_address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.port);
        let rate_limiter = RateLimiter::with_config(config.rate_limit());

        info!(
            member = %hex::encode(my_member.member.mid),
            port = config.port,
            "dispersy started"
        );

        Ok(Self {
            rt: Runtime {
                config,
                conn,
                members,
                my_member,
                lan_address,
                wan_address: lan_address,
                connection_type: ConnectionType::Unknown,
                votes: AddressVotes::new(),
                outbox: Vec::new(),
                rng,
                rate_limiter,
                footprints: FootprintRegistry::new(),
                signatures: SignatureRequests::new(),
                stats: DispersyStats::default(),
                ready: Vec::new(),
                redrive: Vec::new(),
            },
            communities: HashMap::new(),
            factories: HashMap::new(),
        })
    }

    pub fn config(&self) -> &DispersyConfig {
        &self.rt.config
    }

    pub fn my_member(&self) -> &MyMember {
        &self.rt.my_member
    }

    pub fn lan_address(&self) -> SocketAddrV4 {
        self.rt.lan_address
    }

    pub fn wan_address(&self) -> SocketAddrV4 {
        self.rt.wan_address
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.rt.connection_type
    }

    /// Set the address our socket is bound to.
    ///
    /// The WAN address follows until peers vote otherwise.
    pub fn set_lan_address(&mut self, address: SocketAddrV4) {
        if self.rt.votes.is_empty() {
            self.rt.wan_address = address;
        }
        self.rt.lan_address = address;
    }

    pub fn connection(&self) -> &Connection {
        &self.rt.conn
    }

    /// Register how communities of `classification` are rebuilt on load.
    pub fn register_classification(&mut self, classification: &str, factory: CommunityFactory) {
        self.factories.insert(classification.to_string(), factory);
    }

    pub fn community(&self, cid: &Mid) -> Option<&Community> {
        self.communities.get(cid)
    }

    pub fn community_mut(&mut self, cid: &Mid) -> Option<&mut Community> {
        self.communities.get_mut(cid)
    }

    pub fn communities(&self) -> impl Iterator<Item = &Community> {
        self.communities.values()
    }

    /// Loaded cids, sorted.
    pub fn community_ids(&self) -> Vec<Mid> {
        let mut cids: Vec<Mid> = self.communities.keys().copied().collect();
        cids.sort();
        cids
    }

    pub(crate) fn split(&mut self, cid: &Mid) -> Result<(&mut Runtime, &mut Community), DispersyError> {
        let community = self
            .communities
            .get_mut(cid)
            .ok_or_else(|| DispersyError::UnknownCommunity(hex::encode(cid)))?;
        Ok((&mut self.rt, community))
    }

    /// Packets waiting to be sent.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.rt.outbox)
    }

    /// Queue a raw packet.
    pub fn send_packet(&mut self, address: SocketAddrV4, packet: Vec<u8>) {
        self.rt.send(address, packet);
    }

    /// Handle one received datagram.
    pub fn on_packet(&mut self, source: SocketAddrV4, packet: &[u8], now: Instant) {
        handlers::dispatch(self, source, packet, now);
        self.drain(now);
    }

    /// Run released redrives and callbacks until nothing is left.
    pub(crate) fn drain(&mut self, now: Instant) {
        for _ in 0..MAX_DRAIN_ROUNDS {
            let redrive = std::mem::take(&mut self.rt.redrive);
            let ready = std::mem::take(&mut self.rt.ready);
            if redrive.is_empty() && ready.is_empty() {
                return;
            }
            for (source, packet) in redrive {
                handlers::dispatch(self, source, &packet, now);
            }
            for (callback, message) in ready {
                callback(self, message, now);
            }
        }
        warn!(rounds = MAX_DRAIN_ROUNDS, "stopped draining continuations");
    }

    /// Call `callback` when a message matching `footprint` is accepted, or
    /// with `None` once `timeout` passes.
    pub fn await_message(
        &mut self,
        footprint: Footprint,
        timeout: Duration,
        callback: MessageCallback,
        now: Instant,
    ) {
        self.rt
            .footprints
            .register(footprint, now + timeout, Continuation::Callback(callback));
    }

    /// Create a community with a fresh master key, becoming its founder.
    pub fn create_community(
        &mut self,
        hooks: Box<dyn CommunityHooks>,
        now: Instant,
    ) -> Result<Mid, DispersyError> {
        let master_key = key_pair_from_rng(&mut self.rt.rng);
        let master = self.rt.members.register_key_pair(&self.rt.conn, &master_key)?;
        let cid = mid_from_public_key(&master_key.public_key);
        let row = self.insert_row(&cid, master.member.database_id, hooks.classification(), &master_key.public_key)?;
        self.install(&row, hooks)?;

        let (rt, community) = self.split(&cid)?;
        let grants = Timeline::founder_permissions(community.meta_messages());
        if !grants.is_empty() {
            let permissions = grants
                .into_iter()
                .map(|(meta, permission)| PermissionTriple {
                    member: rt.my_member.member.clone(),
                    meta,
                    permission,
                })
                .collect();
            let meta = community.dispersy_meta(DispersyMessage::Authorize)?;
            let message = build_message(
                rt,
                community,
                &meta,
                vec![master.member.clone()],
                &[Some(&master.key_pair)],
                Payload::Authorize { permissions },
                Target::Community,
                None,
            )?;
            store_update_forward(rt, community, message, now)?;
        }
        super::create::create_identity(rt, community, now)?;

        info!(community = %hex::encode(cid), classification = %row.classification, "community created");
        self.drain(now);
        Ok(cid)
    }

    /// Join an existing community knowing only its master public key.
    pub fn join_community(
        &mut self,
        master_public_key: &[u8],
        hooks: Box<dyn CommunityHooks>,
        now: Instant,
    ) -> Result<Mid, DispersyError> {
        if !MemberCache::is_valid_public_key(master_public_key) {
            return Err(DispersyError::InvalidInput(format!(
                "master public key must be 32 bytes, got {}",
                master_public_key.len()
            )));
        }
        let master = self.rt.members.get_or_create(&self.rt.conn, master_public_key)?;
        let cid = mid_from_public_key(master_public_key);
        let row = self.insert_row(&cid, master.database_id, hooks.classification(), master_public_key)?;
        self.install(&row, hooks)?;

        let (rt, community) = self.split(&cid)?;
        super::create::create_identity(rt, community, now)?;

        info!(community = %hex::encode(cid), classification = %row.classification, "community joined");
        self.drain(now);
        Ok(cid)
    }

    fn insert_row(
        &mut self,
        cid: &Mid,
        master_id: i64,
        classification: &str,
        public_key: &[u8],
    ) -> Result<CommunityRow, DispersyError> {
        if self.communities.contains_key(cid) || get_community_by_cid(&self.rt.conn, cid)?.is_some() {
            return Err(DispersyError::CommunityExists(hex::encode(cid)));
        }
        insert_community(
            &self.rt.conn,
            cid,
            master_id,
            self.rt.my_member.member.database_id,
            classification,
            public_key,
        )?;
        get_community_by_cid(&self.rt.conn, cid)?
            .ok_or_else(|| DispersyError::Database(format!("community {} not persisted", hex::encode(cid))))
    }

    fn install(&mut self, row: &CommunityRow, hooks: Box<dyn CommunityHooks>) -> Result<(), DispersyError> {
        let my_member = self.rt.my_member.clone();
        let community = Community::load(
            &self.rt.conn,
            &mut self.rt.members,
            &self.rt.config,
            &mut self.rt.rng,
            row,
            my_member,
            hooks,
        )?;
        self.communities.insert(row.cid, community);
        Ok(())
    }

    /// Load every persisted community whose classification is registered.
    ///
    /// Saved candidates seed the walker.
    pub fn load_communities(&mut self, now: Instant) -> Result<Vec<Mid>, DispersyError> {
        let mut loaded = Vec::new();
        for row in get_auto_load_communities(&self.rt.conn)? {
            if self.communities.contains_key(&row.cid) {
                continue;
            }
            let Some(factory) = self.factories.get(&row.classification) else {
                debug!(community = %hex::encode(row.cid), classification = %row.classification, "no factory registered");
                continue;
            };
            let hooks = factory();
            let my_member = match self.rt.members.get(&self.rt.conn, row.my_member_id)? {
                Some(member) => self.rt.members.my_member(&self.rt.conn, &member)?,
                None => None,
            };
            let Some(my_member) = my_member else {
                warn!(community = %hex::encode(row.cid), "private key of my member missing, skipping");
                continue;
            };
            let community = Community::load(
                &self.rt.conn,
                &mut self.rt.members,
                &self.rt.config,
                &mut self.rt.rng,
                &row,
                my_member,
                hooks,
            )?;
            self.communities.insert(row.cid, community);
            self.restore_routing(&row.cid, now)?;
            info!(community = %hex::encode(row.cid), classification = %row.classification, "community loaded");
            loaded.push(row.cid);
        }
        Ok(loaded)
    }

    /// Save routing and drop a community from memory.
    ///
    /// Its delayed packets are discarded and its waiting callbacks fire
    /// with `None`.
    pub fn unload_community(&mut self, cid: &Mid, now: Instant) -> Result<(), DispersyError> {
        self.save_routing(cid, now)?;
        self.communities
            .remove(cid)
            .ok_or_else(|| DispersyError::UnknownCommunity(hex::encode(cid)))?;
        for continuation in self.rt.footprints.cancel_community(cid) {
            self.rt.release(continuation, None);
        }
        for callback in self.rt.signatures.cancel_community(cid) {
            self.rt.ready.push((callback, None));
        }
        info!(community = %hex::encode(cid), "community unloaded");
        self.drain(now);
        Ok(())
    }

    /// Persist the candidate table of a community.
    pub(crate) fn save_routing(&mut self, cid: &Mid, now: Instant) -> Result<(), DispersyError> {
        let (rt, community) = self.split(cid)?;
        let entries: Vec<RoutingEntry> = community
            .candidates
            .iter()
            .filter(|c| !community.candidates.is_bootstrap(&c.address))
            .map(|c| RoutingEntry {
                address: c.address,
                incoming_time: c.last_incoming.map(|t| unix_secs(t, now)).unwrap_or(0),
                outgoing_time: c.last_outgoing.map(|t| unix_secs(t, now)).unwrap_or(0),
            })
            .collect();
        save_routing(&rt.conn, community.database_id, &entries)?;
        Ok(())
    }

    fn restore_routing(&mut self, cid: &Mid, now: Instant) -> Result<(), DispersyError> {
        let (rt, community) = self.split(cid)?;
        let since = unix_secs(now, now) - rt.config.candidate_cleanup_age_secs as i64;
        let entries = load_routing(&rt.conn, community.database_id, since)?;
        let count = entries.len();
        for entry in entries {
            if !rt.is_own_address(&entry.address) {
                community
                    .candidates
                    .introduce(entry.address, entry.address, entry.address, now);
            }
        }
        debug!(community = %hex::encode(cid), count, "routing restored");
        Ok(())
    }

    /// Flush routing of every community. Called when the session stops.
    pub fn shutdown(&mut self, now: Instant) -> Result<(), DispersyError> {
        for cid in self.community_ids() {
            self.save_routing(&cid, now)?;
        }
        info!(communities = self.communities.len(), "dispersy stopped");
        Ok(())
    }
}

/// Unix seconds of `at`, given that `now` is the present.
fn unix_secs(at: Instant, now: Instant) -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let ago = now.saturating_duration_since(at).as_secs() as i64;
    wall - ago
}
