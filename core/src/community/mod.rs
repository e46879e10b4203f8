//! Communities
//!
//! A community owns its meta messages, wire conversions, sync ranges,
//! permission timeline, candidate table and walker state. Behaviour that
//! differs between communities is supplied through [`CommunityHooks`]; the
//! runtime provides everything else.
//!
//! # Loading
//!
//! Building a community from its persisted row registers every meta
//! message in the database, then replays the stored authorize, revoke,
//! dynamic-settings and subjective-set packets and feeds every stored
//! packet into the sync ranges.

pub mod candidate;
pub mod member;
pub mod sync_range;
pub mod timeline;
pub mod walker;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rusqlite::Connection;
use tracing::debug;

use crate::data::community::CommunityRow;
use crate::data::meta_message::get_or_insert_meta_message;
use crate::data::sync::{get_all_packets, get_packets_of_meta, max_global_time};
use crate::message::{
    DispersyMessage, Message, MetaKind, MetaMessage, MetaMessageError, Verdict,
};
use crate::network::bloom::BloomFilter;
use crate::network::conversion::{Conversion, DecodeContext, PREFIX_LENGTH};
use crate::network::payload::{DestroyDegree, Payload};
use crate::protocol::config::DispersyConfig;
use crate::protocol::error::DispersyError;
use crate::security::digest::Mid;

use candidate::CandidateTable;
use member::{Member, MemberCache, MyMember};
use sync_range::SyncRanges;
use timeline::Timeline;
use walker::WalkerState;

/// Wire ids of one conversion version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionSpec {
    pub version: u8,
    /// Application meta message name to wire id
    pub assignments: Vec<(String, u8)>,
}

/// Community-specific behaviour.
pub trait CommunityHooks: Send + 'static {
    /// Persisted name used to pick the factory when loading
    fn classification(&self) -> &'static str;

    /// Application meta messages. The Dispersy messages are added by the runtime.
    fn initiate_meta_messages(&self) -> Result<Vec<MetaMessage>, MetaMessageError>;

    /// Conversions, oldest first. The last one encodes outgoing messages.
    fn initiate_conversions(&self, metas: &[Arc<MetaMessage>]) -> Vec<ConversionSpec> {
        let assignments = metas
            .iter()
            .filter(|m| m.kind == MetaKind::Application)
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i as u8 + 1))
            .collect();
        vec![ConversionSpec {
            version: 1,
            assignments,
        }]
    }

    /// Application check, after the runtime checks passed.
    fn check_message(&mut self, _message: &Message) -> Verdict {
        Verdict::Accept
    }

    /// Accepted (and, when synced, stored) application messages.
    fn on_messages(&mut self, _messages: &[Message]) {}

    /// `undone` was undone by `by`.
    fn undo_message(&mut self, _undone: &Message, _by: &Message) {}

    /// Whether to co-sign a message another member asks us to sign.
    fn allow_signature_request(&mut self, _message: &Message) -> bool {
        false
    }

    fn on_destroyed(&mut self, _degree: DestroyDegree) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Builds hooks for a persisted community of one classification.
pub type CommunityFactory = Box<dyn Fn() -> Box<dyn CommunityHooks> + Send>;

/// A loaded community.
pub struct Community {
    pub(crate) database_id: i64,
    pub(crate) cid: Mid,
    pub(crate) master: Arc<Member>,
    pub(crate) my_member: MyMember,
    classification: String,
    metas: Vec<Arc<MetaMessage>>,
    conversions: Vec<Conversion>,
    pub(crate) global_time: u64,
    pub(crate) timeline: Timeline,
    pub(crate) sync_ranges: SyncRanges,
    pub(crate) candidates: CandidateTable,
    pub(crate) walker: WalkerState,
    pub(crate) destroyed: Option<(DestroyDegree, u64)>,
    /// Latest subjective set per (member id, cluster)
    pub(crate) subjective_sets: HashMap<(i64, u8), BloomFilter>,
    pub(crate) hooks: Box<dyn CommunityHooks>,
}

impl std::fmt::Debug for Community {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Community")
            .field("cid", &hex::encode(self.cid))
            .field("classification", &self.classification)
            .field("global_time", &self.global_time)
            .field("candidates", &self.candidates.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl Community {
    /// Build a community from its persisted row.
    pub(crate) fn load<R: Rng>(
        conn: &Connection,
        members: &mut MemberCache,
        config: &DispersyConfig,
        rng: &mut R,
        row: &CommunityRow,
        my_member: MyMember,
        hooks: Box<dyn CommunityHooks>,
    ) -> Result<Self, DispersyError> {
        let master = members
            .get(conn, row.master_member_id)?
            .ok_or_else(|| DispersyError::Database(format!("master member {} missing", row.master_member_id)))?;

        let mut metas: Vec<Arc<MetaMessage>> = Vec::new();
        let definitions = DispersyMessage::ALL
            .iter()
            .map(|kind| kind.meta())
            .chain(hooks.initiate_meta_messages()?);
        for mut meta in definitions {
            if metas.iter().any(|m| m.name == meta.name) {
                return Err(MetaMessageError::DuplicateName(meta.name).into());
            }
            meta.check_compatibility()?;
            meta.database_id = get_or_insert_meta_message(
                conn,
                row.id,
                &meta.name,
                meta.distribution.cluster(),
                meta.priority,
                meta.distribution.direction().as_i8(),
            )?;
            metas.push(Arc::new(meta));
        }

        let mut conversions = Vec::new();
        for spec in hooks.initiate_conversions(&metas) {
            conversions.push(Conversion::new(row.cid, spec.version, &metas, &spec.assignments)?);
        }
        if conversions.is_empty() {
            return Err(DispersyError::InvalidInput("community defines no conversion".to_string()));
        }

        let destroyed = match (row.destroyed_degree, row.destroyed_global_time) {
            (Some(0), Some(gt)) => Some((DestroyDegree::SoftKill, gt)),
            (Some(_), Some(gt)) => Some((DestroyDegree::HardKill, gt)),
            _ => None,
        };

        let mut community = Self {
            database_id: row.id,
            cid: row.cid,
            master: master.clone(),
            my_member,
            classification: row.classification.clone(),
            metas,
            conversions,
            global_time: max_global_time(conn, row.id)?,
            timeline: Timeline::new(master.database_id),
            sync_ranges: SyncRanges::new(config.bloom_bits, config.bloom_error_rate, rng)?,
            candidates: CandidateTable::new(config.bootstrap.clone()),
            walker: WalkerState::new(),
            destroyed,
            subjective_sets: HashMap::new(),
            hooks,
        };
        community.replay(conn, members, rng)?;
        Ok(community)
    }

    /// Rebuild timeline, subjective sets and sync ranges from the store.
    fn replay<R: Rng>(&mut self, conn: &Connection, members: &mut MemberCache, rng: &mut R) -> Result<(), DispersyError> {
        let kinds = [
            DispersyMessage::Authorize,
            DispersyMessage::Revoke,
            DispersyMessage::DynamicSettings,
            DispersyMessage::SubjectiveSet,
        ];
        let mut replayed = 0;
        for kind in kinds {
            let Some(meta) = self.get_meta_message(kind.name()).cloned() else {
                continue;
            };
            for stored in get_packets_of_meta(conn, self.database_id, meta.database_id)? {
                let mut ctx = DecodeContext {
                    conn,
                    members: &mut *members,
                    community_id: self.database_id,
                };
                let Some(conversion) = self.get_conversion(&stored.packet) else {
                    continue;
                };
                match conversion.decode(&stored.packet, None, &mut ctx) {
                    Ok(message) => {
                        self.apply_replayed(&message);
                        replayed += 1;
                    }
                    Err(rejection) => {
                        debug!(community = %hex::encode(self.cid), %rejection, "skipping stored packet");
                    }
                }
            }
        }

        let packets = get_all_packets(conn, self.database_id)?;
        self.sync_ranges.rebuild(&packets, rng)?;
        debug!(
            community = %hex::encode(self.cid),
            replayed,
            packets = packets.len(),
            "community state replayed"
        );
        Ok(())
    }

    fn apply_replayed(&mut self, message: &Message) {
        match &message.payload {
            Payload::Authorize { .. } | Payload::Revoke { .. } => self.timeline.apply_permissions(message),
            Payload::DynamicSettings { policies } => {
                for (meta, index) in policies {
                    self.timeline
                        .set_resolution_policy(meta.database_id, *index, message.global_time, &message.packet);
                }
            }
            Payload::SubjectiveSet { cluster, filter } => {
                if let Some(member) = message.member() {
                    self.subjective_sets
                        .insert((member.database_id, *cluster), filter.clone());
                }
            }
            _ => {}
        }
    }

    pub fn cid(&self) -> &Mid {
        &self.cid
    }

    pub fn database_id(&self) -> i64 {
        self.database_id
    }

    pub fn classification(&self) -> &str {
        &self.classification
    }

    pub fn master(&self) -> &Arc<Member> {
        &self.master
    }

    pub fn my_member(&self) -> &MyMember {
        &self.my_member
    }

    pub fn global_time(&self) -> u64 {
        self.global_time
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn candidates(&self) -> &CandidateTable {
        &self.candidates
    }

    pub fn walker(&self) -> &WalkerState {
        &self.walker
    }

    pub fn sync_ranges(&self) -> &SyncRanges {
        &self.sync_ranges
    }

    pub fn destroyed(&self) -> Option<(DestroyDegree, u64)> {
        self.destroyed
    }

    pub fn is_hard_killed(&self) -> bool {
        matches!(self.destroyed, Some((DestroyDegree::HardKill, _)))
    }

    pub fn meta_messages(&self) -> &[Arc<MetaMessage>] {
        &self.metas
    }

    pub fn get_meta_message(&self, name: &str) -> Option<&Arc<MetaMessage>> {
        self.metas.iter().find(|m| m.name == name)
    }

    pub fn meta_by_database_id(&self, id: i64) -> Option<&Arc<MetaMessage>> {
        self.metas.iter().find(|m| m.database_id == id)
    }

    pub(crate) fn dispersy_meta(&self, kind: DispersyMessage) -> Result<Arc<MetaMessage>, DispersyError> {
        self.get_meta_message(kind.name())
            .cloned()
            .ok_or_else(|| DispersyError::UnknownMeta(kind.name().to_string()))
    }

    /// The conversion matching the first 22 bytes of `packet`.
    pub fn get_conversion(&self, packet: &[u8]) -> Option<&Conversion> {
        let prefix = packet.get(..PREFIX_LENGTH)?;
        self.conversions.iter().find(|c| c.prefix() == prefix)
    }

    /// The conversion used for outgoing messages.
    pub fn conversion(&self) -> &Conversion {
        // `load` refuses communities without a conversion
        &self.conversions[self.conversions.len() - 1]
    }

    /// Claim the next global time for a message we create.
    pub(crate) fn claim_global_time(&mut self) -> Result<u64, DispersyError> {
        self.global_time = self
            .global_time
            .checked_add(1)
            .ok_or(DispersyError::GlobalTimeExhausted)?;
        Ok(self.global_time)
    }

    /// Highest global time a received message may claim.
    pub(crate) fn acceptable_global_time(&self, range: u64) -> u64 {
        self.global_time.saturating_add(range)
    }

    pub(crate) fn update_global_time(&mut self, global_time: u64) {
        self.global_time = self.global_time.max(global_time);
    }

    /// The subjective set of `member` for `cluster`, if one was received.
    pub fn subjective_set(&self, member: &Member, cluster: u8) -> Option<&BloomFilter> {
        self.subjective_sets.get(&(member.database_id, cluster))
    }

    pub fn hooks(&self) -> &dyn CommunityHooks {
        self.hooks.as_ref()
    }

    /// The hooks as their concrete type.
    pub fn hooks_as<T: 'static>(&self) -> Option<&T> {
        self.hooks.as_any().downcast_ref::<T>()
    }

    pub fn hooks_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.hooks.as_any_mut().downcast_mut::<T>()
    }
}
