//! Message creation
//!
//! Messages we author claim the next global time of their community (direct
//! messages reuse the current one), take the next sequence number when the
//! meta asks for one, and are checked against the timeline before they are
//! signed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::community::Community;
use crate::community::member::Member;
use crate::community::timeline::Permission;
use crate::data::sync::{get_packet_at, highest_sequence};
use crate::handlers::signature::start_signature_request;
use crate::message::{Authentication, DispersyMessage, Message, MetaMessage, Target};
use crate::network::bloom::BloomFilter;
use crate::network::encoding::Value;
use crate::network::payload::{DestroyDegree, Payload, PermissionTriple, UndoPayload};
use crate::security::create_key_pair::KeyPair;
use crate::security::digest::Mid;

use super::core::{Dispersy, MessageCallback, Runtime};
use super::error::DispersyError;
use super::send::store_update_forward;

/// Build and sign a message without storing or sending it.
///
/// `keys` holds one entry per member; slots without a key stay zero.
/// `global_time` overrides the claimed global time.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_message(
    rt: &mut Runtime,
    community: &mut Community,
    meta: &Arc<MetaMessage>,
    members: Vec<Arc<Member>>,
    keys: &[Option<&KeyPair>],
    payload: Payload,
    target: Target,
    global_time: Option<u64>,
) -> Result<Message, DispersyError> {
    if community.is_hard_killed() {
        return Err(DispersyError::Destroyed);
    }

    let global_time = match global_time {
        Some(global_time) => {
            community.update_global_time(global_time);
            global_time
        }
        None if meta.distribution.is_synced() => community.claim_global_time()?,
        None => community.global_time.max(1),
    };
    if let Some((DestroyDegree::SoftKill, frozen_at)) = community.destroyed {
        if meta.distribution.is_synced() && global_time > frozen_at {
            return Err(DispersyError::Destroyed);
        }
    }

    let sequence_number = match (meta.distribution.has_sequence_number(), members.first()) {
        (true, Some(author)) => Some(
            highest_sequence(&rt.conn, community.database_id, author.database_id, meta.database_id)? + 1,
        ),
        _ => None,
    };
    let resolution_index = meta
        .resolution
        .is_dynamic()
        .then(|| community.timeline.resolution_policy(meta.database_id, global_time).0);

    let mut message = Message {
        meta: meta.clone(),
        cid: community.cid,
        community_version: community.conversion().community_version(),
        members,
        signatures: Vec::new(),
        resolution_index,
        global_time,
        sequence_number,
        target,
        payload,
        packet: Vec::new(),
        packet_id: None,
        source: None,
    };

    let check = community
        .timeline
        .check(&message, |id| community.meta_by_database_id(id).map(|m| m.database_id));
    if !check.allowed {
        return Err(DispersyError::NotPermitted(meta.name.clone()));
    }

    community.conversion().encode(&mut message, keys)?;
    Ok(message)
}

/// Build a message signed by my member of the community.
pub(crate) fn build_own_message(
    rt: &mut Runtime,
    community: &mut Community,
    meta: &Arc<MetaMessage>,
    payload: Payload,
    target: Target,
    global_time: Option<u64>,
) -> Result<Message, DispersyError> {
    let me = community.my_member.clone();
    let (members, keys) = match meta.authentication {
        Authentication::NoAuthentication => (Vec::new(), Vec::new()),
        Authentication::Member { .. } => (vec![me.member.clone()], vec![Some(&me.key_pair)]),
        Authentication::MultiMember { .. } => {
            return Err(DispersyError::InvalidInput(format!(
                "{} needs several signers, use a signature request",
                meta.name
            )));
        }
    };
    build_message(rt, community, meta, members, &keys, payload, target, global_time)
}

/// Build a reserved Dispersy message signed by my member (or unsigned).
pub(crate) fn build_dispersy_message(
    rt: &mut Runtime,
    community: &mut Community,
    kind: DispersyMessage,
    payload: Payload,
    target: Target,
) -> Result<Message, DispersyError> {
    let meta = community.dispersy_meta(kind)?;
    build_own_message(rt, community, &meta, payload, target, None)
}

/// Emit `dispersy-identity` for my member.
pub(crate) fn create_identity(rt: &mut Runtime, community: &mut Community, now: Instant) -> Result<Message, DispersyError> {
    let message = build_dispersy_message(rt, community, DispersyMessage::Identity, Payload::Identity, Target::Community)?;
    store_update_forward(rt, community, message, now)
}

impl Dispersy {
    /// Create, store and gossip a message in a community.
    pub fn create_message(
        &mut self,
        cid: &Mid,
        meta_name: &str,
        payload: Payload,
        now: Instant,
    ) -> Result<Message, DispersyError> {
        self.create_message_to(cid, meta_name, payload, Target::Community, now)
    }

    /// Like `create_message` with an explicit target.
    pub fn create_message_to(
        &mut self,
        cid: &Mid,
        meta_name: &str,
        payload: Payload,
        target: Target,
        now: Instant,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let meta = community
            .get_meta_message(meta_name)
            .cloned()
            .ok_or_else(|| DispersyError::UnknownMeta(meta_name.to_string()))?;
        let message = build_own_message(rt, community, &meta, payload, target, None)?;
        let message = store_update_forward(rt, community, message, now)?;
        self.drain(now);
        Ok(message)
    }

    /// Create an application message carrying `value`.
    pub fn create_value_message(
        &mut self,
        cid: &Mid,
        meta_name: &str,
        value: Value,
        now: Instant,
    ) -> Result<Message, DispersyError> {
        self.create_message(cid, meta_name, Payload::Application(value), now)
    }

    /// Sign a message at an explicit global time without storing or sending it.
    pub fn create_message_at(
        &mut self,
        cid: &Mid,
        meta_name: &str,
        payload: Payload,
        global_time: u64,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let meta = community
            .get_meta_message(meta_name)
            .cloned()
            .ok_or_else(|| DispersyError::UnknownMeta(meta_name.to_string()))?;
        build_own_message(rt, community, &meta, payload, Target::None, Some(global_time))
    }

    /// Grant permissions. Each entry is (member, meta message name, permission).
    pub fn create_authorize(
        &mut self,
        cid: &Mid,
        grants: &[(Arc<Member>, &str, Permission)],
        now: Instant,
    ) -> Result<Message, DispersyError> {
        self.create_permission_message(cid, DispersyMessage::Authorize, grants, now)
    }

    /// Revoke permissions. Each entry is (member, meta message name, permission).
    pub fn create_revoke(
        &mut self,
        cid: &Mid,
        grants: &[(Arc<Member>, &str, Permission)],
        now: Instant,
    ) -> Result<Message, DispersyError> {
        self.create_permission_message(cid, DispersyMessage::Revoke, grants, now)
    }

    fn create_permission_message(
        &mut self,
        cid: &Mid,
        kind: DispersyMessage,
        grants: &[(Arc<Member>, &str, Permission)],
        now: Instant,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let mut permissions = Vec::with_capacity(grants.len());
        for (member, meta_name, permission) in grants {
            let meta = community
                .get_meta_message(meta_name)
                .cloned()
                .ok_or_else(|| DispersyError::UnknownMeta(meta_name.to_string()))?;
            permissions.push(PermissionTriple {
                member: member.clone(),
                meta,
                permission: *permission,
            });
        }
        let payload = match kind {
            DispersyMessage::Revoke => Payload::Revoke { permissions },
            _ => Payload::Authorize { permissions },
        };
        let message = build_dispersy_message(rt, community, kind, payload, Target::Community)?;
        let message = store_update_forward(rt, community, message, now)?;
        self.drain(now);
        Ok(message)
    }

    /// Undo the message `member` authored at `global_time`.
    ///
    /// Our own messages are undone with `dispersy-undo-own`, everyone
    /// else's with `dispersy-undo-other`, which needs the undo permission.
    pub fn create_undo(
        &mut self,
        cid: &Mid,
        member: &Arc<Member>,
        global_time: u64,
        now: Instant,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let stored = get_packet_at(&rt.conn, community.database_id, member.database_id, global_time)?
            .ok_or_else(|| {
                DispersyError::InvalidInput(format!(
                    "no message of {} at global time {}",
                    hex::encode(member.mid),
                    global_time
                ))
            })?;
        if stored.undone {
            return Err(DispersyError::InvalidInput("message is already undone".to_string()));
        }
        let undo = UndoPayload {
            member: member.clone(),
            global_time,
            packet: Some(stored),
        };
        let (kind, payload) = if member.database_id == community.my_member.member.database_id {
            (DispersyMessage::UndoOwn, Payload::UndoOwn(undo))
        } else {
            (DispersyMessage::UndoOther, Payload::UndoOther(undo))
        };
        let message = build_dispersy_message(rt, community, kind, payload, Target::Community)?;
        let message = store_update_forward(rt, community, message, now)?;
        self.drain(now);
        Ok(message)
    }

    /// Destroy a community. Needs the permit on `dispersy-destroy-community`.
    pub fn create_destroy_community(
        &mut self,
        cid: &Mid,
        degree: DestroyDegree,
        now: Instant,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let message = build_dispersy_message(
            rt,
            community,
            DispersyMessage::DestroyCommunity,
            Payload::DestroyCommunity { degree },
            Target::Community,
        )?;
        let message = store_update_forward(rt, community, message, now)?;
        info!(community = %hex::encode(cid), ?degree, "community destroyed");
        self.drain(now);
        Ok(message)
    }

    /// Switch the active resolution policy of dynamic metas.
    ///
    /// Each entry is (meta message name, index into its policy list).
    pub fn create_dynamic_settings(
        &mut self,
        cid: &Mid,
        policies: &[(&str, u8)],
        now: Instant,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let mut resolved = Vec::with_capacity(policies.len());
        for (meta_name, index) in policies {
            let meta = community
                .get_meta_message(meta_name)
                .cloned()
                .ok_or_else(|| DispersyError::UnknownMeta(meta_name.to_string()))?;
            match &meta.resolution {
                crate::message::Resolution::Dynamic { policies } if (*index as usize) < policies.len() => {}
                _ => {
                    return Err(DispersyError::InvalidInput(format!(
                        "{} has no dynamic policy {}",
                        meta_name, index
                    )));
                }
            }
            resolved.push((meta, *index));
        }
        let message = build_dispersy_message(
            rt,
            community,
            DispersyMessage::DynamicSettings,
            Payload::DynamicSettings { policies: resolved },
            Target::Community,
        )?;
        let message = store_update_forward(rt, community, message, now)?;
        self.drain(now);
        Ok(message)
    }

    /// Publish the members we want subjective messages of `cluster` from.
    pub fn create_subjective_set(
        &mut self,
        cid: &Mid,
        cluster: u8,
        members: &[Arc<Member>],
        now: Instant,
    ) -> Result<Message, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let mut filter = BloomFilter::with_error_rate(rt.config.bloom_bits, rt.config.bloom_error_rate, Vec::new())?;
        filter.add(&community.my_member.member.public_key);
        for member in members {
            filter.add(&member.public_key);
        }
        let message = build_dispersy_message(
            rt,
            community,
            DispersyMessage::SubjectiveSet,
            Payload::SubjectiveSet { cluster, filter },
            Target::Community,
        )?;
        let message = store_update_forward(rt, community, message, now)?;
        self.drain(now);
        Ok(message)
    }

    /// Ask the other members of a multi-member message to co-sign it.
    ///
    /// `callback` receives the fully signed message once it has been
    /// stored and forwarded, or `None` when the request times out after
    /// `retries` repeats. Returns the request identifier.
    #[allow(clippy::too_many_arguments)]
    pub fn create_signature_request(
        &mut self,
        cid: &Mid,
        meta_name: &str,
        members: Vec<Arc<Member>>,
        payload: Payload,
        retries: u8,
        callback: MessageCallback,
        now: Instant,
    ) -> Result<u16, DispersyError> {
        let (rt, community) = self.split(cid)?;
        let meta = community
            .get_meta_message(meta_name)
            .cloned()
            .ok_or_else(|| DispersyError::UnknownMeta(meta_name.to_string()))?;
        if !matches!(meta.authentication, Authentication::MultiMember { .. }) {
            return Err(DispersyError::InvalidInput(format!("{} is not multi-member", meta_name)));
        }
        let me = community.my_member.clone();
        let keys: Vec<Option<&KeyPair>> = members
            .iter()
            .map(|m| (m.database_id == me.member.database_id).then_some(&me.key_pair))
            .collect();
        if keys.iter().all(Option::is_none) {
            return Err(DispersyError::InvalidInput("my member is not a signer".to_string()));
        }
        let message = build_message(rt, community, &meta, members, &keys, payload, Target::Community, None)?;
        let timeout = Duration::from_secs(rt.config.signature_timeout_secs);
        let identifier = start_signature_request(rt, community, message, retries, timeout, callback, now)?;
        debug!(community = %hex::encode(cid), identifier, meta = meta_name, "signature request started");
        self.drain(now);
        Ok(identifier)
    }
}
