//! Permission timeline
//!
//! An append-only log of authorize and revoke events per
//! `(member, meta, permission)`, plus the log of dynamic resolution
//! settings. Questions are always asked at a global time: the event with
//! the highest global time at or below it decides, a revoke beats a grant
//! at the same global time, and the master member is always allowed.
//!
//! Proofs are the packets of the deciding grants, followed back through
//! their authors until the master is reached.

use std::collections::HashMap;

use crate::message::{DispersyMessage, Message, MetaMessage, Resolution};
use crate::network::payload::{Payload, PermissionTriple};

/// Grant chains longer than this are not followed
const MAX_PROOF_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Permission {
    Permit = 1,
    Authorize = 2,
    Revoke = 4,
    Undo = 8,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::Permit,
        Permission::Authorize,
        Permission::Revoke,
        Permission::Undo,
    ];

    /// Bits that may appear in a permission bitmap
    pub const ALL_BITS: u8 = 0b1111;

    pub fn bit(self) -> u8 {
        self as u8
    }

    /// Permissions set in `bits`, in ascending bit order.
    pub fn from_bits(bits: u8) -> Vec<Permission> {
        Self::ALL
            .iter()
            .copied()
            .filter(|p| bits & p.bit() != 0)
            .collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            Permission::Permit => "permit",
            Permission::Authorize => "authorize",
            Permission::Revoke => "revoke",
            Permission::Undo => "undo",
        }
    }
}

#[derive(Debug, Clone)]
struct GrantEvent {
    global_time: u64,
    granted: bool,
    author_id: i64,
    packet: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PolicyEvent {
    global_time: u64,
    index: u8,
    packet: Vec<u8>,
}

/// Result of a timeline question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub allowed: bool,
    /// Packets proving the answer, empty for the master and public messages
    pub proofs: Vec<Vec<u8>>,
}

impl Check {
    fn allowed(proofs: Vec<Vec<u8>>) -> Self {
        Self {
            allowed: true,
            proofs,
        }
    }

    fn denied() -> Self {
        Self {
            allowed: false,
            proofs: Vec::new(),
        }
    }
}

/// Permission log of one community.
#[derive(Debug, Clone)]
pub struct Timeline {
    master_id: i64,
    /// Keyed by (member id, meta id, permission), sorted by global time
    grants: HashMap<(i64, i64, Permission), Vec<GrantEvent>>,
    /// Keyed by meta id, sorted by global time
    policies: HashMap<i64, Vec<PolicyEvent>>,
}

impl Timeline {
    pub fn new(master_id: i64) -> Self {
        Self {
            master_id,
            grants: HashMap::new(),
            policies: HashMap::new(),
        }
    }

    pub fn master_id(&self) -> i64 {
        self.master_id
    }

    /// Record a grant (`granted`) or revocation at `global_time`.
    pub fn record(
        &mut self,
        member_id: i64,
        meta_id: i64,
        permission: Permission,
        global_time: u64,
        granted: bool,
        author_id: i64,
        packet: &[u8],
    ) {
        let events = self
            .grants
            .entry((member_id, meta_id, permission))
            .or_default();
        if events
            .iter()
            .any(|e| e.global_time == global_time && e.granted == granted && e.packet == packet)
        {
            return;
        }
        events.push(GrantEvent {
            global_time,
            granted,
            author_id,
            packet: packet.to_vec(),
        });
        // Revocations sort after grants at the same global time
        events.sort_by_key(|e| (e.global_time, !e.granted));
    }

    /// Whether `member_id` held `permission` on `meta_id` at `global_time`.
    pub fn allowed(&self, member_id: i64, meta_id: i64, permission: Permission, global_time: u64) -> Check {
        self.allowed_at_depth(member_id, meta_id, permission, global_time, 0)
    }

    fn allowed_at_depth(
        &self,
        member_id: i64,
        meta_id: i64,
        permission: Permission,
        global_time: u64,
        depth: usize,
    ) -> Check {
        if member_id == self.master_id {
            return Check::allowed(Vec::new());
        }
        if depth >= MAX_PROOF_DEPTH {
            return Check::denied();
        }
        let Some(events) = self.grants.get(&(member_id, meta_id, permission)) else {
            return Check::denied();
        };
        let Some(event) = events.iter().rev().find(|e| e.global_time <= global_time) else {
            return Check::denied();
        };
        if !event.granted {
            return Check::denied();
        }

        let mut proofs = vec![event.packet.clone()];
        let author_permission = Permission::Authorize;
        let chain = self.allowed_at_depth(event.author_id, meta_id, author_permission, event.global_time, depth + 1);
        if !chain.allowed {
            return Check::denied();
        }
        for proof in chain.proofs {
            if !proofs.contains(&proof) {
                proofs.push(proof);
            }
        }
        Check::allowed(proofs)
    }

    /// Apply an accepted authorize or revoke message.
    pub fn apply_permissions(&mut self, message: &Message) {
        let (permissions, granted) = match &message.payload {
            Payload::Authorize { permissions } => (permissions, true),
            Payload::Revoke { permissions } => (permissions, false),
            _ => return,
        };
        let Some(author) = message.member() else {
            return;
        };
        for PermissionTriple {
            member,
            meta,
            permission,
        } in permissions
        {
            self.record(
                member.database_id,
                meta.database_id,
                *permission,
                message.global_time,
                granted,
                author.database_id,
                &message.packet,
            );
        }
    }

    /// Record a dynamic resolution switch for `meta_id`.
    pub fn set_resolution_policy(&mut self, meta_id: i64, index: u8, global_time: u64, packet: &[u8]) {
        let events = self.policies.entry(meta_id).or_default();
        if events.iter().any(|e| e.packet == packet) {
            return;
        }
        events.push(PolicyEvent {
            global_time,
            index,
            packet: packet.to_vec(),
        });
        events.sort_by_key(|e| e.global_time);
    }

    /// Active dynamic resolution policy index of `meta_id` at `global_time`.
    ///
    /// Index 0 is active until the first dynamic-settings message.
    pub fn resolution_policy(&self, meta_id: i64, global_time: u64) -> (u8, Option<&[u8]>) {
        self.policies
            .get(&meta_id)
            .and_then(|events| events.iter().rev().find(|e| e.global_time <= global_time))
            .map(|e| (e.index, Some(e.packet.as_slice())))
            .unwrap_or((0, None))
    }

    /// Check the author(s) of `message` may have created it.
    ///
    /// `target_meta` resolves the meta message of an undone packet.
    pub fn check(&self, message: &Message, target_meta: impl Fn(i64) -> Option<i64>) -> Check {
        let meta = &message.meta;
        if !meta.authentication.is_authenticated() {
            return Check::allowed(Vec::new());
        }

        let mut proofs = Vec::new();
        let resolution = match &meta.resolution {
            Resolution::Dynamic { policies } => {
                let (active, packet) = self.resolution_policy(meta.database_id, message.global_time);
                if message.resolution_index != Some(active) {
                    return Check::denied();
                }
                if let Some(packet) = packet {
                    proofs.push(packet.to_vec());
                }
                match policies.get(active as usize) {
                    Some(policy) => policy,
                    None => return Check::denied(),
                }
            }
            policy => policy,
        };

        if *resolution == Resolution::Linear {
            for member in &message.members {
                let check = self.allowed(member.database_id, meta.database_id, Permission::Permit, message.global_time);
                if !check.allowed {
                    return Check::denied();
                }
                merge(&mut proofs, check.proofs);
            }
        }

        let Some(author) = message.member() else {
            return Check::allowed(proofs);
        };

        let required: Vec<(i64, Permission)> = match (&message.payload, meta.dispersy_kind()) {
            (Payload::Authorize { permissions }, Some(DispersyMessage::Authorize)) => permissions
                .iter()
                .map(|t| (t.meta.database_id, Permission::Authorize))
                .collect(),
            (Payload::Revoke { permissions }, Some(DispersyMessage::Revoke)) => permissions
                .iter()
                .map(|t| (t.meta.database_id, Permission::Revoke))
                .collect(),
            (Payload::UndoOwn(undo), _) => {
                if undo.member.database_id != author.database_id {
                    return Check::denied();
                }
                Vec::new()
            }
            (Payload::UndoOther(undo), _) => {
                let target = undo
                    .packet
                    .as_ref()
                    .and_then(|stored| target_meta(stored.meta_message_id));
                match target {
                    Some(meta_id) => vec![(meta_id, Permission::Undo)],
                    None => return Check::denied(),
                }
            }
            _ => Vec::new(),
        };

        for (meta_id, permission) in required {
            let check = self.allowed(author.database_id, meta_id, permission, message.global_time);
            if !check.allowed {
                return Check::denied();
            }
            merge(&mut proofs, check.proofs);
        }
        Check::allowed(proofs)
    }

    /// Permissions the founder receives when a community is created.
    pub fn founder_permissions(metas: &[std::sync::Arc<MetaMessage>]) -> Vec<(std::sync::Arc<MetaMessage>, Permission)> {
        let mut granted = Vec::new();
        for meta in metas {
            if !meta.authentication.is_authenticated() {
                continue;
            }
            if meta.resolution != Resolution::Public {
                for permission in [Permission::Permit, Permission::Authorize, Permission::Revoke] {
                    granted.push((meta.clone(), permission));
                }
            }
            if meta.undo_callback {
                granted.push((meta.clone(), Permission::Undo));
            }
        }
        granted
    }
}

fn merge(proofs: &mut Vec<Vec<u8>>, more: Vec<Vec<u8>>) {
    for proof in more {
        if !proofs.contains(&proof) {
            proofs.push(proof);
        }
    }
}
