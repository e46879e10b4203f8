//! Members and the member cache
//!
//! A member is materialized lazily the first time a packet or permission
//! references its public key. The cache hands out `Arc<Member>` handles keyed
//! by database id so messages can share them cheaply.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;

use crate::data::member::{
    MemberRow, get_member, get_member_by_public_key, get_members_by_mid, get_or_insert_member,
    get_private_key, store_private_key,
};
use crate::security::create_key_pair::{KeyPair, PUBLIC_KEY_LENGTH, key_pair_from_bytes};
use crate::security::digest::Mid;
use crate::security::sign::{sign_bytes, verify_bytes};

/// A member known by its public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub database_id: i64,
    pub mid: Mid,
    pub public_key: Vec<u8>,
}

impl Member {
    fn from_row(row: MemberRow) -> Self {
        Self {
            database_id: row.id,
            mid: row.mid,
            public_key: row.public_key,
        }
    }

    /// Verify a signature made by this member.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        verify_bytes(&self.public_key, data, signature)
    }
}

/// A member whose private key we hold.
#[derive(Debug, Clone)]
pub struct MyMember {
    pub member: Arc<Member>,
    pub key_pair: KeyPair,
}

impl MyMember {
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        sign_bytes(&self.key_pair.private_key, data)
    }
}

/// Cache over the `member` and `key` tables.
#[derive(Debug, Default)]
pub struct MemberCache {
    by_id: HashMap<i64, Arc<Member>>,
    by_public_key: HashMap<Vec<u8>, i64>,
}

impl MemberCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, member: Member) -> Arc<Member> {
        let member = Arc::new(member);
        self.by_public_key
            .insert(member.public_key.clone(), member.database_id);
        self.by_id.insert(member.database_id, member.clone());
        member
    }

    /// Whether a byte string is shaped like a member public key.
    pub fn is_valid_public_key(public_key: &[u8]) -> bool {
        public_key.len() == PUBLIC_KEY_LENGTH
    }

    /// Get the member for a public key, registering it when unseen.
    pub fn get_or_create(&mut self, conn: &Connection, public_key: &[u8]) -> rusqlite::Result<Arc<Member>> {
        if let Some(id) = self.by_public_key.get(public_key) {
            if let Some(member) = self.by_id.get(id) {
                return Ok(member.clone());
            }
        }

        let id = get_or_insert_member(conn, public_key)?;
        match get_member(conn, id)? {
            Some(row) => Ok(self.insert(Member::from_row(row))),
            None => Err(rusqlite::Error::QueryReturnedNoRows),
        }
    }

    /// Get a member by database id.
    pub fn get(&mut self, conn: &Connection, id: i64) -> rusqlite::Result<Option<Arc<Member>>> {
        if let Some(member) = self.by_id.get(&id) {
            return Ok(Some(member.clone()));
        }
        Ok(get_member(conn, id)?.map(|row| self.insert(Member::from_row(row))))
    }

    /// Get a known member by public key without registering it.
    pub fn get_by_public_key(
        &mut self,
        conn: &Connection,
        public_key: &[u8],
    ) -> rusqlite::Result<Option<Arc<Member>>> {
        if let Some(id) = self.by_public_key.get(public_key).copied() {
            return self.get(conn, id);
        }
        Ok(get_member_by_public_key(conn, public_key)?.map(|row| self.insert(Member::from_row(row))))
    }

    /// Every known member with this mid.
    pub fn get_by_mid(&mut self, conn: &Connection, mid: &Mid) -> rusqlite::Result<Vec<Arc<Member>>> {
        let rows = get_members_by_mid(conn, mid)?;
        Ok(rows
            .into_iter()
            .map(|row| match self.by_id.get(&row.id) {
                Some(member) => member.clone(),
                None => self.insert(Member::from_row(row)),
            })
            .collect())
    }

    /// Register a key pair we control and return it as our member.
    pub fn register_key_pair(&mut self, conn: &Connection, key_pair: &KeyPair) -> rusqlite::Result<MyMember> {
        store_private_key(conn, &key_pair.public_key, &key_pair.private_key)?;
        let member = self.get_or_create(conn, &key_pair.public_key)?;
        Ok(MyMember {
            member,
            key_pair: key_pair.clone(),
        })
    }

    /// Our signing handle for a member, if we hold its private key.
    pub fn my_member(&mut self, conn: &Connection, member: &Arc<Member>) -> rusqlite::Result<Option<MyMember>> {
        Ok(get_private_key(conn, &member.public_key)?.map(|private_key| MyMember {
            member: member.clone(),
            key_pair: key_pair_from_bytes(&private_key),
        }))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
