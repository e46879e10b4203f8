//! Data layer for Dispersy
//!
//! SQLite-backed persistence adapter. Every function takes the single
//! `Connection` owned by the runtime.
//!
//! # Tables
//!
//! - `local_member`: our own member key pair
//! - `member` / `key`: known public keys and the private keys we control
//! - `community`: joined and created communities
//! - `meta_message`: persistent ids of message kinds
//! - `sync`: every stored packet
//! - `routing`: candidate addresses surviving restart

pub mod community;
pub mod identity;
pub mod member;
pub mod meta_message;
pub mod routing;
pub mod schema;
pub mod start;
pub mod sync;

pub use community::{
    CommunityRow, get_auto_load_communities, get_community_by_cid, insert_community,
    set_auto_load, set_destroyed,
};
pub use identity::{get_local_member, get_or_create_local_member};
pub use member::{
    MemberRow, get_member, get_member_by_public_key, get_members_by_mid, get_or_insert_member,
    get_private_key, store_private_key,
};
pub use meta_message::get_or_insert_meta_message;
pub use routing::{RoutingEntry, load_routing, save_routing};
pub use schema::create_all_tables;
pub use start::{StartError, start_db, start_memory_db};
pub use sync::{NewPacket, StoredPacket, SyncRow};
