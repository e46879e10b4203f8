//! Dispersy Core
//!
//! Authenticated gossip communities over UDP.
//!
//! This is the foundation crate that provides:
//! - Communities with typed meta messages and pluggable behaviour
//! - Signed packets, multi-member signature requests and permission timelines
//! - Bloom filter anti-entropy sync between peers
//! - A random walker with NAT puncturing to find peers
//!
//! # Module Structure
//!
//! - `protocol/`: Public interface (Dispersy, Session, config, errors, stats)
//! - `community/`: Per-community state (members, timeline, candidates, walker)
//! - `communities/`: Concrete communities (simple, barter)
//! - `message/`: Meta messages, policies and message instances
//! - `handlers/`: Packet dispatcher and per-message handlers
//! - `tasks/`: Periodic work (walker, sync, maintenance)
//! - `network/`: Wire formats (conversion, payloads, Bloom filters, encoding)
//! - `data/`: SQLite persistence
//! - `security/`: Cryptography (keys, signatures, digests)
//! - `resilience/`: Rate limiting of misbehaving sources
//! - `testing/`: Simulated network for end-to-end tests
//!
//! # Quick Start
//!
//! ```ignore
//! use dispersy_core::{Dispersy, DispersyConfig, Session};
//! use dispersy_core::communities::SimpleCommunity;
//!
//! // Start a node
//! let mut dispersy = Dispersy::open(DispersyConfig::for_testing())?;
//! dispersy.register_classification(SimpleCommunity::CLASSIFICATION, SimpleCommunity::factory());
//! let session = Session::start(dispersy).await?;
//!
//! // Join a community
//! let cid = session
//!     .call(move |d, now| d.join_community(&master_key, Box::new(SimpleCommunity::new()), now))
//!     .await??;
//! ```

// Public interface
pub mod protocol;

// Internal modules
pub(crate) mod handlers;
pub(crate) mod tasks;

// Infrastructure modules (pub for flexibility)
pub mod communities;
pub mod community;
pub mod data;
pub mod message;
pub mod network;
pub mod resilience;
pub mod security;
pub mod testing;

// Re-export main API types for convenience
pub use protocol::{
    CommunitySummary,
    Dispersy,
    DispersyConfig,
    DispersyError,
    DispersyStats,
    Footprint,
    MessageCallback,
    Outgoing,
    Session,
};
