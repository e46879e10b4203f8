//! Concrete communities
//!
//! - `simple`: one meta message per policy combination, used by tests and
//!   the node binary
//! - `barter`: two-member signed records of exchanged bytes

pub mod barter;
pub mod simple;

pub use barter::BarterCommunity;
pub use simple::SimpleCommunity;
