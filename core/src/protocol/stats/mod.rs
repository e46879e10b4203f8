//! Stats & monitoring
//!
//! Read-only views of a running instance:
//! - `stats`: packet and walker counters
//! - `community_summaries`: per-community state

mod types;

pub use types::{CommunitySummary, DispersyStats, PacketCounters, WalkCounters};

use crate::data::sync::count_all_packets;

use super::core::Dispersy;
use super::error::DispersyError;

impl Dispersy {
    /// Packet and walker counters since start.
    pub fn stats(&self) -> &DispersyStats {
        &self.rt.stats
    }

    /// One summary per loaded community, sorted by cid.
    pub fn community_summaries(&self) -> Result<Vec<CommunitySummary>, DispersyError> {
        let mut summaries = Vec::with_capacity(self.communities.len());
        for community in self.communities.values() {
            let stored = count_all_packets(&self.rt.conn, community.database_id())?;
            summaries.push(CommunitySummary {
                cid: hex::encode(community.cid()),
                classification: community.classification().to_string(),
                global_time: community.global_time(),
                candidates: community.candidates().len(),
                sync_ranges: community.sync_ranges().len(),
                stored_packets: stored,
                destroyed: community.destroyed().is_some(),
            });
        }
        summaries.sort_by(|a, b| a.cid.cmp(&b.cid));
        Ok(summaries)
    }
}
