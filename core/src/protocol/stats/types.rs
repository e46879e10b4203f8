//! Stats types for monitoring a Dispersy instance

use serde::{Deserialize, Serialize};

/// Packet counters since start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketCounters {
    /// Packets handed to the dispatcher
    pub received: u64,
    /// Packets dropped while decoding or checking
    pub dropped: u64,
    /// Packets parked until something they depend on arrives
    pub delayed: u64,
    /// Packets ignored because their source is rate limited
    pub rate_limited: u64,
    /// Messages written to the store
    pub stored: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
}

/// Walker counters since start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkCounters {
    /// Introduction requests sent
    pub attempts: u64,
    /// Introduction responses matched to a request
    pub successes: u64,
    /// Introduction requests that timed out
    pub timeouts: u64,
}

/// Overall statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispersyStats {
    pub packets: PacketCounters,
    pub walk: WalkCounters,
}

/// State of one loaded community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunitySummary {
    /// Hex-encoded cid
    pub cid: String,
    pub classification: String,
    pub global_time: u64,
    pub candidates: usize,
    pub sync_ranges: usize,
    pub stored_packets: u64,
    pub destroyed: bool,
}
