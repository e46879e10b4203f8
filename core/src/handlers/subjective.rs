//! `dispersy-subjective-set`
//!
//! The newest set of each (member, cluster) decides who that member
//! accepts messages of a subjective destination from.

use tracing::debug;

use crate::community::Community;
use crate::message::Message;
use crate::network::bloom::BloomFilter;

pub(crate) fn on_subjective_set(community: &mut Community, message: &Message, cluster: u8, filter: &BloomFilter) {
    let Some(member) = message.member() else {
        return;
    };
    community
        .subjective_sets
        .insert((member.database_id, cluster), filter.clone());
    debug!(
        community = %hex::encode(community.cid),
        member = %hex::encode(member.mid),
        cluster,
        "subjective set updated"
    );
}
