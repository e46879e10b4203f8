//! `dispersy-authorize`, `dispersy-revoke` and `dispersy-dynamic-settings`
//!
//! Accepted messages extend the timeline. They were already checked
//! against the timeline at their own global time.

use std::sync::Arc;

use tracing::debug;

use crate::community::Community;
use crate::message::{Message, MetaMessage};
use crate::network::payload::Payload;

pub(crate) fn on_permissions(community: &mut Community, message: &Message) {
    let (kind, count) = match &message.payload {
        Payload::Authorize { permissions } => ("authorize", permissions.len()),
        Payload::Revoke { permissions } => ("revoke", permissions.len()),
        _ => return,
    };
    community.timeline.apply_permissions(message);
    debug!(
        community = %hex::encode(community.cid),
        kind,
        count,
        global_time = message.global_time,
        "timeline updated"
    );
}

pub(crate) fn on_dynamic_settings(community: &mut Community, message: &Message, policies: &[(Arc<MetaMessage>, u8)]) {
    for (meta, index) in policies {
        community
            .timeline
            .set_resolution_policy(meta.database_id, *index, message.global_time, &message.packet);
        debug!(
            community = %hex::encode(community.cid),
            meta = %meta.name,
            index,
            global_time = message.global_time,
            "resolution policy switched"
        );
    }
}
