//! Multi-member signature requests
//!
//! The originator of a multi-member message signs its own slot and sends
//! the message inside a `dispersy-signature-request` to every member whose
//! slot is still empty. A member that agrees returns its signature in a
//! `dispersy-signature-response`. Once every slot verifies the message is
//! stored and forwarded like any other. Unanswered requests are repeated
//! while retries remain, then the callback gets `None`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, trace};

use crate::community::Community;
use crate::message::{DispersyMessage, Message, Target};
use crate::network::conversion::install_signature;
use crate::network::payload::Payload;
use crate::protocol::core::{Dispersy, MessageCallback, Runtime};
use crate::protocol::create::build_dispersy_message;
use crate::protocol::error::DispersyError;
use crate::protocol::send::store_update_forward;
use crate::security::digest::Mid;
use crate::security::sign::SIGNATURE_LENGTH;

struct PendingSignature {
    community: Mid,
    /// Partially signed message
    message: Message,
    deadline: Instant,
    timeout: Duration,
    retries_left: u8,
    callback: MessageCallback,
}

/// Signature requests waiting for responses, keyed by identifier.
#[derive(Default)]
pub(crate) struct SignatureRequests {
    pending: HashMap<u16, PendingSignature>,
}

impl std::fmt::Debug for SignatureRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureRequests")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SignatureRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, identifier: u16) -> bool {
        self.pending.contains_key(&identifier)
    }

    fn fresh_identifier<R: Rng>(&self, rng: &mut R) -> u16 {
        loop {
            let identifier: u16 = rng.gen();
            if !self.pending.contains_key(&identifier) {
                return identifier;
            }
        }
    }

    fn take_expired(&mut self, now: Instant) -> Vec<(u16, PendingSignature)> {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Remove every request of `community`, returning their callbacks.
    pub fn cancel_community(&mut self, community: &Mid) -> Vec<MessageCallback> {
        let cancelled: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.community == *community)
            .map(|(id, _)| *id)
            .collect();
        cancelled
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|p| p.callback)
            .collect()
    }
}

/// Register a request for `message` and send it to its unsigned members.
pub(crate) fn start_signature_request(
    rt: &mut Runtime,
    community: &mut Community,
    message: Message,
    retries: u8,
    timeout: Duration,
    callback: MessageCallback,
    now: Instant,
) -> Result<u16, DispersyError> {
    let identifier = rt.signatures.fresh_identifier(&mut rt.rng);
    send_request(rt, community, &message, identifier)?;
    rt.signatures.pending.insert(
        identifier,
        PendingSignature {
            community: community.cid,
            message,
            deadline: now + timeout,
            timeout,
            retries_left: retries,
            callback,
        },
    );
    Ok(identifier)
}

fn send_request(
    rt: &mut Runtime,
    community: &mut Community,
    message: &Message,
    identifier: u16,
) -> Result<(), DispersyError> {
    let unsigned: Vec<_> = (0..message.members.len())
        .filter(|i| !message.is_slot_signed(*i))
        .map(|i| message.members[i].clone())
        .collect();
    let addresses: Vec<_> = unsigned
        .iter()
        .flat_map(|m| community.candidates.addresses_of(m))
        .collect();
    if addresses.is_empty() {
        debug!(identifier, "no known address for the remaining signers");
        return Ok(());
    }
    let request = build_dispersy_message(
        rt,
        community,
        DispersyMessage::SignatureRequest,
        Payload::SignatureRequest {
            identifier,
            message: Box::new(message.clone()),
        },
        Target::Members(unsigned),
    )?;
    for address in addresses {
        rt.send(address, request.packet.clone());
    }
    Ok(())
}

/// We were asked to co-sign `inner`.
pub(crate) fn on_signature_request(
    rt: &mut Runtime,
    community: &mut Community,
    request: &Message,
    identifier: u16,
    inner: &Message,
) -> Result<(), DispersyError> {
    let Some(source) = request.source else {
        return Ok(());
    };
    let me = community.my_member.clone();
    let Some(index) = inner
        .members
        .iter()
        .position(|m| m.database_id == me.member.database_id)
    else {
        debug!(%source, identifier, "signature request for somebody else");
        return Ok(());
    };
    if inner.is_slot_signed(index) {
        trace!(%source, identifier, "already signed");
        return Ok(());
    }
    let check = community
        .timeline
        .check(inner, |id| community.meta_by_database_id(id).map(|m| m.database_id));
    if !check.allowed {
        debug!(%source, identifier, meta = %inner.meta.name, "signature request not permitted");
        return Ok(());
    }
    if !community.hooks.allow_signature_request(inner) {
        debug!(%source, identifier, meta = %inner.meta.name, "signature request refused");
        return Ok(());
    }

    let signature = me.sign(inner.signed_region());
    let response = build_dispersy_message(
        rt,
        community,
        DispersyMessage::SignatureResponse,
        Payload::SignatureResponse { identifier, signature },
        Target::Addresses(vec![source]),
    )?;
    rt.send(source, response.packet);
    trace!(%source, identifier, "signature response sent");
    Ok(())
}

/// A member returned its signature for one of our requests.
pub(crate) fn on_signature_response(
    rt: &mut Runtime,
    community: &mut Community,
    identifier: u16,
    signature: &[u8; SIGNATURE_LENGTH],
    now: Instant,
) -> Result<(), DispersyError> {
    let Some(mut pending) = rt.signatures.pending.remove(&identifier) else {
        return Ok(());
    };
    let slot = (0..pending.message.members.len()).find(|i| {
        !pending.message.is_slot_signed(*i)
            && pending.message.members[*i].verify(pending.message.signed_region(), signature)
    });
    match slot {
        Some(index) => {
            install_signature(&mut pending.message, index, *signature);
        }
        None => {
            debug!(identifier, "signature response does not match any slot");
        }
    }

    if !pending.message.is_signed() {
        rt.signatures.pending.insert(identifier, pending);
        return Ok(());
    }

    info!(
        community = %hex::encode(community.cid),
        identifier,
        meta = %pending.message.meta.name,
        "multi-member message signed"
    );
    match store_update_forward(rt, community, pending.message, now) {
        Ok(message) => {
            rt.ready.push((pending.callback, Some(message)));
            Ok(())
        }
        Err(e) => {
            rt.ready.push((pending.callback, None));
            Err(e)
        }
    }
}

/// Repeat or give up on requests past their deadline.
pub(crate) fn expire_signature_requests(d: &mut Dispersy, now: Instant) {
    for (identifier, mut pending) in d.rt.signatures.take_expired(now) {
        let retry = pending.retries_left > 0 && d.communities.contains_key(&pending.community);
        if !retry {
            debug!(identifier, "signature request timed out");
            d.rt.ready.push((pending.callback, None));
            continue;
        }
        pending.retries_left -= 1;
        pending.deadline = now + pending.timeout;
        if let Ok((rt, community)) = d.split(&pending.community) {
            if let Err(e) = send_request(rt, community, &pending.message, identifier) {
                debug!(identifier, error = %e, "failed to repeat signature request");
            }
        }
        trace!(identifier, retries_left = pending.retries_left, "signature request repeated");
        d.rt.signatures.pending.insert(identifier, pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communities::barter::BarterCommunity;
    use crate::data::start::start_memory_db;
    use crate::protocol::config::DispersyConfig;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::{Arc, Mutex};

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    fn node(seed: u64, last: u8) -> Dispersy {
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(seed)).unwrap();
        d.set_lan_address(addr(last));
        d
    }

    #[test]
    fn test_request_times_out_after_retries() {
        let now = Instant::now();
        let mut a = node(1, 1);
        let cid = a.create_community(Box::new(BarterCommunity::new()), now).unwrap();
        let peer = node(2, 2).my_member().member.clone();
        let peer = a.rt.members.get_or_create(&a.rt.conn, &peer.public_key).unwrap();
        a.community_mut(&cid).unwrap().candidates.walk(addr(2), now);
        a.community_mut(&cid).unwrap().candidates.add_member(&addr(2), &peer);
        a.take_outgoing();

        let outcome: Arc<Mutex<Option<Option<Message>>>> = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let me = a.my_member().member.clone();
        let payload = BarterCommunity::record_payload(5, 3);
        a.create_signature_request(
            &cid,
            BarterCommunity::RECORD,
            vec![me, peer],
            payload,
            1,
            Box::new(move |_, message, _| {
                *slot.lock().unwrap() = Some(message);
            }),
            now,
        )
        .unwrap();
        assert_eq!(a.take_outgoing().len(), 1);
        assert_eq!(a.rt.signatures.len(), 1);

        let timeout = a.config().signature_timeout();
        expire_signature_requests(&mut a, now + timeout);
        a.drain(now + timeout);
        // One retry left: the request is sent again
        assert_eq!(a.take_outgoing().len(), 1);
        assert!(outcome.lock().unwrap().is_none());

        expire_signature_requests(&mut a, now + timeout * 2);
        a.drain(now + timeout * 2);
        assert_eq!(a.rt.signatures.len(), 0);
        assert_eq!(*outcome.lock().unwrap(), Some(None));
    }

    #[test]
    fn test_cancel_community() {
        let now = Instant::now();
        let mut a = node(3, 1);
        let cid = a.create_community(Box::new(BarterCommunity::new()), now).unwrap();
        let other = node(4, 2).my_member().member.clone();
        let other = a.rt.members.get_or_create(&a.rt.conn, &other.public_key).unwrap();
        let me = a.my_member().member.clone();
        a.create_signature_request(
            &cid,
            BarterCommunity::RECORD,
            vec![me, other],
            BarterCommunity::record_payload(1, 1),
            0,
            Box::new(|_, _, _| {}),
            now,
        )
        .unwrap();
        assert_eq!(a.rt.signatures.cancel_community(&cid).len(), 1);
        assert!(a.rt.signatures.cancel_community(&cid).is_empty());
    }
}
