//! Footprint continuations
//!
//! Work that waits for a message is parked here under a footprint: a
//! delayed packet waiting for an identity, a predecessor sequence number,
//! a permission proof or a subjective set, and callbacks registered through
//! `await_message`. Every decoded and accepted message is matched against
//! the registry; matches are released, timeouts release with `None`.

use std::net::SocketAddrV4;
use std::time::Instant;

use crate::message::Message;
use crate::protocol::core::MessageCallback;
use crate::security::digest::Mid;

/// Describes the message a continuation waits for.
///
/// `None` fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    pub community: Mid,
    pub meta: Option<String>,
    /// Mid of the (first) signer
    pub member: Option<Mid>,
    pub global_time: Option<u64>,
    pub sequence_number: Option<u32>,
}

impl Footprint {
    /// Any message of `meta` in `community`.
    pub fn new(community: Mid, meta: impl Into<String>) -> Self {
        Self {
            community,
            meta: Some(meta.into()),
            member: None,
            global_time: None,
            sequence_number: None,
        }
    }

    /// Any message by `member` in `community`.
    pub fn any_of(community: Mid, member: Mid) -> Self {
        Self {
            community,
            meta: None,
            member: Some(member),
            global_time: None,
            sequence_number: None,
        }
    }

    pub fn with_member(mut self, member: Mid) -> Self {
        self.member = Some(member);
        self
    }

    pub fn with_global_time(mut self, global_time: u64) -> Self {
        self.global_time = Some(global_time);
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: u32) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if message.cid != self.community {
            return false;
        }
        if let Some(meta) = &self.meta {
            if message.meta.name != *meta {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if message.member().map(|m| m.mid) != Some(*member) {
                return false;
            }
        }
        if let Some(global_time) = self.global_time {
            if message.global_time != global_time {
                return false;
            }
        }
        if let Some(sequence_number) = self.sequence_number {
            if message.sequence_number != Some(sequence_number) {
                return false;
            }
        }
        true
    }
}

/// What happens when a footprint matches.
pub(crate) enum Continuation {
    /// Run a delayed packet through the dispatcher again
    Redrive { source: SocketAddrV4, packet: Vec<u8> },
    Callback(MessageCallback),
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Continuation::Redrive { source, packet } => f
                .debug_struct("Redrive")
                .field("source", source)
                .field("len", &packet.len())
                .finish(),
            Continuation::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug)]
struct Waiting {
    footprint: Footprint,
    deadline: Instant,
    continuation: Continuation,
}

#[derive(Debug, Default)]
pub(crate) struct FootprintRegistry {
    waiting: Vec<Waiting>,
}

impl FootprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn register(&mut self, footprint: Footprint, deadline: Instant, continuation: Continuation) {
        self.waiting.push(Waiting {
            footprint,
            deadline,
            continuation,
        });
    }

    /// Whether a delayed packet with these bytes is already parked.
    pub fn is_parked(&self, packet: &[u8]) -> bool {
        self.waiting.iter().any(|w| {
            matches!(&w.continuation, Continuation::Redrive { packet: parked, .. } if parked.as_slice() == packet)
        })
    }

    /// Whether something already waits for an identity of `member`.
    pub fn is_waiting_for_member(&self, community: &Mid, member: &Mid) -> bool {
        self.waiting
            .iter()
            .any(|w| w.footprint.community == *community && w.footprint.member == Some(*member))
    }

    /// Remove and return every continuation matching `message`.
    pub fn take_matching(&mut self, message: &Message) -> Vec<Continuation> {
        let (matched, rest): (Vec<Waiting>, Vec<Waiting>) = std::mem::take(&mut self.waiting)
            .into_iter()
            .partition(|w| w.footprint.matches(message));
        self.waiting = rest;
        matched.into_iter().map(|w| w.continuation).collect()
    }

    /// Remove and return continuations past their deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<Continuation> {
        let (expired, rest): (Vec<Waiting>, Vec<Waiting>) = std::mem::take(&mut self.waiting)
            .into_iter()
            .partition(|w| w.deadline <= now);
        self.waiting = rest;
        expired.into_iter().map(|w| w.continuation).collect()
    }

    /// Remove and return every continuation of `community`.
    pub fn cancel_community(&mut self, community: &Mid) -> Vec<Continuation> {
        let (cancelled, rest): (Vec<Waiting>, Vec<Waiting>) = std::mem::take(&mut self.waiting)
            .into_iter()
            .partition(|w| w.footprint.community == *community);
        self.waiting = rest;
        cancelled.into_iter().map(|w| w.continuation).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::member::Member;
    use crate::message::{DispersyMessage, Target};
    use crate::network::payload::Payload;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    fn identity(cid: Mid, mid: Mid, global_time: u64) -> Message {
        Message {
            meta: Arc::new(DispersyMessage::Identity.meta()),
            cid,
            community_version: 1,
            members: vec![Arc::new(Member {
                database_id: 1,
                mid,
                public_key: vec![7; 32],
            })],
            signatures: vec![[0; 64]],
            resolution_index: None,
            global_time,
            sequence_number: None,
            target: Target::None,
            payload: Payload::Identity,
            packet: Vec::new(),
            packet_id: None,
            source: None,
        }
    }

    fn redrive(byte: u8) -> Continuation {
        Continuation::Redrive {
            source: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 1),
            packet: vec![byte],
        }
    }

    #[test]
    fn test_footprint_matching() {
        let message = identity([1; 20], [2; 20], 5);
        assert!(Footprint::new([1; 20], "dispersy-identity").matches(&message));
        assert!(Footprint::any_of([1; 20], [2; 20]).matches(&message));
        assert!(!Footprint::any_of([1; 20], [3; 20]).matches(&message));
        assert!(!Footprint::new([9; 20], "dispersy-identity").matches(&message));
        assert!(!Footprint::new([1; 20], "text").matches(&message));
        assert!(
            Footprint::new([1; 20], "dispersy-identity")
                .with_global_time(5)
                .matches(&message)
        );
        assert!(
            !Footprint::new([1; 20], "dispersy-identity")
                .with_sequence_number(1)
                .matches(&message)
        );
    }

    #[test]
    fn test_take_matching_and_expire() {
        let now = Instant::now();
        let mut registry = FootprintRegistry::new();
        registry.register(Footprint::any_of([1; 20], [2; 20]), now + Duration::from_secs(10), redrive(1));
        registry.register(Footprint::any_of([1; 20], [3; 20]), now + Duration::from_secs(1), redrive(2));
        assert!(registry.is_parked(&[1]));
        assert!(registry.is_waiting_for_member(&[1; 20], &[3; 20]));

        let released = registry.take_matching(&identity([1; 20], [2; 20], 1));
        assert_eq!(released.len(), 1);
        assert!(!registry.is_parked(&[1]));

        assert!(registry.expire(now).is_empty());
        assert_eq!(registry.expire(now + Duration::from_secs(1)).len(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_cancel_community() {
        let now = Instant::now();
        let mut registry = FootprintRegistry::new();
        registry.register(Footprint::new([1; 20], "text"), now, redrive(1));
        registry.register(Footprint::new([2; 20], "text"), now, redrive(2));
        assert_eq!(registry.cancel_community(&[1; 20]).len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
