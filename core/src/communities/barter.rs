//! The barter community
//!
//! Two peers that exchanged data both sign a `barter-record` stating how
//! many bytes went each way. The record only spreads once both signatures
//! are present.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::community::member::Member;
use crate::community::{CommunityFactory, CommunityHooks};
use crate::message::{
    Authentication, Destination, Direction, Distribution, MemberEncoding, Message, MetaMessage, MetaMessageError,
    Resolution, Verdict,
};
use crate::network::encoding::Value;
use crate::network::payload::Payload;
use crate::protocol::core::Dispersy;
use crate::protocol::error::DispersyError;
use crate::security::digest::Mid;

/// Times an unanswered record request is repeated
pub const RECORD_RETRIES: u8 = 5;

const UPLOAD_KEY: &str = "upload";
const DOWNLOAD_KEY: &str = "download";

/// A fully signed record as seen by this peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarterRecord {
    pub first: Mid,
    pub second: Mid,
    /// Bytes the first member sent to the second
    pub upload: u64,
    /// Bytes the first member received from the second
    pub download: u64,
    pub global_time: u64,
}

#[derive(Debug)]
pub struct BarterCommunity {
    allow_signature: bool,
    records: Vec<BarterRecord>,
}

impl Default for BarterCommunity {
    fn default() -> Self {
        Self {
            allow_signature: true,
            records: Vec::new(),
        }
    }
}

impl BarterCommunity {
    pub const CLASSIFICATION: &'static str = "barter";
    pub const RECORD: &'static str = "barter-record";

    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to co-sign records other members propose
    pub fn with_allow_signature(mut self, allow: bool) -> Self {
        self.allow_signature = allow;
        self
    }

    pub fn factory() -> CommunityFactory {
        Box::new(|| Box::new(BarterCommunity::new()) as Box<dyn CommunityHooks>)
    }

    pub fn set_allow_signature(&mut self, allow: bool) {
        self.allow_signature = allow;
    }

    pub fn record_payload(upload: u64, download: u64) -> Payload {
        Payload::Application(Value::dict([
            (Value::from(UPLOAD_KEY), Value::Int(upload as i64)),
            (Value::from(DOWNLOAD_KEY), Value::Int(download as i64)),
        ]))
    }

    pub fn records(&self) -> &[BarterRecord] {
        &self.records
    }
}

/// (upload, download) of a record payload, when well formed.
fn amounts(message: &Message) -> Option<(u64, u64)> {
    let Payload::Application(value) = &message.payload else {
        return None;
    };
    let upload = value.get(UPLOAD_KEY)?.as_int()?;
    let download = value.get(DOWNLOAD_KEY)?.as_int()?;
    Some((u64::try_from(upload).ok()?, u64::try_from(download).ok()?))
}

impl CommunityHooks for BarterCommunity {
    fn classification(&self) -> &'static str {
        Self::CLASSIFICATION
    }

    fn initiate_meta_messages(&self) -> Result<Vec<MetaMessage>, MetaMessageError> {
        Ok(vec![MetaMessage::new(
            Self::RECORD,
            Authentication::MultiMember {
                count: 2,
                encoding: MemberEncoding::Bin,
            },
            Resolution::Public,
            Distribution::FullSync {
                enable_sequence_number: false,
                direction: Direction::Asc,
            },
            Destination::Community { node_count: 10 },
        )?])
    }

    fn check_message(&mut self, message: &Message) -> Verdict {
        if amounts(message).is_none() {
            return Verdict::drop("malformed barter record");
        }
        Verdict::Accept
    }

    fn on_messages(&mut self, messages: &[Message]) {
        for message in messages {
            let (Some((upload, download)), [first, second]) = (amounts(message), message.members.as_slice()) else {
                continue;
            };
            self.records.push(BarterRecord {
                first: first.mid,
                second: second.mid,
                upload,
                download,
                global_time: message.global_time,
            });
        }
    }

    fn allow_signature_request(&mut self, message: &Message) -> bool {
        self.allow_signature && amounts(message).is_some()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Dispersy {
    /// Propose a record of `upload`/`download` bytes exchanged with `peer`.
    ///
    /// Returns the signature request identifier. The record is stored and
    /// gossiped once `peer` signs it.
    pub fn create_barter_record(
        &mut self,
        cid: &Mid,
        peer: &[u8],
        upload: u64,
        download: u64,
        now: Instant,
    ) -> Result<u16, DispersyError> {
        let peer: Arc<Member> = self.rt.members.get_or_create(&self.rt.conn, peer)?;
        let me = self.rt.my_member.member.clone();
        if peer.database_id == me.database_id {
            return Err(DispersyError::InvalidInput("cannot barter with myself".to_string()));
        }
        let peer_mid = peer.mid;
        self.create_signature_request(
            cid,
            BarterCommunity::RECORD,
            vec![me, peer],
            BarterCommunity::record_payload(upload, download),
            RECORD_RETRIES,
            Box::new(move |_, message, _| match message {
                Some(message) => info!(
                    peer = %hex::encode(peer_mid),
                    upload,
                    download,
                    global_time = message.global_time,
                    "barter record signed"
                ),
                None => warn!(peer = %hex::encode(peer_mid), "barter record not signed"),
            }),
            now,
        )
        .inspect(|identifier| debug!(identifier, upload, download, "barter record proposed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::start::start_memory_db;
    use crate::protocol::config::DispersyConfig;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 6421)
    }

    fn node(seed: u64, last: u8) -> Dispersy {
        let conn = start_memory_db().unwrap();
        let mut d = Dispersy::with_connection(conn, DispersyConfig::for_testing().with_rng_seed(seed)).unwrap();
        d.set_lan_address(addr(last));
        d
    }

    /// A founds a barter community, B joins, A knows B's address.
    fn pair(now: Instant, b_hooks: BarterCommunity) -> (Dispersy, Dispersy, Mid) {
        let mut a = node(1, 1);
        let cid = a.create_community(Box::new(BarterCommunity::new()), now).unwrap();
        let master = a.community(&cid).unwrap().master().public_key.clone();
        let mut b = node(2, 2);
        b.join_community(&master, Box::new(b_hooks), now).unwrap();

        let b_key = b.my_member().member.public_key.clone();
        let b_in_a = a.rt.members.get_or_create(&a.rt.conn, &b_key).unwrap();
        let candidates = &mut a.community_mut(&cid).unwrap().candidates;
        candidates.walk(addr(2), now);
        candidates.add_member(&addr(2), &b_in_a);
        a.take_outgoing();
        b.take_outgoing();
        (a, b, cid)
    }

    fn deliver(from: &mut Dispersy, from_addr: SocketAddrV4, to: &mut Dispersy, now: Instant) -> usize {
        let packets = from.take_outgoing();
        for outgoing in &packets {
            to.on_packet(from_addr, &outgoing.packet, now);
        }
        packets.len()
    }

    #[test]
    fn test_record_signed_by_both() {
        let now = Instant::now();
        let (mut a, mut b, cid) = pair(now, BarterCommunity::new());
        let b_key = b.my_member().member.public_key.clone();

        a.create_barter_record(&cid, &b_key, 1024, 512, now).unwrap();
        assert_eq!(deliver(&mut a, addr(1), &mut b, now), 1);
        assert_eq!(deliver(&mut b, addr(2), &mut a, now), 1);

        let hooks = a.community(&cid).unwrap().hooks_as::<BarterCommunity>().unwrap();
        assert_eq!(hooks.records().len(), 1);
        let record = &hooks.records()[0];
        assert_eq!(record.first, a.my_member().member.mid);
        assert_eq!(record.second, b.my_member().member.mid);
        assert_eq!((record.upload, record.download), (1024, 512));
        assert_eq!(a.rt.signatures.len(), 0);
    }

    #[test]
    fn test_refusing_peer_does_not_sign() {
        let now = Instant::now();
        let (mut a, mut b, cid) = pair(now, BarterCommunity::new().with_allow_signature(false));
        let b_key = b.my_member().member.public_key.clone();

        a.create_barter_record(&cid, &b_key, 1, 2, now).unwrap();
        deliver(&mut a, addr(1), &mut b, now);
        assert!(b.take_outgoing().is_empty());
        assert_eq!(a.rt.signatures.len(), 1);
        let hooks = a.community(&cid).unwrap().hooks_as::<BarterCommunity>().unwrap();
        assert!(hooks.records().is_empty());
    }

    #[test]
    fn test_cannot_barter_with_myself() {
        let now = Instant::now();
        let mut a = node(3, 1);
        let cid = a.create_community(Box::new(BarterCommunity::new()), now).unwrap();
        let me = a.my_member().member.public_key.clone();
        assert!(matches!(
            a.create_barter_record(&cid, &me, 1, 1, now),
            Err(DispersyError::InvalidInput(_))
        ));
    }
}
