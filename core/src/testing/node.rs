//! Test node - one Dispersy instance on the simulated network
//!
//! A node is either reachable on its LAN address or sits behind a cone
//! NAT. The NAT maps every outgoing packet to a fixed external address and
//! admits incoming packets only from addresses the node has sent to.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::data::start::start_memory_db;
use crate::protocol::config::DispersyConfig;
use crate::protocol::core::Dispersy;
use crate::protocol::error::DispersyError;

/// Port every simulated node binds
pub const TEST_PORT: u16 = 6421;

#[derive(Debug)]
struct Nat {
    external: SocketAddrV4,
    opened: HashSet<SocketAddrV4>,
}

/// A node in a `TestNetwork`
#[derive(Debug)]
pub struct TestNode {
    pub dispersy: Dispersy,
    lan_address: SocketAddrV4,
    nat: Option<Nat>,
}

impl TestNode {
    /// A publicly reachable node. `index` picks its address.
    pub fn public(index: usize, config: DispersyConfig) -> Result<Self, DispersyError> {
        let lan_address = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, host(index)), TEST_PORT);
        Self::start(lan_address, None, config)
    }

    /// A node on a private LAN behind its own NAT.
    pub fn behind_nat(index: usize, config: DispersyConfig) -> Result<Self, DispersyError> {
        let lan_address = SocketAddrV4::new(Ipv4Addr::new(10, 0, host(index), 1), TEST_PORT);
        let nat = Nat {
            external: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, host(index)), 40_000 + index as u16),
            opened: HashSet::new(),
        };
        Self::start(lan_address, Some(nat), config)
    }

    fn start(lan_address: SocketAddrV4, nat: Option<Nat>, config: DispersyConfig) -> Result<Self, DispersyError> {
        let conn = start_memory_db()?;
        let mut dispersy = Dispersy::with_connection(conn, config)?;
        dispersy.set_lan_address(lan_address);
        Ok(Self {
            dispersy,
            lan_address,
            nat,
        })
    }

    pub fn lan_address(&self) -> SocketAddrV4 {
        self.lan_address
    }

    /// The address other nodes see as the source of our packets
    pub fn external_address(&self) -> SocketAddrV4 {
        self.nat.as_ref().map_or(self.lan_address, |nat| nat.external)
    }

    pub fn is_behind_nat(&self) -> bool {
        self.nat.is_some()
    }

    /// Record an outgoing packet to `destination` in the NAT mapping.
    pub(crate) fn open(&mut self, destination: SocketAddrV4) {
        if let Some(nat) = &mut self.nat {
            nat.opened.insert(destination);
        }
    }

    /// Whether a packet from `source` gets through to the node.
    pub(crate) fn admits(&self, source: &SocketAddrV4) -> bool {
        self.nat.as_ref().map_or(true, |nat| nat.opened.contains(source))
    }
}

/// Host byte for node `index`; indices start at host 1.
fn host(index: usize) -> u8 {
    (index % 254) as u8 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_node_admits_everyone() {
        let node = TestNode::public(0, DispersyConfig::for_testing()).unwrap();
        assert_eq!(node.external_address(), node.lan_address());
        assert_eq!(node.dispersy.lan_address(), node.lan_address());
        assert!(node.admits(&SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), TEST_PORT)));
    }

    #[test]
    fn test_nat_admits_only_opened() {
        let mut node = TestNode::behind_nat(2, DispersyConfig::for_testing()).unwrap();
        let peer = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), TEST_PORT);
        assert!(node.is_behind_nat());
        assert_eq!(*node.external_address().ip(), Ipv4Addr::new(203, 0, 113, 3));
        assert_eq!(*node.lan_address().ip(), Ipv4Addr::new(10, 0, 3, 1));
        assert!(!node.admits(&peer));
        node.open(peer);
        assert!(node.admits(&peer));
    }
}
