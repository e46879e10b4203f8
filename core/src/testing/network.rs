//! Test network - simulates UDP between Dispersy nodes
//!
//! Packets move in rounds: every node's outbox is collected first (which
//! also opens NAT mappings), then each packet is delivered to the node
//! owning its destination address. The clock only moves when a test
//! advances it.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::community::CommunityHooks;
use crate::protocol::config::DispersyConfig;
use crate::protocol::core::{Dispersy, Outgoing};
use crate::protocol::error::DispersyError;
use crate::security::digest::Mid;

use super::node::TestNode;

/// Rounds after which `run_until_quiet` gives up
const MAX_QUIET_ROUNDS: usize = 64;

/// A simulated network of Dispersy nodes
pub struct TestNetwork {
    /// All nodes (index = node id)
    nodes: Vec<TestNode>,
    /// External address -> node index
    routes: HashMap<SocketAddrV4, usize>,
    now: Instant,
    seed: u64,
    delivered: u64,
    blocked: u64,
}

impl TestNetwork {
    /// Create an empty network. Node `i` gets RNG seed `seed + i`.
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            routes: HashMap::new(),
            now: Instant::now(),
            seed,
            delivered: 0,
            blocked: 0,
        }
    }

    fn config(&self, bootstrap: &[usize]) -> DispersyConfig {
        let bootstrap = bootstrap.iter().map(|&i| self.address(i)).collect();
        DispersyConfig::for_testing()
            .with_rng_seed(self.seed + self.nodes.len() as u64)
            .with_bootstrap(bootstrap)
    }

    fn push(&mut self, node: TestNode) -> usize {
        let id = self.nodes.len();
        self.routes.insert(node.external_address(), id);
        self.nodes.push(node);
        id
    }

    /// Add a publicly reachable node
    pub fn add_node(&mut self) -> Result<usize, DispersyError> {
        self.add_node_with_bootstrap(&[])
    }

    /// Add a public node whose communities walk to `bootstrap` first
    pub fn add_node_with_bootstrap(&mut self, bootstrap: &[usize]) -> Result<usize, DispersyError> {
        let node = TestNode::public(self.nodes.len(), self.config(bootstrap))?;
        Ok(self.push(node))
    }

    /// Add a node behind its own NAT
    pub fn add_node_behind_nat(&mut self) -> Result<usize, DispersyError> {
        let node = TestNode::behind_nat(self.nodes.len(), self.config(&[]))?;
        Ok(self.push(node))
    }

    pub fn node(&self, id: usize) -> &Dispersy {
        &self.nodes[id].dispersy
    }

    pub fn node_mut(&mut self, id: usize) -> &mut Dispersy {
        &mut self.nodes[id].dispersy
    }

    pub fn test_node(&self, id: usize) -> &TestNode {
        &self.nodes[id]
    }

    /// The address other nodes reach node `id` on
    pub fn address(&self, id: usize) -> SocketAddrV4 {
        self.nodes[id].external_address()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self, elapsed: Duration) {
        self.now += elapsed;
    }

    /// Packets delivered since the network was created
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Packets lost to unknown addresses or closed NATs
    pub fn blocked(&self) -> u64 {
        self.blocked
    }

    /// Create a community on node `founder`.
    pub fn create_community(&mut self, founder: usize, hooks: Box<dyn CommunityHooks>) -> Result<Mid, DispersyError> {
        let now = self.now;
        self.nodes[founder].dispersy.create_community(hooks, now)
    }

    /// Join `cid` on node `id`, taking the master key from any node that has it.
    pub fn join_community(&mut self, id: usize, cid: &Mid, hooks: Box<dyn CommunityHooks>) -> Result<(), DispersyError> {
        let master = self
            .nodes
            .iter()
            .find_map(|n| n.dispersy.community(cid).map(|c| c.master().public_key.clone()))
            .ok_or_else(|| DispersyError::UnknownCommunity(hex::encode(cid)))?;
        let now = self.now;
        self.nodes[id].dispersy.join_community(&master, hooks, now)?;
        Ok(())
    }

    /// Deliver a packet to node `to` as if it came from `source`.
    pub fn inject(&mut self, to: usize, source: SocketAddrV4, packet: &[u8]) {
        let now = self.now;
        self.nodes[to].dispersy.on_packet(source, packet, now);
    }

    /// Move every queued packet one hop. Returns the number delivered.
    pub fn deliver_round(&mut self) -> usize {
        let mut in_flight: Vec<(usize, Outgoing)> = Vec::new();
        for (id, node) in self.nodes.iter_mut().enumerate() {
            for outgoing in node.dispersy.take_outgoing() {
                node.open(outgoing.address);
                in_flight.push((id, outgoing));
            }
        }

        let mut delivered = 0;
        for (from, outgoing) in in_flight {
            let Some(&to) = self.routes.get(&outgoing.address) else {
                trace!(from, address = %outgoing.address, "no route");
                self.blocked += 1;
                continue;
            };
            let source = self.nodes[from].external_address();
            if to == from || !self.nodes[to].admits(&source) {
                trace!(from, to, %source, "blocked");
                self.blocked += 1;
                continue;
            }
            self.nodes[to].dispersy.on_packet(source, &outgoing.packet, self.now);
            delivered += 1;
        }
        self.delivered += delivered as u64;
        delivered
    }

    /// Deliver rounds until no packets move. Returns the rounds run.
    pub fn run_until_quiet(&mut self) -> usize {
        for round in 0..MAX_QUIET_ROUNDS {
            if self.deliver_round() == 0 {
                return round;
            }
        }
        MAX_QUIET_ROUNDS
    }

    /// Advance the clock, take one walker step on every node and settle.
    pub fn walk_all(&mut self, elapsed: Duration) {
        self.advance(elapsed);
        let now = self.now;
        for node in &mut self.nodes {
            node.dispersy.walker_step(now);
        }
        self.run_until_quiet();
    }

    /// Advance the clock, run one sync round on every node and settle.
    pub fn sync_all(&mut self, elapsed: Duration) {
        self.advance(elapsed);
        let now = self.now;
        for node in &mut self.nodes {
            node.dispersy.sync_round(now);
        }
        self.run_until_quiet();
    }

    /// Advance the clock and run maintenance on every node.
    pub fn maintain_all(&mut self, elapsed: Duration) {
        self.advance(elapsed);
        let now = self.now;
        for node in &mut self.nodes {
            node.dispersy.maintenance(now);
        }
        self.run_until_quiet();
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communities::barter::BarterCommunity;
    use crate::communities::simple::SimpleCommunity;
    use crate::community::timeline::Permission;
    use crate::data::sync::{count_packets, get_packets_of_meta};

    fn stored(network: &TestNetwork, id: usize, cid: &Mid, meta: &str) -> u64 {
        let d = network.node(id);
        let community = d.community(cid).unwrap();
        let meta = community.get_meta_message(meta).unwrap();
        count_packets(d.connection(), community.database_id(), meta.database_id).unwrap()
    }

    #[test]
    fn test_create_and_join_round_trip() {
        let mut net = TestNetwork::new(10);
        let a = net.add_node().unwrap();
        let b = net.add_node_with_bootstrap(&[a]).unwrap();
        let cid = net.create_community(a, Box::new(SimpleCommunity::new())).unwrap();
        net.join_community(b, &cid, Box::new(SimpleCommunity::new())).unwrap();

        net.walk_all(Duration::from_secs(5));
        assert_eq!(stored(&net, b, &cid, "dispersy-identity"), 2);
        assert_eq!(stored(&net, b, &cid, "dispersy-authorize"), 1);

        // A's founder grants hold in B's timeline
        let a_key = net.node(a).my_member().member.public_key.clone();
        let d = net.node_mut(b);
        let a_in_b = d.rt.members.get_by_public_key(&d.rt.conn, &a_key).unwrap().unwrap();
        let community = d.community(&cid).unwrap();
        let moderated = community.get_meta_message("moderated").unwrap();
        let check = community.timeline().allowed(
            a_in_b.database_id,
            moderated.database_id,
            Permission::Permit,
            community.global_time() + 1,
        );
        assert!(check.allowed);
    }

    #[test]
    fn test_full_sync_catch_up() {
        let mut net = TestNetwork::new(20);
        let a = net.add_node().unwrap();
        let b = net.add_node_with_bootstrap(&[a]).unwrap();
        let cid = net.create_community(a, Box::new(SimpleCommunity::new())).unwrap();
        let now = net.now();
        for i in 0..100 {
            net.node_mut(a)
                .create_value_message(&cid, "text", SimpleCommunity::text_value(&format!("message {}", i)), now)
                .unwrap();
        }
        net.node_mut(a).take_outgoing();

        net.join_community(b, &cid, Box::new(SimpleCommunity::new())).unwrap();
        net.walk_all(Duration::from_secs(5));
        for _ in 0..20 {
            if stored(&net, b, &cid, "text") == 100 {
                break;
            }
            net.sync_all(Duration::from_secs(20));
        }
        assert_eq!(stored(&net, b, &cid, "text"), 100);
        let hooks = net.node(b).community(&cid).unwrap().hooks_as::<SimpleCommunity>().unwrap();
        assert_eq!(hooks.texts().len(), 100);
    }

    #[test]
    fn test_last_sync_eviction() {
        let mut net = TestNetwork::new(30);
        let a = net.add_node().unwrap();
        let b = net.add_node_with_bootstrap(&[a]).unwrap();
        let cid = net.create_community(a, Box::new(SimpleCommunity::new())).unwrap();
        net.join_community(b, &cid, Box::new(SimpleCommunity::new())).unwrap();
        net.walk_all(Duration::from_secs(5));

        let source = net.address(a);
        for global_time in [10, 12, 11] {
            let message = net
                .node_mut(a)
                .create_message_at(
                    &cid,
                    "status",
                    crate::network::payload::Payload::Application(SimpleCommunity::text_value("s")),
                    global_time,
                )
                .unwrap();
            net.inject(b, source, &message.packet);
        }

        let d = net.node(b);
        let community = d.community(&cid).unwrap();
        let meta = community.get_meta_message("status").unwrap();
        let kept = get_packets_of_meta(d.connection(), community.database_id(), meta.database_id).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].global_time, 12);
    }

    #[test]
    fn test_signature_request_success() {
        let mut net = TestNetwork::new(40);
        let a = net.add_node().unwrap();
        let b = net.add_node_with_bootstrap(&[a]).unwrap();
        let cid = net.create_community(a, Box::new(BarterCommunity::new())).unwrap();
        net.join_community(b, &cid, Box::new(BarterCommunity::new())).unwrap();
        // B's walk tells A where B's member lives
        net.walk_all(Duration::from_secs(5));

        let b_key = net.node(b).my_member().member.public_key.clone();
        let now = net.now();
        net.node_mut(a).create_barter_record(&cid, &b_key, 5, 3, now).unwrap();
        net.run_until_quiet();

        assert_eq!(stored(&net, a, &cid, BarterCommunity::RECORD), 1);
        // B only accepts the gossiped record once both signatures verify
        assert_eq!(stored(&net, b, &cid, BarterCommunity::RECORD), 1);
        for id in [a, b] {
            let hooks = net.node(id).community(&cid).unwrap().hooks_as::<BarterCommunity>().unwrap();
            assert_eq!(hooks.records().len(), 1);
            assert_eq!((hooks.records()[0].upload, hooks.records()[0].download), (5, 3));
        }
    }

    #[test]
    fn test_walk_with_nat_puncture() {
        let mut net = TestNetwork::new(50);
        let a = net.add_node_behind_nat().unwrap();
        let b = net.add_node().unwrap();
        let c = net.add_node_behind_nat().unwrap();
        let cid = net.create_community(b, Box::new(SimpleCommunity::new())).unwrap();
        net.join_community(a, &cid, Box::new(SimpleCommunity::new())).unwrap();
        net.join_community(c, &cid, Box::new(SimpleCommunity::new())).unwrap();
        let (a_addr, b_addr, c_addr) = (net.address(a), net.address(b), net.address(c));

        // C is known to B before A arrives
        let now = net.now();
        net.node_mut(c).walk_to(&cid, b_addr, now).unwrap();
        net.run_until_quiet();
        assert_eq!(net.node(c).wan_address(), c_addr);

        // Unsolicited packets do not cross C's NAT
        let blocked = net.blocked();
        net.node_mut(a).walk_to(&cid, c_addr, now).unwrap();
        net.deliver_round();
        assert_eq!(net.blocked(), blocked + 1);
        // The unanswered request times out and C is forgotten
        net.maintain_all(Duration::from_secs(6));
        assert!(net.node(a).community(&cid).unwrap().candidates().get(&c_addr).is_none());

        let now = net.now();
        net.node_mut(a).walk_to(&cid, b_addr, now).unwrap();
        net.run_until_quiet();

        let a_view = net.node(a).community(&cid).unwrap();
        let c_in_a = a_view.candidates().get(&c_addr).unwrap();
        assert!(c_in_a.is_walk());
        assert!(c_in_a.last_walk_reply.is_some());
        let c_view = net.node(c).community(&cid).unwrap();
        assert!(c_view.candidates().get(&a_addr).unwrap().is_stumble());
        assert_eq!(net.node(a).wan_address(), a_addr);
    }

    #[test]
    fn test_malformed_packet_dropped() {
        let mut net = TestNetwork::new(60);
        let a = net.add_node().unwrap();
        let b = net.add_node().unwrap();
        let cid = net.create_community(a, Box::new(SimpleCommunity::new())).unwrap();
        net.run_until_quiet();
        let global_time = net.node(a).community(&cid).unwrap().global_time();

        let mut packet = vec![0x00, 0x01];
        packet.extend_from_slice(&cid);
        packet.push(0xFF);
        let source = net.address(b);
        net.inject(a, source, &packet);

        assert_eq!(net.node(a).stats().packets.dropped, 1);
        assert!(net.node_mut(a).take_outgoing().is_empty());
        assert_eq!(net.node(a).community(&cid).unwrap().global_time(), global_time);
    }
}
