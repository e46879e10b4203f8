//! Testing utilities
//!
//! An in-process simulation of UDP between Dispersy nodes, with cone NATs
//! and a manual clock, for end-to-end tests without sockets.
//!
//! # Example
//!
//! ```ignore
//! let mut network = TestNetwork::new(7);
//! let alice = network.add_node()?;
//! let bob = network.add_node_with_bootstrap(&[alice])?;
//!
//! let cid = network.create_community(alice, Box::new(SimpleCommunity::new()))?;
//! network.join_community(bob, &cid, Box::new(SimpleCommunity::new()))?;
//!
//! // Bob walks to alice and pulls what he is missing
//! network.walk_all(Duration::from_secs(5));
//! ```

pub mod network;
pub mod node;

pub use network::TestNetwork;
pub use node::TestNode;
