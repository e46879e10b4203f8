//! Dispersy - Public Interface
//!
//! This module provides the public API of a Dispersy node.
//! External code imports types and methods from here.
//!
//! # Module Structure
//!
//! - `core.rs`: `Dispersy` sans-IO runtime, community lifecycle
//! - `session.rs`: `Session`, the tokio UDP event loop around a `Dispersy`
//! - `config.rs`: `DispersyConfig` builder and bootstrap file parsing
//! - `error.rs`: `DispersyError`
//! - `create.rs`: creating messages (application, permissions, undo, destroy)
//! - `send.rs`: storing and forwarding our own messages
//! - `stats/`: counters and community summaries
//!
//! # Example
//!
//! ```ignore
//! use dispersy_core::{Dispersy, DispersyConfig, Session};
//! use dispersy_core::communities::SimpleCommunity;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut dispersy = Dispersy::open(DispersyConfig::default())?;
//!     dispersy.register_classification(SimpleCommunity::CLASSIFICATION, SimpleCommunity::factory());
//!     let session = Session::start(dispersy).await?;
//!
//!     let cid = session
//!         .call(|d, now| d.create_community(Box::new(SimpleCommunity::new()), now))
//!         .await??;
//!     session
//!         .call(move |d, now| d.create_value_message(&cid, "text", SimpleCommunity::text_value("Hello!"), now))
//!         .await??;
//!
//!     session.stop().await?;
//!     Ok(())
//! }
//! ```

pub(crate) mod config;
pub(crate) mod core;
pub(crate) mod create;
pub(crate) mod error;
pub(crate) mod send;
mod session;
mod stats;

// Core runtime
pub use config::{load_bootstrap_file, parse_bootstrap, DispersyConfig, DEFAULT_PORT};
pub use core::{Dispersy, MessageCallback, Outgoing};
pub use session::Session;

// Error type
pub use error::DispersyError;

// Awaiting messages
pub use crate::handlers::footprint::Footprint;

// Stats types
pub use stats::{CommunitySummary, DispersyStats, PacketCounters, WalkCounters};
