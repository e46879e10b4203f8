//! Periodic work
//!
//! Each task is a plain method on `Dispersy` taking the current time;
//! `Session` calls them from its interval timers:
//! - `walker_step`: one introduction request per community
//! - `sync_round`: sync requests to a few random candidates
//! - `maintenance`: timeouts, candidate cleanup, routing persistence

mod maintenance;
mod sync;
pub(crate) mod walker;
