//! Cross-context state synchronization.
//!
//! Contexts sharing a store converge by last-write-wins: a write observed
//! from another context replaces the local state wholesale.

pub mod cross_tab;


pub use cross_tab::{CrossTabSync, RemoteUpdate};
