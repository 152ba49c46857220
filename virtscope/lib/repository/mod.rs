//! Name-addressed access to domains and snapshots.
//!
//! The repositories translate backend faults into [`VirtscopeError`](crate::VirtscopeError)s,
//! enforce domain name uniqueness on creation, and implement the idempotent delete that every
//! lifecycle scope relies on for cleanup.

mod domain;
mod snapshot;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use domain::*;
pub use snapshot::*;
