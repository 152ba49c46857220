//! Lifecycle scopes: provision a domain, wait for it, hand it out and always clean it up.
//!
//! Every scope runs the same sequence, parameterized by a [`LifecycleStrategy`]:
//!
//! 1. provision the domain (transient create, define, or define and snapshot)
//! 2. poll until the domain reports active or the readiness timeout passes
//! 3. yield the live [`Domain`](crate::repository::Domain)
//! 4. clean up exactly once, on every exit path

mod poll;
mod scope;
mod strategy;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use poll::*;
pub use scope::*;
pub use strategy::*;
