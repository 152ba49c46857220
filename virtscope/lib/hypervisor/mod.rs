//! Hypervisor session abstraction and its backends.
//!
//! The lifecycle manager only talks to a hypervisor through the [`Hypervisor`] trait. Two
//! backends are provided:
//!
//! - [`MemoryHypervisor`] - an in-process hypervisor, selected with `memory:///` URIs
//! - `LibvirtSession` - a libvirt connection, available with the `libvirt` feature

mod memory;
mod session;

#[cfg(feature = "libvirt")]
mod libvirt;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

#[cfg(feature = "libvirt")]
pub use libvirt::*;
pub use memory::*;
pub use session::*;
