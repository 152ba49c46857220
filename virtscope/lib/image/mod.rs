//! Disk image acquisition and conversion.

mod convert;
mod supply;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use convert::*;
pub use supply::*;
