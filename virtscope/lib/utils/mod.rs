//! Utility functions and types.

mod path;
mod xml;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use path::*;
pub use xml::*;
