//! Configuration types for the lifecycle manager.

mod defaults;
mod manager;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use manager::*;
