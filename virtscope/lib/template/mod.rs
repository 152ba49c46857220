//! XML template loading and placeholder substitution.

mod template;
mod values;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use template::*;
pub use values::*;
