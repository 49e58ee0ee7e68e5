pub mod cop;
pub mod cop0;
pub mod cop1;
mod core;
pub mod exceptions;
mod execute;
pub mod instruction;
pub mod tlb;

pub use self::core::{Core, CoreError};
