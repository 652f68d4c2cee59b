//! Control-flow analysis: single subroutines, then the whole program.

mod program;
mod subroutine;

pub use self::program::*;
pub use self::subroutine::*;
