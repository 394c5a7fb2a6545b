#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
#![deny(unused_doc_comments)]

pub mod bits;
pub mod buffer;
pub mod graph;
pub mod group;
pub mod ops;
pub mod pool;
pub mod reduce;

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::bits::*;
    pub use crate::buffer::*;
    pub use crate::graph::edge_file::*;
    pub use crate::graph::partition::*;
    pub use crate::graph::*;
    pub use crate::group::*;
    pub use crate::ops::*;
    pub use crate::pool::*;
    pub use crate::reduce::*;
}
