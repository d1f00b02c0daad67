//! Concurrency primitives shared by every lifecycle phase.

mod group;
mod memo;

pub use group::TaskGroup;
pub use memo::{Memo, MemoMap};
