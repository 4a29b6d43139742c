pub mod flow;
pub mod replay;

pub use flow::{content_hash, FlowRef, FlowStore};
pub use replay::{ReplayEntry, ReplayStore};
