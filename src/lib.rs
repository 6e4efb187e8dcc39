pub mod boundary;
pub mod desc;
pub mod engine;
pub mod error;
pub mod frame_pool;
pub mod queue;
pub mod ring;
pub mod sim;

pub use crate::desc::FrameDesc;
pub use crate::error::Error;

/// Capacity of the egress pending deque.
pub const PENDING_LEN: usize = 4096;
