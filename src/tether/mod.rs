//! The tether fabric: per-instance bounded ring buffers of egress frames,
//! with live subscribers, monotonic sequence numbers, long-poll reads, and
//! session/type filtering.

pub mod frame;
pub mod ring_buffer;
pub mod store;

pub use frame::{Filter, Session, TetherFrame};
pub use ring_buffer::{RingBuffer, Subscription};
pub use store::{PollResult, TetherStore};
