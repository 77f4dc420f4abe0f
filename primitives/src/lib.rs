//! Leaf crate with the primitives every other Yogi crate builds on: signed
//! nanosecond durations with an infinity sentinel, wall-clock timestamps with
//! strict format/parse, and the lock-free SPSC byte ring buffer used by the
//! message transport.

pub mod ringbuffer;
pub mod time;

pub use ringbuffer::LockFreeRingBuffer;
pub use time::{Duration, TimeError, Timestamp};
