//! Shared memory primitives: named mapped segments and the lock word that
//! guards a frame buffer across processes.

mod lock;
mod segment;

pub use lock::SlotLock;
pub(crate) use segment::Segment;
