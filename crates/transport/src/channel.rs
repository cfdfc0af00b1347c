//! Shared frame channel: a named segment plus the slot lock guarding it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::ChannelError;
use crate::id::WorkerId;
use crate::shm::{Segment, SlotLock};

enum ChannelState {
    Empty,
    Mapped { segment: Arc<Segment>, owner: bool },
    Closed,
}

/// One frame buffer shared between a decode worker and a renderer.
///
/// The worker side calls [`allocate`](Self::allocate) once real dimensions
/// are known and owns the segment file; the render side calls
/// [`attach`](Self::attach) and only maps it. Either side may
/// [`close`](Self::close) any number of times; later accesses fail with
/// [`ChannelError::Released`].
pub struct SharedFrameChannel {
    name: WorkerId,
    path: PathBuf,
    lock: SlotLock,
    state: RwLock<ChannelState>,
}

impl SharedFrameChannel {
    pub fn new(name: WorkerId, lock: SlotLock, config: &TransportConfig) -> Self {
        let path = config.segment_path(name.as_str());
        Self {
            name,
            path,
            lock,
            state: RwLock::new(ChannelState::Empty),
        }
    }

    /// Create the segment. A channel is allocated at most once.
    pub fn allocate(&self, size: usize) -> Result<(), ChannelError> {
        if size == 0 {
            return Err(ChannelError::EmptyBuffer);
        }

        let mut state = self.state.write();
        match &*state {
            ChannelState::Empty => {}
            ChannelState::Mapped { segment, .. } => {
                return Err(ChannelError::AlreadyAllocated {
                    size: segment.len(),
                })
            }
            ChannelState::Closed => return Err(ChannelError::Released),
        }

        let segment = Segment::create(&self.path, size)?;
        debug!(channel = %self.name, "Allocated {} byte frame buffer", size);

        *state = ChannelState::Mapped {
            segment: Arc::new(segment),
            owner: true,
        };
        Ok(())
    }

    /// Map a segment allocated by the worker side.
    pub fn attach(&self, expected_size: usize) -> Result<(), ChannelError> {
        let mut state = self.state.write();
        match &*state {
            ChannelState::Empty => {}
            ChannelState::Mapped { segment, .. } => {
                return Err(ChannelError::AlreadyAllocated {
                    size: segment.len(),
                })
            }
            ChannelState::Closed => return Err(ChannelError::Released),
        }

        let segment = Segment::open(&self.path)?;
        if segment.len() != expected_size {
            return Err(ChannelError::SizeMismatch {
                expected: expected_size,
                actual: segment.len(),
            });
        }

        *state = ChannelState::Mapped {
            segment: Arc::new(segment),
            owner: false,
        };
        Ok(())
    }

    pub(crate) fn segment(&self) -> Result<Arc<Segment>, ChannelError> {
        match &*self.state.read() {
            ChannelState::Mapped { segment, .. } => Ok(segment.clone()),
            ChannelState::Empty => Err(ChannelError::NotAllocated),
            ChannelState::Closed => Err(ChannelError::Released),
        }
    }

    /// Take the lock and borrow the buffer until the guard drops.
    pub fn acquire(&self) -> Result<ChannelGuard<'_>, ChannelError> {
        self.segment()?;
        self.lock.acquire();
        self.guard_locked()
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<ChannelGuard<'_>, ChannelError> {
        self.segment()?;
        if !self.lock.acquire_timeout(timeout) {
            return Err(ChannelError::LockTimeout);
        }
        self.guard_locked()
    }

    fn guard_locked(&self) -> Result<ChannelGuard<'_>, ChannelError> {
        // The channel may have been closed while we waited for the lock.
        match self.segment() {
            Ok(segment) => Ok(ChannelGuard {
                lock: &self.lock,
                segment,
            }),
            Err(e) => {
                self.lock.release();
                Err(e)
            }
        }
    }

    /// Release the lock. Safe when it is not held.
    pub fn release(&self) -> bool {
        self.lock.release()
    }

    /// Drop the mapping; the owning side also removes the segment name.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), ChannelState::Closed);

        if let ChannelState::Mapped { segment, owner } = previous {
            if owner {
                segment.unlink();
            }
            debug!(channel = %self.name, owner, "Closed frame channel");
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.read(), ChannelState::Closed)
    }

    /// Buffer size in bytes, once allocated or attached.
    pub fn size(&self) -> Option<usize> {
        self.segment().ok().map(|s| s.len())
    }

    pub fn name(&self) -> &WorkerId {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &SlotLock {
        &self.lock
    }
}

impl Drop for SharedFrameChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Exclusive access to a channel's buffer. Releases the lock on drop.
pub struct ChannelGuard<'a> {
    lock: &'a SlotLock,
    segment: Arc<Segment>,
}

impl ChannelGuard<'_> {
    pub fn len(&self) -> usize {
        self.segment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is alive (we hold an Arc) and the lock gives us
        // exclusive access to the buffer for the guard's lifetime.
        unsafe { std::slice::from_raw_parts(self.segment.as_ptr(), self.segment.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` prevents aliasing through this guard.
        unsafe { std::slice::from_raw_parts_mut(self.segment.as_ptr(), self.segment.len()) }
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
