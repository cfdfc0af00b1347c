//! Worker pool: a fixed table of slots, each pairing a frame lock with
//! ownership bookkeeping.
//!
//! The table itself lives in a shared mapping so that worker processes can
//! open it by path and find the lock for their slot. Membership changes
//! (`claim`/`release`) only happen in the owning process and are serialized by
//! a dedicated allocation mutex; the per-slot lock words only guard the frame
//! buffers.

use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{TransportConfig, MAX_CAPACITY};
use crate::error::PoolError;
use crate::id::{WorkerId, ID_LENGTH};
use crate::shm::{Segment, SlotLock};

const MAGIC: &[u8; 8] = b"GFSLOTS1";
const HEADER_SIZE: usize = 64;
const RECORD_SIZE: usize = 64;

// Record layout
const LOCK_OFFSET: usize = 0;
const BUSY_OFFSET: usize = 4;
const OWNER_OFFSET: usize = 16;

const EMPTY_OWNER: [u8; ID_LENGTH] = [0u8; ID_LENGTH];

/// Shared slot table mapping.
pub struct SlotTable {
    segment: Arc<Segment>,
    capacity: usize,
}

impl SlotTable {
    fn create(path: &Path, capacity: usize) -> Result<Self, PoolError> {
        let segment = Segment::create(path, HEADER_SIZE + capacity * RECORD_SIZE)?;

        // SAFETY: the mapping is at least HEADER_SIZE bytes and freshly created,
        // so nobody else is reading the header yet.
        unsafe {
            ptr::copy_nonoverlapping(MAGIC.as_ptr(), segment.as_ptr(), MAGIC.len());
            ptr::write(segment.as_ptr().add(8) as *mut u32, capacity as u32);
        }

        Ok(Self {
            segment: Arc::new(segment),
            capacity,
        })
    }

    /// Open a table created by a pool in another process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let segment = Segment::open(path.as_ref())?;

        if segment.len() < HEADER_SIZE {
            return Err(PoolError::InvalidTable("truncated header".to_string()));
        }

        let mut magic = [0u8; 8];
        // SAFETY: the header is in bounds and written once at creation.
        let capacity = unsafe {
            ptr::copy_nonoverlapping(segment.as_ptr(), magic.as_mut_ptr(), magic.len());
            ptr::read(segment.as_ptr().add(8) as *const u32) as usize
        };

        if &magic != MAGIC {
            return Err(PoolError::InvalidTable("bad magic".to_string()));
        }
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(PoolError::InvalidTable(format!("capacity {}", capacity)));
        }
        if segment.len() < HEADER_SIZE + capacity * RECORD_SIZE {
            return Err(PoolError::InvalidTable(format!(
                "{} bytes is too small for {} slots",
                segment.len(),
                capacity
            )));
        }

        Ok(Self {
            segment: Arc::new(segment),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    fn record_offset(&self, index: usize) -> usize {
        assert!(index < self.capacity, "slot index {} out of range", index);
        HEADER_SIZE + index * RECORD_SIZE
    }

    fn busy_flag(&self, index: usize) -> &AtomicU32 {
        let offset = self.record_offset(index) + BUSY_OFFSET;
        // SAFETY: aligned, in bounds, only accessed atomically.
        unsafe { &*(self.segment.as_ptr().add(offset) as *const AtomicU32) }
    }

    pub fn is_busy(&self, index: usize) -> bool {
        self.busy_flag(index).load(Ordering::Acquire) != 0
    }

    fn owner_bytes(&self, index: usize) -> [u8; ID_LENGTH] {
        let offset = self.record_offset(index) + OWNER_OFFSET;
        let mut owner = EMPTY_OWNER;
        // SAFETY: in bounds; owners are written only under the pool's
        // allocation mutex and published through the busy flag.
        unsafe {
            ptr::copy_nonoverlapping(self.segment.as_ptr().add(offset), owner.as_mut_ptr(), ID_LENGTH);
        }
        owner
    }

    fn write_owner(&self, index: usize, owner: &[u8; ID_LENGTH]) {
        let offset = self.record_offset(index) + OWNER_OFFSET;
        // SAFETY: in bounds; callers hold the allocation mutex.
        unsafe {
            ptr::copy_nonoverlapping(owner.as_ptr(), self.segment.as_ptr().add(offset), ID_LENGTH);
        }
    }

    /// Owner of slot `index`, if any.
    pub fn owner(&self, index: usize) -> Option<WorkerId> {
        if !self.is_busy(index) {
            return None;
        }
        let bytes = self.owner_bytes(index);
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| WorkerId::parse(s).ok())
    }

    /// Frame lock of slot `index`.
    pub fn lock(&self, index: usize) -> SlotLock {
        SlotLock::new(self.segment.clone(), self.record_offset(index) + LOCK_OFFSET)
    }

    /// Index of the busy slot owned by `id`.
    pub fn find(&self, id: &WorkerId) -> Option<usize> {
        (0..self.capacity).find(|&i| self.is_busy(i) && &self.owner_bytes(i) == id.as_bytes())
    }

    /// Handle for the slot owned by `id`.
    pub fn handle(&self, id: &WorkerId) -> Result<SlotHandle, PoolError> {
        let index = self
            .find(id)
            .ok_or_else(|| PoolError::UnknownOwner(id.to_string()))?;

        Ok(SlotHandle {
            index,
            owner: id.clone(),
            lock: self.lock(index),
        })
    }
}

/// A claimed slot: its index, owner and frame lock.
#[derive(Debug, Clone)]
pub struct SlotHandle {
    pub index: usize,
    pub owner: WorkerId,
    pub lock: SlotLock,
}

/// Something that can give a worker's slot back.
pub trait SlotRelease: Send + Sync {
    fn release_slot(&self, id: &WorkerId);
}

/// Fixed-capacity pool of slots shared by decode workers.
pub struct WorkerPool {
    table: SlotTable,
    allocation: Mutex<()>,
}

impl WorkerPool {
    /// Create a pool and its slot table under `config.shm_dir`.
    pub fn new(config: &TransportConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let name = format!("slots-{}", WorkerId::new());
        let path = config.segment_path(&name);
        let table = SlotTable::create(&path, config.capacity)?;

        info!(
            "Created worker pool with {} slots at {}",
            config.capacity,
            path.display()
        );

        Ok(Self {
            table,
            allocation: Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Path worker processes use to open the slot table.
    pub fn table_path(&self) -> PathBuf {
        self.table.path().to_path_buf()
    }

    /// Claim the first free slot for `id`.
    ///
    /// Never blocks on a full pool: fails with
    /// [`PoolError::CapacityExhausted`] instead.
    pub fn claim(&self, id: &WorkerId) -> Result<SlotHandle, PoolError> {
        let _allocation = self.allocation.lock();

        if self.table.find(id).is_some() {
            return Err(PoolError::DuplicateOwner(id.to_string()));
        }

        let index = (0..self.capacity())
            .find(|&i| !self.table.is_busy(i))
            .ok_or(PoolError::CapacityExhausted {
                capacity: self.capacity(),
            })?;

        let lock = self.table.lock(index);
        if lock.force_release() {
            warn!(slot = index, "Frame lock was still held by a previous owner");
        }

        self.table.write_owner(index, id.as_bytes());
        self.table.busy_flag(index).store(1, Ordering::Release);

        info!(worker = %id, slot = index, "Claimed slot");

        Ok(SlotHandle {
            index,
            owner: id.clone(),
            lock,
        })
    }

    /// Give back the slot owned by `id`. Returns `false` if it owns none.
    pub fn release(&self, id: &WorkerId) -> bool {
        let _allocation = self.allocation.lock();

        match self.table.find(id) {
            Some(index) => {
                self.table.write_owner(index, &EMPTY_OWNER);
                self.table.busy_flag(index).store(0, Ordering::Release);
                info!(worker = %id, slot = index, "Released slot");
                true
            }
            None => {
                debug!(worker = %id, "Release for a worker without a slot");
                false
            }
        }
    }

    /// Slot owned by `id`, for the consumer side.
    pub fn lookup(&self, id: &WorkerId) -> Option<SlotHandle> {
        let _allocation = self.allocation.lock();
        self.table.handle(id).ok()
    }

    pub fn busy_count(&self) -> usize {
        let _allocation = self.allocation.lock();
        (0..self.capacity()).filter(|&i| self.table.is_busy(i)).count()
    }

    /// Owner of every slot in table order.
    pub fn owners(&self) -> Vec<Option<WorkerId>> {
        let _allocation = self.allocation.lock();
        (0..self.capacity()).map(|i| self.table.owner(i)).collect()
    }
}

impl SlotRelease for WorkerPool {
    fn release_slot(&self, id: &WorkerId) {
        self.release(id);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.table.segment.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::scratch_config;
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pool(capacity: usize) -> WorkerPool {
        WorkerPool::new(&scratch_config(capacity)).unwrap()
    }

    #[test]
    fn claim_beyond_capacity_fails_then_reuses_released_slot() {
        let pool = pool(2);
        let a = WorkerId::new();
        let b = WorkerId::new();

        let slot_a = pool.claim(&a).unwrap();
        let slot_b = pool.claim(&b).unwrap();
        assert_ne!(slot_a.index, slot_b.index);

        let c = WorkerId::new();
        let start = Instant::now();
        assert!(matches!(
            pool.claim(&c),
            Err(PoolError::CapacityExhausted { capacity: 2 })
        ));
        assert!(start.elapsed() < Duration::from_millis(100));

        assert!(pool.release(&a));
        let slot_c = pool.claim(&c).unwrap();
        assert_eq!(slot_c.index, slot_a.index);
        assert_eq!(pool.owners()[slot_c.index], Some(c.clone()));
        assert_eq!(pool.busy_count(), 2);
    }

    #[test]
    fn release_clears_owner() {
        let pool = pool(2);
        let a = WorkerId::new();

        let slot = pool.claim(&a).unwrap();
        assert_eq!(pool.lookup(&a).map(|h| h.index), Some(slot.index));

        assert!(pool.release(&a));
        assert!(!pool.release(&a));
        assert!(pool.lookup(&a).is_none());
        assert_eq!(pool.owners(), vec![None, None]);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn duplicate_owner_is_rejected() {
        let pool = pool(3);
        let a = WorkerId::new();

        pool.claim(&a).unwrap();
        assert!(matches!(pool.claim(&a), Err(PoolError::DuplicateOwner(_))));
        assert_eq!(pool.busy_count(), 1);
    }

    #[test]
    fn claim_resets_lock_left_held() {
        let pool = pool(1);
        let a = WorkerId::new();

        let slot = pool.claim(&a).unwrap();
        slot.lock.acquire();
        pool.release(&a);

        let b = WorkerId::new();
        let slot = pool.claim(&b).unwrap();
        assert!(!slot.lock.is_locked());
    }

    #[test]
    fn claim_release_sequences_keep_owners_unique() {
        let pool = pool(4);
        let ids: Vec<WorkerId> = (0..10).map(|_| WorkerId::new()).collect();
        let mut live: Vec<WorkerId> = Vec::new();

        // Deterministic pseudo-random walk of claims and releases.
        let mut state = 0x2545_f491_u32;
        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;

            let id = &ids[state as usize % ids.len()];
            if live.contains(id) {
                assert!(pool.release(id));
                live.retain(|l| l != id);
            } else {
                match pool.claim(id) {
                    Ok(_) => live.push(id.clone()),
                    Err(PoolError::CapacityExhausted { .. }) => assert_eq!(live.len(), 4),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }

            let owners: Vec<WorkerId> = pool.owners().into_iter().flatten().collect();
            let unique: HashSet<&WorkerId> = owners.iter().collect();
            assert_eq!(unique.len(), owners.len());
            assert!(owners.len() <= pool.capacity());
            assert_eq!(owners.len(), live.len());
        }
    }

    #[test]
    fn concurrent_claims_never_share_a_slot() {
        let pool = Arc::new(pool(4));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let id = WorkerId::new();
                    pool.claim(&id).ok().map(|slot| (id, slot.index))
                })
            })
            .collect();

        let claimed: Vec<(WorkerId, usize)> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(claimed.len(), 4);
        let slots: HashSet<usize> = claimed.iter().map(|(_, i)| *i).collect();
        assert_eq!(slots.len(), 4);
        for (id, index) in &claimed {
            assert_eq!(pool.owners()[*index].as_ref(), Some(id));
        }
    }

    #[test]
    fn opened_table_sees_claims_and_shares_locks() {
        let pool = pool(2);
        let a = WorkerId::new();
        let slot = pool.claim(&a).unwrap();

        let table = SlotTable::open(pool.table_path()).unwrap();
        assert_eq!(table.capacity(), 2);

        let remote = table.handle(&a).unwrap();
        assert_eq!(remote.index, slot.index);

        remote.lock.acquire();
        assert!(slot.lock.is_locked());
        remote.lock.release();
        assert!(!slot.lock.is_locked());

        assert!(matches!(
            table.handle(&WorkerId::new()),
            Err(PoolError::UnknownOwner(_))
        ));
    }

    #[test]
    fn open_rejects_foreign_files() {
        let config = scratch_config(1);
        let path = config.shm_dir.join("not-a-table");
        std::fs::write(&path, vec![7u8; 256]).unwrap();

        assert!(matches!(SlotTable::open(&path), Err(PoolError::InvalidTable(_))));
    }

    #[test]
    fn drop_removes_table_file() {
        let pool = pool(1);
        let path = pool.table_path();
        assert!(path.exists());
        drop(pool);
        assert!(!path.exists());
    }
}
