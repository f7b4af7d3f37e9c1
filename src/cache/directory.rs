//! The dense direct-array slot: a lock-free, refcount-correct handle to
//! at most one block.
//!
//! Promotion (`Region::promote`) allocates a boxed slice of these once a
//! region's sparse map crosses `MAGIC_SIZE`; after that, reads through
//! [`DirectSlot::load`] never block. Writers (`reserve`, bulk
//! invalidation) are serialized by the region's sparse-map writer lock
//! even though the slot itself doesn't need a lock to be written —
//! that's what keeps two writers from racing each other on the same
//! slot.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::cache::block::Block;

pub struct DirectSlot {
    ptr: AtomicPtr<Block>,
}

impl DirectSlot {
    pub fn empty() -> Self {
        Self { ptr: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Lock-free read of the slot's current occupant, if any.
    pub fn load(&self) -> Option<Arc<Block>> {
        let p = self.ptr.load(Ordering::Acquire);
        if p.is_null() {
            return None;
        }
        // SAFETY: a non-null pointer was produced by `Arc::into_raw` in
        // `store` and the slot holds its own strong reference until
        // `clear` tears it down; incrementing the count here hands out
        // an independent owning handle without racing the slot itself,
        // which only a writer under the region's lock may mutate.
        unsafe {
            Arc::increment_strong_count(p);
            Some(Arc::from_raw(p))
        }
    }

    /// Install `block` into a slot that the caller has verified is
    /// empty. Must only be called by a writer holding the region's
    /// sparse-map lock.
    pub fn store(&self, block: Arc<Block>) {
        let raw = Arc::into_raw(block) as *mut Block;
        self.ptr.store(raw, Ordering::Release);
    }

    /// Remove and return the current occupant, if any. Must only be
    /// called by a writer holding the region's sparse-map lock, during a
    /// bulk invalidation that is quiescent with respect to concurrent
    /// readers executing guest code through this slot.
    pub fn clear(&self) -> Option<Arc<Block>> {
        let p = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            return None;
        }
        // SAFETY: reclaims the strong reference the slot owned.
        unsafe { Some(Arc::from_raw(p)) }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for DirectSlot {
    fn drop(&mut self) {
        self.clear();
    }
}

// `Block` is `Send + Sync` (its interior mutability is behind
// `parking_lot::Mutex`), so handing raw pointers to it across threads is
// sound.
unsafe impl Send for DirectSlot {}
unsafe impl Sync for DirectSlot {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::Block;

    #[test]
    fn empty_slot_loads_none() {
        let slot = DirectSlot::empty();
        assert!(slot.load().is_none());
        assert!(slot.is_empty());
    }

    #[test]
    fn store_then_load_roundtrips() {
        let slot = DirectSlot::empty();
        let block = Block::new_shell(0x1000);
        slot.store(block.clone());
        let loaded = slot.load().expect("slot should be occupied");
        assert!(Arc::ptr_eq(&block, &loaded));
        // load() must not consume the slot's own reference.
        assert!(slot.load().is_some());
    }

    #[test]
    fn clear_empties_the_slot() {
        let slot = DirectSlot::empty();
        let block = Block::new_shell(0x2000);
        slot.store(block);
        assert!(slot.clear().is_some());
        assert!(slot.load().is_none());
    }
}
