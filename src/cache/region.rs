//! `Region`: the directory of blocks covering one contiguous guest text
//! range.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::block::Block;
use crate::cache::config::CacheConfig;
use crate::cache::directory::DirectSlot;

pub(crate) const MAGIC_SIZE: usize = 256;

/// The sparse/dense directory storage. Sparse is a plain hash map guarded
/// by the region's `RwLock`; dense additionally carries a boxed slice of
/// lock-free [`DirectSlot`]s plus a residual map for addresses outside
/// the direct window (there shouldn't be any in the normal case — a
/// region's blocks are all inside its own text range — but an address
/// outside the window can still be inserted defensively, matching the
/// source's tolerance for it).
enum Storage {
    Sparse(HashMap<u64, Arc<Block>>),
    Dense { direct: Box<[DirectSlot]>, residual: HashMap<u64, Arc<Block>> },
}

pub struct Region {
    pub base: u64,
    pub text: u64,
    pub textsz: u64,
    pub nolinker: bool,
    promotion_threshold: usize,
    dump_on_fill: bool,
    storage: RwLock<Storage>,
}

impl Region {
    /// `NewDynablockList`. If `direct` is requested and `textsz > 0`, the
    /// dense array is allocated immediately instead of waiting for the
    /// sparse map to cross the promotion threshold. Equivalent to
    /// `Self::new_with_config(.., CacheConfig::default())`.
    pub fn new(base: u64, text: u64, textsz: u64, nolinker: bool, direct: bool) -> Arc<Self> {
        Self::new_with_config(base, text, textsz, nolinker, direct, CacheConfig::default())
    }

    pub fn new_with_config(
        base: u64,
        text: u64,
        textsz: u64,
        nolinker: bool,
        direct: bool,
        config: CacheConfig,
    ) -> Arc<Self> {
        let storage = if direct && textsz > 0 {
            Storage::Dense {
                direct: (0..textsz).map(|_| DirectSlot::empty()).collect(),
                residual: HashMap::new(),
            }
        } else {
            Storage::Sparse(HashMap::new())
        };
        Arc::new(Self {
            base,
            text,
            textsz,
            nolinker,
            promotion_threshold: config.promotion_threshold,
            dump_on_fill: config.dump_on_fill,
            storage: RwLock::new(storage),
        })
    }

    /// Half-open: `[text, text+textsz)`. Harmonized across both the read
    /// and the allocate path (see DESIGN.md, Open Question 1).
    pub fn covers(&self, addr: u64) -> bool {
        self.textsz > 0 && addr >= self.text && addr < self.text + self.textsz
    }

    fn direct_index(&self, addr: u64) -> usize {
        let start = self.text - self.base;
        let key = addr - self.base;
        debug_assert_eq!(key - start, addr - self.text);
        (addr - self.text) as usize
    }

    /// Lock-free direct-array probe only; does not fall through to the
    /// hash map. Used by the lookup fast path when a `current` block's
    /// region is already known.
    pub fn lookup_direct(&self, addr: u64) -> Option<Arc<Block>> {
        if !self.covers(addr) {
            return None;
        }
        // Reading the `Storage` enum variant needs a brief read lock
        // (the variant itself never changes shape once `Dense` — only
        // `promote` performs that one-time transition under the writer
        // lock) — but once inside the `Dense` arm, the slot read is the
        // genuinely lock-free atomic load `DirectSlot::load` performs.
        let storage = self.storage.read();
        match &*storage {
            Storage::Dense { direct, .. } => direct[self.direct_index(addr)].load(),
            Storage::Sparse(_) => None,
        }
    }

    /// Direct probe, then shared-locked hash probe.
    pub fn lookup(&self, addr: u64) -> Option<Arc<Block>> {
        let storage = self.storage.read();
        match &*storage {
            Storage::Dense { direct, residual } => {
                if self.covers(addr) {
                    if let Some(b) = direct[self.direct_index(addr)].load() {
                        return Some(b);
                    }
                }
                residual.get(&(addr - self.base)).cloned()
            }
            Storage::Sparse(map) => map.get(&(addr - self.base)).cloned(),
        }
    }

    /// `AddNewDynablock`. Returns `(block, created)`; only the caller
    /// that sees `created == true` may invoke the external code
    /// generator.
    pub fn reserve(self: &Arc<Self>, addr: u64) -> (Arc<Block>, bool) {
        // Warm path: direct-array read with no lock at all.
        if let Some(existing) = self.lookup_direct(addr) {
            return (existing, false);
        }

        let mut storage = self.storage.write();
        // Re-check under the writer lock: another writer may have just
        // inserted the same address.
        match &mut *storage {
            Storage::Dense { direct, residual } => {
                if self.covers(addr) {
                    let idx = self.direct_index(addr);
                    if let Some(existing) = direct[idx].load() {
                        return (existing, false);
                    }
                    let block = Block::new_in_region(addr, self);
                    if self.nolinker {
                        block.init_marks();
                    }
                    self.log_created(addr);
                    direct[idx].store(block.clone());
                    return (block, true);
                }
                let key = addr - self.base;
                if let Some(existing) = residual.get(&key) {
                    return (existing.clone(), false);
                }
                let block = Block::new_in_region(addr, self);
                if self.nolinker {
                    block.init_marks();
                }
                self.log_created(addr);
                residual.insert(key, block.clone());
                (block, true)
            }
            Storage::Sparse(map) => {
                let key = addr - self.base;
                if let Some(existing) = map.get(&key) {
                    return (existing.clone(), false);
                }
                let block = Block::new_in_region(addr, self);
                if self.nolinker {
                    block.init_marks();
                }
                self.log_created(addr);
                map.insert(key, block.clone());
                let should_promote = !self.covers_none()
                    && map.len() == self.promotion_threshold
                    && self.textsz > 0;
                if should_promote {
                    self.promote_locked(&mut *storage);
                }
                (block, true)
            }
        }
    }

    /// `textsz == 0` disables promotion and direct-mode allocation
    /// entirely (spec.md §4.1 edge cases).
    fn covers_none(&self) -> bool {
        self.textsz == 0
    }

    fn log_created(&self, addr: u64) {
        if self.dump_on_fill {
            log::trace!("region 0x{:x}: reserved new block shell at 0x{:x}", self.text, addr);
        }
    }

    /// `ConvertHash2Direct` / `promote()`. Must be called with the
    /// writer lock already held and the storage still `Sparse`.
    fn promote_locked(&self, storage: &mut Storage) {
        let Storage::Sparse(map) = storage else {
            return;
        };
        let start = self.text - self.base;
        let end = self.text + self.textsz - self.base;
        let direct: Box<[DirectSlot]> = (0..self.textsz).map(|_| DirectSlot::empty()).collect();
        let mut residual = HashMap::new();
        for (key, block) in map.drain() {
            if key >= start && key < end {
                direct[(key - start) as usize].store(block);
            } else {
                residual.insert(key, block);
            }
        }
        log::debug!(
            "region 0x{:x}: promoted directory to direct mode ({} residual entries)",
            self.text,
            residual.len()
        );
        *storage = Storage::Dense { direct, residual };
    }

    pub fn start(&self) -> u64 {
        self.text
    }

    pub fn end(&self) -> u64 {
        self.text + self.textsz
    }

    /// Remove whatever block is installed at `addr` from this region's
    /// directory entirely, regardless of whether that's the dense
    /// direct array, its residual map, or the sparse hash map. Used
    /// when a stale block is being replaced by a freshly retranslated
    /// one at the same address — unlike `clear_direct_if_present`, this
    /// also drops the sparse-map entry, since the old block must not be
    /// handed out by a later `lookup`/`reserve` at all.
    pub fn evict(&self, addr: u64) -> Option<Arc<Block>> {
        let mut storage = self.storage.write();
        match &mut *storage {
            Storage::Dense { direct, residual } => {
                if self.covers(addr) {
                    direct[self.direct_index(addr)].clear()
                } else {
                    residual.remove(&(addr - self.base))
                }
            }
            Storage::Sparse(map) => map.remove(&(addr - self.base)),
        }
    }

    /// Null the direct slot for `addr` if it falls in this region's
    /// window, without touching the hash map. Used when purging a freed
    /// father's sons: the son stays reachable through the hash map (see
    /// DESIGN.md's son-resource-release decision) but must not be
    /// handed out again through the fast direct-array path.
    pub fn clear_direct_if_present(&self, addr: u64) -> Option<Arc<Block>> {
        if !self.covers(addr) {
            return None;
        }
        let storage = self.storage.read();
        match &*storage {
            Storage::Dense { direct, .. } => direct[self.direct_index(addr)].clear(),
            Storage::Sparse(_) => None,
        }
    }

    /// `FreeDirectDynablock`: eagerly free every father-less block whose
    /// direct slot falls in `[addr, addr+size)`, clipped to this
    /// region's window; null the slot either way.
    pub fn free_direct_range<H: crate::host::EmulatorHost>(&self, host: &H, addr: u64, size: u64) {
        let (start, end) = self.clip(addr, size);
        if start >= end {
            return;
        }
        let storage = self.storage.read();
        if let Storage::Dense { direct, .. } = &*storage {
            for i in start..end {
                let idx = (i - self.text) as usize;
                if let Some(block) = direct[idx].load() {
                    if !block.has_father() {
                        crate::cache::link::free_block(host, &block);
                    }
                    direct[idx].clear();
                }
            }
        }
    }

    /// `MarkDirectDynablock`: lazily invalidate every block whose direct
    /// slot falls in `[addr, addr+size)`, clipped to this region's
    /// window.
    pub fn mark_direct_range<H: crate::host::EmulatorHost>(&self, host: &H, addr: u64, size: u64) {
        let (start, end) = self.clip(addr, size);
        if start >= end {
            return;
        }
        let storage = self.storage.read();
        if let Storage::Dense { direct, .. } = &*storage {
            for i in start..end {
                let idx = (i - self.text) as usize;
                if let Some(block) = direct[idx].load() {
                    crate::cache::link::mark_block(host, &block);
                }
            }
        }
    }

    fn clip(&self, addr: u64, size: u64) -> (u64, u64) {
        let start = addr.max(self.text);
        let end = (addr + size).min(self.text + self.textsz);
        (start, end)
    }

    /// `MarkDynablockList`: lazily invalidate every block in the region.
    pub fn mark_list<H: crate::host::EmulatorHost>(&self, host: &H) {
        let storage = self.storage.read();
        match &*storage {
            Storage::Sparse(map) => {
                for block in map.values() {
                    crate::cache::link::mark_block(host, block);
                }
            }
            Storage::Dense { direct, residual } => {
                for slot in direct.iter() {
                    if let Some(block) = slot.load() {
                        crate::cache::link::mark_block(host, &block);
                    }
                }
                for block in residual.values() {
                    crate::cache::link::mark_block(host, block);
                }
            }
        }
        log::debug!("region 0x{:x}: marked all blocks stale", self.text);
    }

    /// `FreeDynablockList`: free every father-less block, then drop the
    /// directory storage. The caller drops the `Arc<Region>` itself
    /// afterwards.
    pub fn free_list<H: crate::host::EmulatorHost>(region: &Arc<Self>, host: &H) {
        let mut storage = region.storage.write();
        match &mut *storage {
            Storage::Sparse(map) => {
                for block in map.values() {
                    if !block.has_father() {
                        crate::cache::link::free_block(host, block);
                    }
                }
                map.clear();
            }
            Storage::Dense { direct, residual } => {
                for slot in direct.iter() {
                    if let Some(block) = slot.clear() {
                        if !block.has_father() {
                            crate::cache::link::free_block(host, &block);
                        }
                    }
                }
                for block in residual.values() {
                    if !block.has_father() {
                        crate::cache::link::free_block(host, block);
                    }
                }
                residual.clear();
            }
        }
        log::info!("region 0x{:x}: freed (nolinker={})", region.text, region.nolinker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::StubHost;

    #[test]
    fn create_lookup_and_free_in_direct_mode() {
        let region = Region::new(0x1000, 0x1000, 0x100, false, true);
        let host = StubHost::default();
        let (block, created) = region.reserve(0x1040);
        assert!(created);
        host.fill(&block, 0x1040, &[0x90]);

        let again = region.lookup(0x1040).expect("block should be present");
        assert!(Arc::ptr_eq(&block, &again));

        region.free_direct_range(&host, 0x1040, 1);
        assert!(region.lookup(0x1040).is_none());
    }

    #[test]
    fn hash_promotes_to_direct_at_magic_size() {
        let region = Region::new(0, 0x2000, 0x10000, false, false);
        let host = StubHost::default();

        let mut created_blocks = Vec::new();
        for i in 0..255u64 {
            let addr = 0x2000 + i;
            let (block, created) = region.reserve(addr);
            assert!(created);
            host.fill(&block, addr, &[0x90]);
            created_blocks.push((addr, block));
        }
        assert!(matches!(&*region.storage.read(), Storage::Sparse(_)));

        let addr255 = 0x2000 + 255;
        let (block255, created) = region.reserve(addr255);
        assert!(created);
        host.fill(&block255, addr255, &[0x90]);
        created_blocks.push((addr255, block255));

        assert!(matches!(&*region.storage.read(), Storage::Dense { .. }));
        for (addr, block) in &created_blocks {
            let found = region.lookup(*addr).expect("block reachable after promotion");
            assert!(Arc::ptr_eq(block, &found));
        }
    }

    #[test]
    fn covers_is_half_open() {
        let region = Region::new(0x1000, 0x1000, 0x100, false, true);
        assert!(region.covers(0x1000));
        assert!(region.covers(0x10ff));
        assert!(!region.covers(0x1100));
    }

    #[test]
    fn zero_textsz_disables_direct_mode() {
        let region = Region::new(0, 0x1000, 0, false, true);
        assert!(matches!(&*region.storage.read(), Storage::Sparse(_)));
        assert!(!region.covers(0x1000));
    }

    #[test]
    fn evict_removes_a_sparse_entry_entirely() {
        let region = Region::new(0, 0x5000, 0x10000, false, false);
        let host = StubHost::default();
        let (block, created) = region.reserve(0x5000);
        assert!(created);
        host.fill(&block, 0x5000, &[0x90]);
        assert!(region.lookup(0x5000).is_some());

        let evicted = region.evict(0x5000).expect("entry should have existed");
        assert!(Arc::ptr_eq(&block, &evicted));
        assert!(region.lookup(0x5000).is_none());

        // A second reserve at the same address must create a brand new
        // block rather than finding a stale map entry.
        let (fresh, created_again) = region.reserve(0x5000);
        assert!(created_again);
        assert!(!Arc::ptr_eq(&block, &fresh));
    }

    #[test]
    fn evict_removes_a_dense_entry_entirely() {
        let region = Region::new(0x1000, 0x1000, 0x100, false, true);
        let host = StubHost::default();
        let (block, _) = region.reserve(0x1010);
        host.fill(&block, 0x1010, &[0x90]);

        region.evict(0x1010);
        assert!(region.lookup(0x1010).is_none());
    }
}
