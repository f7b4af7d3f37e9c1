//! One translated unit of guest code.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::region::Region;

/// Executable host memory owned by a [`Block`], released through
/// [`crate::host::EmulatorHost::free_dynarec_map`] — never by `Drop`,
/// since freeing it requires the external allocator and must happen at a
/// precise point in the free sequence (see `cache::link::free_block`).
pub struct HostCode {
    pub ptr: *mut u8,
    pub size: usize,
}

// The pointer is opaque executable memory handed to us by the code
// generator; nothing in this crate dereferences it.
unsafe impl Send for HostCode {}
unsafe impl Sync for HostCode {}

/// One outgoing link slot: up to three code-generator-defined words plus
/// the block currently jumped to, if linked.
#[derive(Default)]
pub struct LinkSlot {
    pub words: [u64; 3],
    pub callee: Option<Arc<Block>>,
}

/// Identifies one incoming edge: the `index`-th outgoing slot of
/// `source`. Hashed and compared by the raw address a `Weak` points at
/// ([`Weak::as_ptr`]), never by dereferencing it — this is exactly the
/// "arena-interned slot handle" the design notes ask for, using `Weak`
/// as the arena.
#[derive(Clone)]
pub struct SlotRef {
    pub source: Weak<Block>,
    pub index: usize,
}

impl SlotRef {
    pub fn new(source: &Arc<Block>, index: usize) -> Self {
        Self { source: Arc::downgrade(source), index }
    }
}

impl PartialEq for SlotRef {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && Weak::as_ptr(&self.source) == Weak::as_ptr(&other.source)
    }
}
impl Eq for SlotRef {}

impl Hash for SlotRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Weak::as_ptr(&self.source).hash(state);
        self.index.hash(state);
    }
}

/// The mutable part of a [`Block`], all behind one lock.
///
/// A single lock per block keeps the free/mark algorithms simple (see
/// `cache::link`): every critical section here is short and never holds
/// a second block's lock at the same time, so there is no lock-ordering
/// rule to get wrong.
pub(crate) struct BlockState {
    pub guest_addr: u64,
    pub guest_size: u64,
    pub host_code: Option<HostCode>,
    pub hash: u32,
    pub table: Vec<LinkSlot>,
    /// Present iff the owning region is `nolinker`. Only a father ever
    /// has this populated (invariant 3 in spec.md §3).
    pub marks: Option<HashSet<SlotRef>>,
    pub sons: Vec<Arc<Block>>,
    pub father: Option<Weak<Block>>,
    pub need_test: bool,
}

pub struct Block {
    pub parent: Weak<Region>,
    pub(crate) state: Mutex<BlockState>,
}

impl Block {
    /// An empty shell, installed in a region's directory before the
    /// external code generator populates it. Safe to observe, not safe
    /// to execute (per the external contract in spec.md §4.2).
    pub fn new_shell(guest_addr: u64) -> Arc<Self> {
        Arc::new(Self {
            parent: Weak::new(),
            state: Mutex::new(BlockState {
                guest_addr,
                guest_size: 0,
                host_code: None,
                hash: 0,
                table: Vec::new(),
                marks: None,
                sons: Vec::new(),
                father: None,
                need_test: false,
            }),
        })
    }

    pub(crate) fn new_in_region(guest_addr: u64, parent: &Arc<Region>) -> Arc<Self> {
        Arc::new(Self {
            parent: Arc::downgrade(parent),
            state: Mutex::new(BlockState {
                guest_addr,
                guest_size: 0,
                host_code: None,
                hash: 0,
                table: Vec::new(),
                marks: None,
                sons: Vec::new(),
                father: None,
                need_test: false,
            }),
        })
    }

    /// Allocate the `marks` back-reference set. Called by the lookup
    /// path right after creation, iff the owning region is `nolinker`.
    pub fn init_marks(&self) {
        let mut state = self.state.lock();
        if state.marks.is_none() {
            state.marks = Some(HashSet::new());
        }
    }

    /// Called by the external code generator (`FillBlock`) once
    /// translation of this block is complete.
    pub fn populate(&self, guest_bytes: &[u8], host_code: HostCode, table: Vec<LinkSlot>) {
        let hash = crate::cache::hash::x31(guest_bytes);
        let mut state = self.state.lock();
        state.guest_size = guest_bytes.len() as u64;
        state.hash = hash;
        state.host_code = Some(host_code);
        state.table = table;
    }

    /// Record a son produced as a side effect of translating this block.
    pub fn add_son(self: &Arc<Self>, son: Arc<Block>) {
        {
            let mut son_state = son.state.lock();
            son_state.father = Some(Arc::downgrade(self));
        }
        self.state.lock().sons.push(son);
    }

    pub fn guest_addr(&self) -> u64 {
        self.state.lock().guest_addr
    }

    pub fn guest_size(&self) -> u64 {
        self.state.lock().guest_size
    }

    pub fn need_test(&self) -> bool {
        self.state.lock().need_test
    }

    pub fn has_father(&self) -> bool {
        self.state.lock().father.is_some()
    }

    pub fn father(&self) -> Option<Arc<Block>> {
        self.state.lock().father.as_ref().and_then(Weak::upgrade)
    }

    pub fn host_code_ptr(&self) -> Option<(*mut u8, usize)> {
        self.state.lock().host_code.as_ref().map(|h| (h.ptr, h.size))
    }

    pub fn table_len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn current_hash(&self) -> u32 {
        self.state.lock().hash
    }

    pub(crate) fn clear_need_test(&self) {
        self.state.lock().need_test = false;
    }
}

/// Resolve a block to the block that owns its staleness/marks/lifecycle:
/// its father if it has one, itself otherwise. Sons never carry `marks`.
pub fn resolve_father(block: &Arc<Block>) -> Arc<Block> {
    block.father().unwrap_or_else(|| block.clone())
}
