//! The seam between this crate and the emulator it is embedded in.
//!
//! Everything the cache cannot decide on its own — where a guest address
//! lives, how to produce host code for it, how to read guest memory for
//! re-validation, how to release executable memory — is a method on
//! [`EmulatorHost`], implemented by the embedder.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::block::Block;
use crate::cache::region::Region;
use crate::common::HostError;

/// The collaborator an embedding emulator provides to the cache.
///
/// Implementations must be `Send + Sync`: blocks are looked up from
/// arbitrary guest threads concurrently.
pub trait EmulatorHost: Send + Sync {
    /// The region covering `addr`, if any has been registered for it.
    /// Returning `None` tells the cache this address isn't dynarec'd
    /// memory at all (the caller should fall back to its interpreter).
    fn region_for_address(&self, addr: u64) -> Option<Arc<Region>>;

    /// Translate the guest code at `addr` into host code and populate
    /// `block` with it (via [`Block::populate`]). Only ever called for
    /// a freshly reserved, empty block. The only error this crate
    /// surfaces: the host ran out of executable memory to hand back.
    fn fill_block(&self, block: &Arc<Block>, addr: u64) -> Result<(), HostError>;

    /// Release host executable memory previously produced by
    /// `fill_block`. Called at most once per block, exactly when that
    /// block's resources are released (see `cache::link::free_block`).
    fn free_dynarec_map(&self, ptr: *mut u8, size: usize);

    /// Read `len` bytes of guest memory starting at `addr`, for
    /// re-hashing a block suspected of being stale. Never called on a
    /// range the embedder hasn't actually mapped.
    fn read_guest(&self, addr: u64, len: u64) -> Vec<u8>;

    /// Rewrite `source`'s outgoing link slot `index` in the generated
    /// host code back to the dispatcher trampoline. Called exactly
    /// once per slot, every time `cache::link` actually severs that
    /// slot (`mark_block`/`free_block`) — never for a slot that is
    /// merely relinked to a different callee while still live.
    ///
    /// The default does nothing: a host with no machine-code patching
    /// of its own (an interpreter-backed stub, or a test host) is still
    /// sound, since this crate has already nulled the slot's `callee`
    /// on its own side — it just won't be taken again. A host with a
    /// real dispatcher trampoline should override this to patch the
    /// slot's generated jump in place.
    fn resettable(&self, source: &Arc<Block>, index: usize) {
        let _ = (source, index);
    }

    /// Whether the embedder wants the cache's human-readable directory
    /// dump (gated behind [`AmbientContext::dump_mutex`]) enabled at
    /// all. Defaults to `false`.
    fn dump_enabled(&self) -> bool {
        false
    }
}

/// Shared state the cache needs alongside a concrete [`EmulatorHost`]:
/// the host itself, plus a mutex that serializes `FillBlock` with the
/// cache's debug-dump output when [`EmulatorHost::dump_enabled`] is
/// set. The mutex is not on a correctness path for lookup, mark, or
/// free — only [`crate::cache::lookup::db_get_block`]'s call into
/// `fill_block` takes it, and only when dumping is enabled.
pub struct AmbientContext<H: EmulatorHost> {
    pub host: H,
    pub dump_mutex: Mutex<()>,
}

impl<H: EmulatorHost> AmbientContext<H> {
    pub fn new(host: H) -> Self {
        Self { host, dump_mutex: Mutex::new(()) }
    }
}
