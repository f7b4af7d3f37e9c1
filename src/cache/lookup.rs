//! The top-level entry point an emulator's dispatch loop calls on every
//! taken branch: `DBGetBlock`.

use std::sync::Arc;

use crate::cache::block::{resolve_father, Block};
use crate::cache::hash;
use crate::cache::link;
use crate::cache::region::Region;
use crate::common::HostError;
use crate::host::{AmbientContext, EmulatorHost};

/// Find (or build) the block covering `addr`. Returns `Ok(None)` when
/// `addr` isn't covered by any registered region at all — the caller
/// should fall back to its interpreter rather than treat that as an
/// error.
///
/// A caller that loses the creation race to another thread gets back
/// the same, not-yet-populated shell the winner is still translating —
/// it must fall back to its interpreter for this call rather than wait,
/// since `FillBlock` is allowed to recurse into this very function for
/// a self-referential jump target (see `cache::block::Block`).
pub fn db_get_block<H: EmulatorHost>(
    ctx: &AmbientContext<H>,
    addr: u64,
) -> Result<Option<Arc<Block>>, HostError> {
    let Some(region) = ctx.host.region_for_address(addr) else {
        return Ok(None);
    };
    let block = internal_get_block(ctx, &region, addr)?;
    Ok(Some(block))
}

fn internal_get_block<H: EmulatorHost>(
    ctx: &AmbientContext<H>,
    region: &Arc<Region>,
    addr: u64,
) -> Result<Arc<Block>, HostError> {
    if let Some(existing) = region.lookup(addr) {
        return validate_and_maybe_rebuild(ctx, region, addr, existing);
    }
    build_new(ctx, region, addr)
}

fn build_new<H: EmulatorHost>(
    ctx: &AmbientContext<H>,
    region: &Arc<Region>,
    addr: u64,
) -> Result<Arc<Block>, HostError> {
    let (block, created) = region.reserve(addr);
    if created {
        // Only the thread that actually created the shell runs the
        // translator; every other concurrent caller observed `created
        // == false` and got the same `Arc<Block>` handed back instead.
        // The dump mutex only needs to be held while dumping is on —
        // it serializes `FillBlock` with the cache's debug dump output,
        // nothing else.
        let _guard = ctx.host.dump_enabled().then(|| ctx.dump_mutex.lock());
        ctx.host.fill_block(&block, addr)?;
    }
    Ok(block)
}

/// If `block`'s father was marked stale since it was last used, re-hash
/// the guest bytes underneath it. An unchanged hash means the write
/// that triggered invalidation didn't actually touch this block's
/// bytes (aliased cache line, adjacent instruction, etc.) — in that
/// case the existing host code is still valid and is kept. A changed
/// hash means the block is freed and retranslated from scratch.
fn validate_and_maybe_rebuild<H: EmulatorHost>(
    ctx: &AmbientContext<H>,
    region: &Arc<Region>,
    addr: u64,
    block: Arc<Block>,
) -> Result<Arc<Block>, HostError> {
    let father = resolve_father(&block);
    if !father.need_test() {
        return Ok(block);
    }

    let bytes = ctx.host.read_guest(block.guest_addr(), block.guest_size());
    if hash::x31(&bytes) == father.current_hash() {
        father.clear_need_test();
        return Ok(block);
    }

    log::debug!("block 0x{:x}: content changed, retranslating", block.guest_addr());
    link::free_block(&ctx.host, &block);
    region.evict(addr);
    build_new(ctx, region, addr)
}
