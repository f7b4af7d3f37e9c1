//! The link graph: wiring a block's outgoing jump slots to a known
//! callee, and severing those links again when a block goes stale or is
//! freed.
//!
//! Every function here only ever holds one block's lock at a time.
//! There is no lock-ordering discipline to follow (contrast box86's
//! "always lock the callee before the caller" rule) because no
//! operation needs two blocks' state mutably in view simultaneously —
//! each hop reads one block's edge, drops that lock, then moves to the
//! next block.

use std::sync::Arc;

use crate::cache::block::{resolve_father, Block, SlotRef};
use crate::host::EmulatorHost;

/// Wire `source`'s outgoing slot `index` directly to `callee`, and
/// register the back-reference on `callee`'s father so it can be
/// severed later. If the slot was already pointing at a different
/// callee, that callee's stale back-reference is removed first — a
/// later `mark_block`/`free_block` on the old callee must not sever a
/// slot that has since been legitimately relinked elsewhere.
pub fn link_callee(source: &Arc<Block>, index: usize, callee: &Arc<Block>) {
    let previous = {
        let mut state = source.state.lock();
        let previous = state.table.get(index).and_then(|slot| slot.callee.clone());
        if let Some(slot) = state.table.get_mut(index) {
            slot.callee = Some(callee.clone());
        }
        previous
    };
    if let Some(previous) = previous {
        remove_mark(&previous, source, index);
    }
    add_mark(callee, source, index);
}

/// `AddMark`. A no-op unless `callee`'s father lives in a `nolinker`
/// region — elsewhere the hardware's own jump target mispredict is the
/// recovery path and no back-reference bookkeeping is needed.
pub fn add_mark(callee: &Arc<Block>, source: &Arc<Block>, index: usize) {
    let father = resolve_father(callee);
    let mut state = father.state.lock();
    if let Some(marks) = state.marks.as_mut() {
        marks.insert(SlotRef::new(source, index));
    }
}

fn remove_mark(callee: &Arc<Block>, source: &Arc<Block>, index: usize) {
    let father = resolve_father(callee);
    let mut state = father.state.lock();
    if let Some(marks) = state.marks.as_mut() {
        marks.remove(&SlotRef::new(source, index));
    }
}

/// Sever every back-reference in `father.marks`: null each source
/// slot's `callee` in-process, ask the host to rewrite that slot's
/// generated jump back to the dispatcher trampoline, then leave
/// `father` with a fresh empty `marks` set (if it had one at all).
fn sever_incoming<H: EmulatorHost>(host: &H, father: &Arc<Block>) -> Vec<SlotRef> {
    let mut state = father.state.lock();
    let had_marks = state.marks.is_some();
    let marks: Vec<SlotRef> = state.marks.take().unwrap_or_default().into_iter().collect();
    if had_marks {
        state.marks = Some(Default::default());
    }
    drop(state);
    for slot_ref in &marks {
        if let Some(source) = slot_ref.source.upgrade() {
            {
                let mut src_state = source.state.lock();
                if let Some(slot) = src_state.table.get_mut(slot_ref.index) {
                    slot.callee = None;
                }
            }
            host.resettable(&source, slot_ref.index);
        }
    }
    marks
}

/// `MarkDynablock`: lazy invalidation. Marks `block`'s father stale and
/// severs every incoming link so no caller jumps straight into it
/// anymore; the block itself, its host code, and its sons all survive —
/// the next lookup re-validates it against the current guest bytes
/// before deciding whether to actually rebuild it.
pub fn mark_block<H: EmulatorHost>(host: &H, block: &Arc<Block>) {
    let father = resolve_father(block);
    father.state.lock().need_test = true;
    let severed = sever_incoming(host, &father);
    log::trace!(
        "block 0x{:x}: marked stale, {} incoming link(s) severed",
        father.guest_addr(),
        severed.len()
    );
}

/// `FreeDynablock`: eager invalidation. Severs incoming links, recurses
/// into every son — nulling the son's direct-array slot in its own
/// parent region before releasing its resources, since freeing a
/// father's sons still leaves them reachable through the hash map (see
/// the module's son-resource-release note) — releases the host
/// executable memory, and drops the block's own outgoing table. The
/// caller is responsible for removing `block` itself from its region's
/// directory; this function only releases in-memory resources.
pub fn free_block<H: EmulatorHost>(host: &H, block: &Arc<Block>) {
    sever_incoming(host, block);

    let sons = std::mem::take(&mut block.state.lock().sons);
    for son in &sons {
        if let Some(region) = son.parent.upgrade() {
            region.clear_direct_if_present(son.guest_addr());
        }
        free_block(host, son);
    }

    let (host_code, guest_addr, table_len) = {
        let mut state = block.state.lock();
        let code = state.host_code.take();
        state.table.clear();
        (code, state.guest_addr, state.table.len())
    };
    if let Some(code) = host_code {
        host.free_dynarec_map(code.ptr, code.size);
    }
    log::debug!(
        "block 0x{:x}: freed ({} son(s) released, {} outgoing slot(s) dropped)",
        guest_addr,
        sons.len(),
        table_len
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::region::Region;
    use crate::host::tests::StubHost;

    #[test]
    fn mark_severs_incoming_links_but_keeps_the_block() {
        let region = Region::new(0, 0x1000, 0x100, true, true);
        let host = StubHost::default();

        let (caller, _) = region.reserve(0x1000);
        host.fill_block(&caller, 0x1000).unwrap();
        caller.state.lock().table.push(crate::cache::block::LinkSlot::default());

        let (callee, _) = region.reserve(0x1010);
        host.fill_block(&callee, 0x1010).unwrap();

        link_callee(&caller, 0, &callee);
        assert!(caller.state.lock().table[0].callee.is_some());

        mark_block(&host, &callee);
        assert!(callee.state.lock().need_test);
        assert!(caller.state.lock().table[0].callee.is_none());
    }

    #[test]
    fn free_cascades_into_sons_and_nulls_their_direct_slot() {
        let region = Region::new(0, 0x2000, 0x100, false, true);
        let host = StubHost::default();

        let (father, _) = region.reserve(0x2000);
        host.fill_block(&father, 0x2000).unwrap();
        let (son, _) = region.reserve(0x2010);
        host.fill_block(&son, 0x2010).unwrap();
        father.add_son(son.clone());
        // `reserve` already installed `son` in the region's own slot;
        // simulate the direct-array bookkeeping a real translator
        // would have, since `add_son` only records the father/son edge.
        assert!(region.lookup(0x2010).is_some());

        free_block(&host, &father);

        assert!(father.host_code_ptr().is_none());
        assert!(son.host_code_ptr().is_none());
        assert!(region.lookup(0x2010).is_none(), "son's direct slot must be nulled on father free");
    }

    #[test]
    fn relinking_a_slot_removes_the_stale_backreference() {
        let region = Region::new(0, 0x3000, 0x100, true, true);
        let host = StubHost::default();

        let (caller, _) = region.reserve(0x3000);
        host.fill_block(&caller, 0x3000).unwrap();
        caller.state.lock().table.push(crate::cache::block::LinkSlot::default());

        let (old_callee, _) = region.reserve(0x3010);
        host.fill_block(&old_callee, 0x3010).unwrap();
        let (new_callee, _) = region.reserve(0x3020);
        host.fill_block(&new_callee, 0x3020).unwrap();

        link_callee(&caller, 0, &old_callee);
        link_callee(&caller, 0, &new_callee);

        // Marking the *old* callee must not sever the slot, since it no
        // longer points there.
        mark_block(&host, &old_callee);
        assert!(caller.state.lock().table[0].callee.is_some());

        // Marking the *new* callee (the live target) does sever it.
        mark_block(&host, &new_callee);
        assert!(caller.state.lock().table[0].callee.is_none());
    }

    #[test]
    fn add_mark_is_noop_without_nolinker() {
        let region = Region::new(0, 0x1000, 0x100, false, true);
        let host = StubHost::default();
        let (caller, _) = region.reserve(0x1000);
        host.fill_block(&caller, 0x1000).unwrap();
        caller.state.lock().table.push(crate::cache::block::LinkSlot::default());
        let (callee, _) = region.reserve(0x1010);
        host.fill_block(&callee, 0x1010).unwrap();

        link_callee(&caller, 0, &callee);
        // No marks set was ever allocated, so there is nothing to sever.
        mark_block(&host, &callee);
        assert!(caller.state.lock().table[0].callee.is_some());
    }
}
