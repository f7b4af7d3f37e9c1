//! Crate-wide error taxonomy.
//!
//! Per the module's error handling design, most outcomes here are not
//! errors at all: an address outside any region, a lookup race that this
//! call lost, and a stale block all resolve to ordinary `Option`/retry
//! control flow (see [`crate::cache::lookup::db_get_block`]). The only
//! case that propagates as a real error is a fatal allocation failure in
//! the external code generator.

use thiserror::Error;

/// A failure reported by a collaborator ([`crate::host::EmulatorHost`]).
///
/// Allocation failure is the cache's only fatal condition: the
/// translator cannot proceed without executable host memory for the
/// block it was asked to fill.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host executable-memory allocation failed for {size} bytes at guest 0x{guest_addr:x}")]
    AllocationFailed { guest_addr: u64, size: usize },
}
