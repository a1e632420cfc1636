// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// 65536-slot atomic subscription counter table, keyed by 16-bit type tag.
// Grounded on `proto::service_registry`'s shm-array-with-spinlock-header
// shape; unlike the registry, the hot-path operations here (`add`/`sub`/
// `check`) never take the spinlock — only first-touch initialization does.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::envelope::TypeTag;
use crate::spin_lock::SpinLock;

const TABLE_SIZE: usize = 1 << 16;

/// A 65536-entry reference-counted subscription table keyed by type tag.
///
/// `add`/`sub` are reference counts; `set`/`unset` are idempotent booleans
/// layered on top via `check(tag) == 0`. Process-local by default; the IPC
/// variant places the same layout in shared memory (see
/// [`SubscriptionTable::shm_layout_size`]) so any process on host can query
/// "does anyone locally want tag τ?" without IPC round-trips.
pub struct SubscriptionTable {
    counters: Box<[AtomicU32]>,
    init_guard: SpinLock,
    constructed: AtomicBool,
}

impl SubscriptionTable {
    /// A heap-resident table for process-local use.
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(TABLE_SIZE);
        v.resize_with(TABLE_SIZE, || AtomicU32::new(0));
        Self {
            counters: v.into_boxed_slice(),
            init_guard: SpinLock::new(),
            constructed: AtomicBool::new(true),
        }
    }

    /// Bytes required for a shared-memory-resident instance of this table
    /// (a flat `[AtomicU32; 65536]`, matching the layout §6 describes for
    /// the sibling `<domain>-ipcsubs` region).
    pub const fn shm_layout_size() -> usize {
        TABLE_SIZE * std::mem::size_of::<u32>()
    }

    /// Increment the reference count for `tag`.
    pub fn add(&self, tag: TypeTag) {
        self.counters[tag as usize].fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the reference count for `tag`. Saturates at zero.
    pub fn sub(&self, tag: TypeTag) {
        let counter = &self.counters[tag as usize];
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return;
            }
            match counter.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current reference count for `tag`. Zero means no local subscriber.
    pub fn check(&self, tag: TypeTag) -> u32 {
        self.counters[tag as usize].load(Ordering::Acquire)
    }

    /// Idempotently mark `tag` as subscribed (no-op if already nonzero).
    pub fn set(&self, tag: TypeTag) {
        if self.check(tag) == 0 {
            self.add(tag);
        }
    }

    /// Idempotently clear `tag` down to zero.
    pub fn unset(&self, tag: TypeTag) {
        let counter = &self.counters[tag as usize];
        counter.store(0, Ordering::Release);
    }

    /// Register every tag a Node's receive-type tuple resolves to (a fixed
    /// tag, or every tag in a tag-range), incrementing each.
    pub fn register_tags<I: IntoIterator<Item = TypeTag>>(&self, tags: I) {
        for tag in tags {
            self.add(tag);
        }
    }

    pub fn unregister_tags<I: IntoIterator<Item = TypeTag>>(&self, tags: I) {
        for tag in tags {
            self.sub(tag);
        }
    }

    /// Every tag with at least one local subscriber right now. Feeds the
    /// UDP advertiser's tag list and a newly-accepted TCP session's
    /// initial subscription batch (§4.7 "Advertisement"/"Discovery"); a
    /// full table scan, acceptable at the cadence this is called (once
    /// per advertisement tick or accepted connection, not the hot path).
    pub fn subscribed_tags(&self) -> Vec<TypeTag> {
        (0..TABLE_SIZE)
            .filter(|&t| self.counters[t].load(Ordering::Acquire) > 0)
            .map(|t| t as TypeTag)
            .collect()
    }

    /// One-time lazy init hook for a shm-resident instance reconstructed
    /// over raw bytes (mirrors `service_registry`'s DCLP init pattern).
    /// Not needed for the heap-resident constructor, which is always
    /// already zeroed.
    pub fn ensure_init(&self) {
        if !self.constructed.load(Ordering::Acquire) {
            self.init_guard.lock();
            if !self.constructed.load(Ordering::Relaxed) {
                for c in self.counters.iter() {
                    c.store(0, Ordering::Relaxed);
                }
                self.constructed.store(true, Ordering::Release);
            }
            self.init_guard.unlock();
        }
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_check_matches_pending_count() {
        let table = SubscriptionTable::new();
        assert_eq!(table.check(1002), 0);
        table.add(1002);
        table.add(1002);
        table.sub(1002);
        assert_eq!(table.check(1002), 1);
        table.sub(1002);
        assert_eq!(table.check(1002), 0);
        // sub on an already-zero counter must not underflow
        table.sub(1002);
        assert_eq!(table.check(1002), 0);
    }

    #[test]
    fn subscribed_tags_lists_every_nonzero_counter() {
        let table = SubscriptionTable::new();
        table.add(5);
        table.add(9000);
        table.add(9000);
        assert_eq!(table.subscribed_tags(), vec![5, 9000]);
        table.sub(9000);
        table.sub(9000);
        assert_eq!(table.subscribed_tags(), vec![5]);
    }

    #[test]
    fn set_unset_are_idempotent() {
        let table = SubscriptionTable::new();
        table.set(5);
        table.set(5);
        assert_eq!(table.check(5), 1);
        table.unset(5);
        table.unset(5);
        assert_eq!(table.check(5), 0);
    }
}
