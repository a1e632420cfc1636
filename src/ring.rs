// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded, lock-free, multi-producer/multi-consumer ring buffer with
// independent per-consumer read cursors. Generalizes `proto::shm_ring`'s
// SPSC claim/commit primitives (header layout, power-of-two masking) and
// `channel.rs`'s MPMC force-push/fragmentation discipline from a fixed
// 64-byte slot width and 32-receiver cap to a parametric slot width `W`
// and consumer capacity `C`.
//
// Producer side uses a CAS ticket loop on `producer_seq` (re-validating
// capacity on every retry, not just once before the first attempt) plus a
// "ready" flag per slot; a claimant may advance the shared `committed_seq`
// only after confirming every slot up to its own is itself marked ready —
// the CAS-based complete-prefix discipline described in the ring buffer's
// contract.
//
// Same struct, same algorithm, two storage backings (§4.1 "Shared-memory
// variant: identical algorithm, same struct, laid out via `#[repr(C)]`
// inside a `ShmHandle`-backed region instead of a `Box`"): `Storage::Heap`
// for intra-process Contexts, `Storage::Shm` for the IPC Context, opened
// with [`RingBuffer::open_ipc`].

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::IpcOwnership;
use crate::envelope::Envelope;
use crate::error::{Result, TipsError};
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::spin_lock::adaptive_yield_pub as adaptive_yield;

const CONSUMER_DEAD: u8 = 0;
const CONSUMER_LIVE: u8 = 1;
const CONSUMER_PURGED: u8 = 2;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One ring slot: a "ready" publication flag plus the envelope itself,
/// stored inline (not behind an `Option`) so the layout is stable enough
/// to place directly inside shared memory — presence is carried entirely
/// by `ready`, exactly as `proto::shm_ring`'s `Header` tracks occupancy
/// out-of-band from its slot payloads.
#[repr(C)]
struct Slot<const W: usize> {
    /// 0 = never written; otherwise `seq + 1` of the envelope currently
    /// resident, set with `Release` after the payload is written so
    /// consumers observing it with `Acquire` see a fully-initialized slot.
    ready: AtomicU64,
    cell: std::cell::UnsafeCell<Envelope<W>>,
}

// Exactly one producer ever holds write access to a given slot at a time
// (enforced by the claim backpressure check below); readers only ever take
// shared references after observing `ready` with Acquire ordering.
unsafe impl<const W: usize> Sync for Slot<W> {}

impl<const W: usize> Slot<W> {
    fn new() -> Self {
        Self {
            ready: AtomicU64::new(0),
            cell: std::cell::UnsafeCell::new(Envelope::default()),
        }
    }
}

/// One of `C` preallocated independent consumer read cursors.
#[repr(C)]
struct ConsumerSlot {
    read_seq: AtomicU64,
    progress: AtomicU64,
    state: AtomicU8,
    admitted_at_millis: AtomicU64,
}

impl ConsumerSlot {
    fn new() -> Self {
        Self {
            read_seq: AtomicU64::new(0),
            progress: AtomicU64::new(0),
            state: AtomicU8::new(CONSUMER_DEAD),
            admitted_at_millis: AtomicU64::new(0),
        }
    }
}

/// Header preceding the `D` slots in both the heap and shm layouts:
/// producer/committed cursors plus the fixed-size consumer cursor array.
/// `constructed` guards the shm variant's first-touch zero-init (mirrors
/// `proto::shm_ring::Header`'s own `constructed` flag).
#[repr(C)]
struct Header<const C: usize> {
    producer_seq: AtomicU64,
    committed_seq: AtomicU64,
    constructed: AtomicBool,
    consumers: [ConsumerSlot; C],
}

impl<const C: usize> Header<C> {
    fn new() -> Self {
        Self {
            producer_seq: AtomicU64::new(0),
            committed_seq: AtomicU64::new(0),
            constructed: AtomicBool::new(true),
            consumers: std::array::from_fn(|_| ConsumerSlot::new()),
        }
    }
}

enum Storage<const W: usize, const C: usize> {
    Heap { header: Box<Header<C>>, slots: Box<[Slot<W>]> },
    Shm { handle: ShmHandle },
}

/// A claimed, not-yet-committed range of slots. The caller writes
/// envelopes into `[begin, begin+len)` via [`RingBuffer::slot_mut`], then
/// calls [`RingBuffer::commit`].
pub struct Claim {
    pub begin: u64,
    pub len: usize,
}

/// Bounded MPMC ring buffer of `D` slots of width `W` bytes, supporting up
/// to `C` independent consumer cursors.
///
/// `D` must be a power of two. Usable both heap-resident (intra-process)
/// and, with identical layout/algorithm, placed inside a shared-memory
/// segment for the IPC transport (see [`RingBuffer::open_ipc`]).
pub struct RingBuffer<const W: usize, const C: usize> {
    storage: Storage<W, C>,
    depth: u64,
    mask: u64,
}

impl<const W: usize, const C: usize> RingBuffer<W, C> {
    /// Create a new heap-resident ring buffer with `depth` slots (must be
    /// a power of two) and `C` preallocated, initially-dead consumer
    /// slots.
    pub fn new(depth: usize) -> Self {
        assert!(depth.is_power_of_two(), "RingBuffer depth must be a power of two");
        let mut slots = Vec::with_capacity(depth);
        slots.resize_with(depth, Slot::new);
        Self {
            storage: Storage::Heap {
                header: Box::new(Header::new()),
                slots: slots.into_boxed_slice(),
            },
            depth: depth as u64,
            mask: depth as u64 - 1,
        }
    }

    /// Bytes required for a shm-resident instance of `depth` slots (header
    /// plus the slot array), used by [`Self::open_shm`]/[`Self::open_ipc`].
    fn shm_layout_size(depth: usize) -> usize {
        std::mem::size_of::<Header<C>>() + std::mem::size_of::<Slot<W>>() * depth
    }

    /// Map (or create) a single shm-resident ring buffer named `name`.
    /// First-touch zero-init guarded by the header's `constructed` flag,
    /// mirroring `proto::shm_ring::ShmRing::open_or_create`'s own pattern
    /// and its accepted race: two processes racing to create the segment
    /// both observe a freshly-zeroed mapping and at worst redundantly
    /// zero it again, never partially.
    pub fn open_shm(name: &str, depth: usize, mode: ShmOpenMode) -> io::Result<Self> {
        assert!(depth.is_power_of_two(), "RingBuffer depth must be a power of two");
        let size = Self::shm_layout_size(depth);
        let handle = ShmHandle::acquire(name, size, mode)?;
        let header = unsafe { &*(handle.get() as *const Header<C>) };
        if !header.constructed.load(Ordering::Acquire) {
            unsafe { std::ptr::write_bytes(handle.get(), 0, size) };
            header.constructed.store(true, Ordering::Release);
        }
        Ok(Self {
            storage: Storage::Shm { handle },
            depth: depth as u64,
            mask: depth as u64 - 1,
        })
    }

    /// Open a shm-resident ring per `ownership`'s policy (Open Question
    /// #1: `Optional` resolves to create-or-attach with randomized
    /// backoff, 3 attempts).
    pub fn open_ipc(name: &str, depth: usize, ownership: IpcOwnership) -> io::Result<Self> {
        match ownership {
            IpcOwnership::Own => Self::open_shm(name, depth, ShmOpenMode::Create),
            IpcOwnership::Attach => Self::open_shm(name, depth, ShmOpenMode::Open),
            IpcOwnership::Optional => {
                let mut last_err = None;
                for attempt in 0..3u32 {
                    match Self::open_shm(name, depth, ShmOpenMode::CreateOrOpen) {
                        Ok(ring) => return Ok(ring),
                        Err(e) => {
                            last_err = Some(e);
                            let backoff_ms = 1 + (attempt as u64 * 2) % 5;
                            std::thread::sleep(Duration::from_millis(backoff_ms));
                        }
                    }
                }
                Err(last_err.unwrap())
            }
        }
    }

    fn header(&self) -> &Header<C> {
        match &self.storage {
            Storage::Heap { header, .. } => header,
            Storage::Shm { handle } => unsafe { &*(handle.get() as *const Header<C>) },
        }
    }

    fn slot_ref(&self, seq: u64) -> &Slot<W> {
        let idx = (seq & self.mask) as usize;
        match &self.storage {
            Storage::Heap { slots, .. } => &slots[idx],
            Storage::Shm { handle } => unsafe {
                let base = handle.get().add(std::mem::size_of::<Header<C>>()) as *const Slot<W>;
                &*base.add(idx)
            },
        }
    }

    /// The minimum read cursor across all live consumers, or the producer
    /// sequence itself if there are none (an empty buffer never blocks a
    /// producer).
    fn min_live_read_seq(&self) -> u64 {
        let header = self.header();
        let mut min = header.producer_seq.load(Ordering::Acquire);
        for c in header.consumers.iter() {
            if c.state.load(Ordering::Acquire) == CONSUMER_LIVE {
                min = min.min(c.read_seq.load(Ordering::Acquire));
            }
        }
        min
    }

    /// Reserve `n` consecutive slots. Spins (adaptive backoff) while the
    /// buffer cannot currently admit `n` slots because a live consumer has
    /// not caught up.
    pub fn claim(&self, n: usize) -> Claim {
        let mut k = 0u32;
        loop {
            if let Some(c) = self.try_claim(n) {
                return c;
            }
            adaptive_yield(&mut k);
        }
    }

    /// Non-blocking variant of [`claim`]. Returns `None` when the buffer
    /// cannot currently admit `n` slots.
    ///
    /// Capacity is re-validated inside a `compare_exchange` loop on
    /// `producer_seq` rather than checked once before an unconditional
    /// `fetch_add`: two producers that both pass a stale check could
    /// otherwise both advance the ticket, pushing `producer - min_read`
    /// past `depth` and overwriting a slot a live consumer has not yet
    /// read. Each retry re-reads `min_live_read_seq` against the CAS's own
    /// failed `producer` value, so a ticket is only ever handed out when
    /// it is still valid at the instant it's granted.
    pub fn try_claim(&self, n: usize) -> Option<Claim> {
        if n == 0 || n as u64 > self.depth {
            return None;
        }
        let header = self.header();
        let mut producer = header.producer_seq.load(Ordering::Relaxed);
        loop {
            let min_read = self.min_live_read_seq();
            if producer.wrapping_sub(min_read) > self.depth - n as u64 {
                return None;
            }
            match header.producer_seq.compare_exchange_weak(
                producer,
                producer + n as u64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(begin) => return Some(Claim { begin, len: n }),
                Err(actual) => producer = actual,
            }
        }
    }

    /// Mutable access to a claimed slot, by offset from `claim.begin`.
    ///
    /// # Safety
    /// The caller must only write to offsets `< claim.len` and must not
    /// retain the reference past the matching `commit` call.
    pub fn slot_mut(&self, claim: &Claim, offset: usize) -> &mut Envelope<W> {
        debug_assert!(offset < claim.len);
        unsafe { &mut *self.slot_ref(claim.begin + offset as u64).cell.get() }
    }

    /// Publish the claimed range. Commits may arrive out of order across
    /// concurrent producers; `committed_seq` only advances through a
    /// contiguous prefix of ready slots (complete-prefix discipline).
    pub fn commit(&self, claim: Claim) {
        for i in 0..claim.len {
            let seq = claim.begin + i as u64;
            self.slot_ref(seq).ready.store(seq + 1, Ordering::Release);
        }
        self.advance_committed();
    }

    fn advance_committed(&self) {
        let header = self.header();
        let mut k = 0u32;
        loop {
            let committed = header.committed_seq.load(Ordering::Acquire);
            let ready = self.slot_ref(committed).ready.load(Ordering::Acquire);
            if ready != committed + 1 {
                return; // next slot not yet committed by its producer
            }
            if header
                .committed_seq
                .compare_exchange_weak(committed, committed + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // another thread is also advancing; retry reading state
                adaptive_yield(&mut k);
                continue;
            }
        }
    }

    /// Publish `envelope` as a single-slot message (the common case).
    pub fn publish(&self, envelope: Envelope<W>) {
        let claim = self.claim(1);
        *self.slot_mut(&claim, 0) = envelope;
        self.commit(claim);
    }

    /// Non-blocking variant of [`publish`].
    pub fn try_publish(&self, envelope: Envelope<W>) -> Result<()> {
        let claim = self
            .try_claim(1)
            .ok_or(TipsError::CapacityExceeded { requested: 1 })?;
        *self.slot_mut(&claim, 0) = envelope;
        self.commit(claim);
        Ok(())
    }

    /// Admit a new consumer, returning its slot index. The cursor starts
    /// at the current committed sequence (it does not receive history).
    /// Returns `None` if all `C` slots are occupied by live consumers.
    pub fn admit_consumer(&self) -> Option<usize> {
        let header = self.header();
        for (idx, c) in header.consumers.iter().enumerate() {
            if c.state
                .compare_exchange(CONSUMER_DEAD, CONSUMER_LIVE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
                || c.state
                    .compare_exchange(CONSUMER_PURGED, CONSUMER_LIVE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let committed = header.committed_seq.load(Ordering::Acquire);
                c.read_seq.store(committed, Ordering::Release);
                c.progress.store(0, Ordering::Release);
                c.admitted_at_millis.store(now_millis(), Ordering::Release);
                return Some(idx);
            }
        }
        None
    }

    pub fn retire_consumer(&self, slot: usize) {
        self.header().consumers[slot].state.store(CONSUMER_DEAD, Ordering::Release);
    }

    /// Range of slots available to consumer `slot`, clamped to at most
    /// `batch_max` entries. Returns `(begin, end)`, half-open.
    pub fn peek(&self, slot: usize, batch_max: usize) -> (u64, u64) {
        let header = self.header();
        let c = &header.consumers[slot];
        let begin = c.read_seq.load(Ordering::Acquire);
        let committed = header.committed_seq.load(Ordering::Acquire);
        let end = committed.min(begin + batch_max as u64);
        (begin, end.max(begin))
    }

    /// Shared access to the envelope at absolute sequence `seq`. Only
    /// valid for `seq` within a range previously returned by [`peek`] for
    /// a live consumer (guarantees the producer hasn't wrapped onto it).
    pub fn slot(&self, seq: u64) -> &Envelope<W> {
        unsafe { &*self.slot_ref(seq).cell.get() }
    }

    /// Advance consumer `slot`'s read cursor by `count` and bump its
    /// proof-of-life counter (read by the purger).
    pub fn waste(&self, slot: usize, count: u64) {
        let c = &self.header().consumers[slot];
        c.read_seq.fetch_add(count, Ordering::AcqRel);
        c.progress.fetch_add(1, Ordering::Release);
    }

    /// Atomically claim exactly `count` messages starting at `expected`
    /// for consumer `slot` — the shared-slot claiming primitive partition
    /// mode builds on (§4.5 "the pool shares one consumer slot"). Returns
    /// `false` if another pool member already advanced past `expected`;
    /// the caller should reread [`Self::read_seq`] and retry against the
    /// new position rather than assume the unit was skipped.
    pub fn try_claim_read(&self, slot: usize, expected: u64, count: u64) -> bool {
        let c = &self.header().consumers[slot];
        let ok = c
            .read_seq
            .compare_exchange(expected, expected + count, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if ok {
            c.progress.fetch_add(1, Ordering::Release);
        }
        ok
    }

    /// Proof-of-life counter for consumer `slot`, used by the purger to
    /// detect a stuck reader (unchanged across a full purge interval).
    pub fn progress_of(&self, slot: usize) -> u64 {
        self.header().consumers[slot].progress.load(Ordering::Acquire)
    }

    pub fn admitted_at_millis(&self, slot: usize) -> u64 {
        self.header().consumers[slot].admitted_at_millis.load(Ordering::Acquire)
    }

    pub fn is_live(&self, slot: usize) -> bool {
        self.header().consumers[slot].state.load(Ordering::Acquire) == CONSUMER_LIVE
    }

    /// Mark consumer `slot` dead (stuck) and reclaim it for reuse. Returns
    /// `true` if the slot was live and is now purged.
    pub fn purge_consumer(&self, slot: usize) -> bool {
        self.header().consumers[slot]
            .state
            .compare_exchange(CONSUMER_LIVE, CONSUMER_PURGED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn committed_seq(&self) -> u64 {
        self.header().committed_seq.load(Ordering::Acquire)
    }

    pub fn producer_seq(&self) -> u64 {
        self.header().producer_seq.load(Ordering::Acquire)
    }

    pub fn read_seq(&self, slot: usize) -> u64 {
        self.header().consumers[slot].read_seq.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    pub fn consumer_capacity(&self) -> usize {
        C
    }
}
