// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Binds a RingBuffer, a set of resident subscribers, and the threads that
// run them. Two variants per §4.5: broadcast (every subscriber gets every
// message, one consumer slot each) and partition (messages load-balanced
// across a homogeneous pool sharing one consumer slot).
//
// The stuck-consumer purger is grounded on
// `original_source/hmbdc/app/StuckClientPurger.hpp`: a 1-second-tick loop
// that only actually purges every `purgeIntervalSeconds` ticks and enqueues
// a synthetic Flush envelope after doing so.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::attachment::Attachment;
use crate::dispatch::{DispatchOutcome, DispatchTable, RouteDecision, StopReason};
use crate::envelope::{Envelope, Scratchpad, TypeTag, TAG_FLUSH};
use crate::ring::RingBuffer;

/// How a Context distributes messages across its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    /// Every subscriber receives every published message subject to its
    /// type filter; each subscriber holds a distinct consumer slot.
    Broadcast,
    /// Each published message is delivered to exactly one subscriber
    /// (round-robin among a homogeneous pool); the pool shares one
    /// consumer slot.
    Partition,
}

/// A user subscriber/publisher with compile-time (here: construction-time)
/// declared message interests. One callback is invoked per dispatched
/// envelope, on exactly the thread the Context schedules for it — so a
/// given instance needs no internal locking.
pub trait Subscriber<const W: usize>: Send {
    fn dispatch_table(&self) -> &DispatchTable;

    /// `E.typeTag` matched declared interest `index`.
    fn on_message(&mut self, index: usize, payload: &[u8]) -> DispatchOutcome;

    /// An in-band attachment for declared interest `index` finished
    /// reassembling.
    fn on_attachment(&mut self, index: usize, payload: &[u8], attachment: Attachment) -> DispatchOutcome {
        let _ = (index, payload, attachment);
        DispatchOutcome::Continue
    }

    /// No declared interest matched; fires only if the subscriber admits
    /// raw bytes.
    fn on_just_bytes(&mut self, tag: TypeTag, payload: &[u8]) -> DispatchOutcome {
        let _ = (tag, payload);
        DispatchOutcome::Continue
    }

    fn on_batch_end(&mut self, _count: usize) {}
    fn on_start(&mut self) {}
    fn on_stop(&mut self, _reason: &StopReason) {}

    /// Human-readable name used in logs and in `TipsError::CallbackFailure`.
    fn name(&self) -> &str {
        "subscriber"
    }
}

/// In-flight reassembly state for one multi-slot (attachment) message
/// currently being accumulated by a consumer (§4.2 reassembly algorithm).
struct Reassembly {
    original_tag: TypeTag,
    dispatch_index: usize,
    buf: Vec<u8>,
    remaining: usize,
}

/// Per-consumer dispatch loop state, kept outside the Subscriber trait
/// object so the Context can drive reassembly without the subscriber
/// needing to know about framing.
struct ConsumerLoop<const W: usize> {
    ring: Arc<RingBuffer<W, 64>>,
    slot: usize,
    batch_max: usize,
    /// `true` when `slot` is shared with other pool members (partition
    /// mode): every claim of a unit must go through
    /// `RingBuffer::try_claim_read` instead of the unconditional
    /// `peek`+`waste` pair broadcast mode uses, since another thread may
    /// be racing to claim the same range.
    shared: bool,
    reassembly: Option<Reassembly>,
}

impl<const W: usize> ConsumerLoop<W> {
    fn run(&mut self, subscriber: &mut dyn Subscriber<W>, stop: &AtomicBool) {
        subscriber.on_start();
        if self.shared {
            self.run_partition(subscriber, stop);
        } else {
            self.run_broadcast(subscriber, stop);
        }
    }

    fn run_broadcast(&mut self, subscriber: &mut dyn Subscriber<W>, stop: &AtomicBool) {
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let (begin, end) = self.ring.peek(self.slot, self.batch_max);
            if begin == end {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let mut failure = None;
            for seq in begin..end {
                let envelope = self.ring.slot(seq).clone();
                if envelope.type_tag == TAG_FLUSH {
                    continue;
                }
                match self.step(subscriber, &envelope) {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::Stop(reason) => {
                        failure = Some(reason);
                        break;
                    }
                }
            }
            let count = end - begin;
            subscriber.on_batch_end(count as usize);
            // filtering still advances the cursor (§4.5 step 4)
            self.ring.waste(self.slot, count);
            if let Some(reason) = failure {
                self.ring.retire_consumer(self.slot);
                subscriber.on_stop(&reason);
                break;
            }
        }
    }

    /// Partition-mode loop: the consumer slot is shared by the whole
    /// subscriber pool, so every unit of work (one plain envelope, or one
    /// attachment ref plus its segments) is claimed atomically via
    /// `try_claim_read` before this thread acts on it — exactly one pool
    /// member ever wins a given claim, giving exactly-once, load-balanced
    /// delivery (§4.5 "each published message is delivered to exactly one
    /// subscriber").
    fn run_partition(&mut self, subscriber: &mut dyn Subscriber<W>, stop: &AtomicBool) {
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let begin = self.ring.read_seq(self.slot);
            let committed = self.ring.committed_seq();
            if begin >= committed {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let first = self.ring.slot(begin).clone();
            let unit_len = if first.is_attachment_ref() {
                let reference = first.attachment_ref_payload();
                1 + (reference.attachment_len as usize).div_ceil(Envelope::<W>::segment_size()).max(1) as u64
            } else {
                1
            };
            if committed < begin + unit_len {
                // the rest of a multi-slot unit hasn't committed yet;
                // wait rather than claim a partial range.
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            if !self.ring.try_claim_read(self.slot, begin, unit_len) {
                continue; // another pool member already claimed this unit
            }

            if first.type_tag == TAG_FLUSH {
                subscriber.on_batch_end(1);
                continue;
            }

            let outcome = if unit_len == 1 {
                self.dispatch_typed(subscriber, &first)
            } else {
                self.dispatch_attachment(subscriber, begin, unit_len, &first)
            };
            subscriber.on_batch_end(1);
            if let DispatchOutcome::Stop(reason) = outcome {
                self.ring.retire_consumer(self.slot);
                subscriber.on_stop(&reason);
                break;
            }
        }
    }

    /// Route and dispatch a single non-attachment-ref envelope (shared by
    /// both broadcast's non-reassembly path and partition's single-slot
    /// path).
    fn dispatch_typed(&mut self, subscriber: &mut dyn Subscriber<W>, envelope: &Envelope<W>) -> DispatchOutcome {
        match subscriber.dispatch_table().route_envelope(envelope) {
            RouteDecision::Typed { index } => subscriber.on_message(index, envelope.payload()),
            RouteDecision::JustBytes => subscriber.on_just_bytes(envelope.type_tag, envelope.payload()),
            RouteDecision::AttachmentRef { .. } | RouteDecision::Unmatched => DispatchOutcome::Continue,
        }
    }

    /// Reassemble an attachment ref plus its segments inline, now that the
    /// whole `[begin, begin+unit_len)` range is exclusively claimed by
    /// this thread (no concurrent reader of the same segments is
    /// possible, unlike broadcast mode's streaming reassembly across
    /// separate `step` calls).
    fn dispatch_attachment(
        &mut self,
        subscriber: &mut dyn Subscriber<W>,
        begin: u64,
        unit_len: u64,
        reference_envelope: &Envelope<W>,
    ) -> DispatchOutcome {
        let decision = subscriber.dispatch_table().route_envelope(reference_envelope);
        let RouteDecision::AttachmentRef { index } = decision else {
            return DispatchOutcome::Continue;
        };
        let reference = reference_envelope.attachment_ref_payload();
        let mut buf = Vec::with_capacity(reference.attachment_len as usize);
        let mut remaining = reference.attachment_len as usize;
        for seq in (begin + 1)..(begin + unit_len) {
            if remaining == 0 {
                break;
            }
            let segment = self.ring.slot(seq);
            let take = segment.payload_len().min(remaining);
            buf.extend_from_slice(&segment.payload()[..take]);
            remaining -= take;
        }
        let attachment = Attachment::inline(buf.clone());
        subscriber.on_attachment(index, &buf, attachment)
    }

    /// Broadcast-mode per-envelope step, driving streaming reassembly
    /// state across successive calls (one envelope may arrive in a
    /// different `peek` batch than the next segment of the same
    /// attachment).
    fn step(&mut self, subscriber: &mut dyn Subscriber<W>, envelope: &Envelope<W>) -> DispatchOutcome {
        if let Some(r) = &mut self.reassembly {
            let take = envelope.payload_len().min(r.remaining);
            r.buf.extend_from_slice(&envelope.payload()[..take]);
            r.remaining -= take;
            if r.remaining == 0 {
                let Reassembly { dispatch_index, buf, original_tag, .. } = self.reassembly.take().unwrap();
                let _ = original_tag;
                let att = Attachment::inline(buf.clone());
                return subscriber.on_attachment(dispatch_index, &buf, att);
            }
            return DispatchOutcome::Continue;
        }

        let decision = subscriber.dispatch_table().route_envelope(envelope);
        match decision {
            RouteDecision::Typed { index } => subscriber.on_message(index, envelope.payload()),
            RouteDecision::AttachmentRef { index } => {
                let reference = envelope.attachment_ref_payload();
                self.reassembly = Some(Reassembly {
                    original_tag: reference.original_tag,
                    dispatch_index: index,
                    buf: Vec::with_capacity(reference.attachment_len as usize),
                    remaining: reference.attachment_len as usize,
                });
                DispatchOutcome::Continue
            }
            RouteDecision::JustBytes => subscriber.on_just_bytes(envelope.type_tag, envelope.payload()),
            RouteDecision::Unmatched => DispatchOutcome::Continue,
        }
    }
}

/// Binds one `RingBuffer` to a set of resident subscribers and the purger
/// thread that reclaims stuck consumer slots.
pub struct Context<const W: usize> {
    ring: Arc<RingBuffer<W, 64>>,
    mode: ContextMode,
    batch_max: usize,
    purge_interval: Duration,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    purger: Option<JoinHandle<()>>,
    /// The one consumer slot shared by every subscriber admitted while
    /// `mode == Partition`; lazily admitted on the first `admit` call.
    partition_slot: Mutex<Option<usize>>,
}

impl<const W: usize> Context<W> {
    pub fn new(depth: usize, mode: ContextMode, purge_interval: Duration) -> Self {
        Self::new_with_ring(Arc::new(RingBuffer::new(depth)), mode, purge_interval)
    }

    /// Build a Context over an already-constructed ring (used by
    /// `Domain::attach_ipc` to bind a shm-resident ring instead of a
    /// freshly heap-allocated one).
    pub fn new_with_ring(ring: Arc<RingBuffer<W, 64>>, mode: ContextMode, purge_interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let purger = if purge_interval.as_secs() > 0 {
            Some(spawn_purger(ring.clone(), purge_interval, stop.clone()))
        } else {
            None
        };
        Self {
            ring,
            mode,
            batch_max: 256,
            purge_interval,
            stop,
            threads: Vec::new(),
            purger,
            partition_slot: Mutex::new(None),
        }
    }

    pub fn ring(&self) -> &Arc<RingBuffer<W, 64>> {
        &self.ring
    }

    pub fn mode(&self) -> ContextMode {
        self.mode
    }

    /// Admit a subscriber and spawn its dedicated thread. Fails (returning
    /// the subscriber back) if all consumer slots are exhausted. In
    /// `Partition` mode, every subscriber admitted to this Context shares
    /// one consumer slot (admitted once, on the first call) instead of
    /// each getting its own — the load-balancing half of §4.5.
    pub fn admit(
        &mut self,
        mut subscriber: Box<dyn Subscriber<W> + 'static>,
    ) -> Result<(), Box<dyn Subscriber<W> + 'static>> {
        let (slot, shared) = match self.mode {
            ContextMode::Broadcast => match self.ring.admit_consumer() {
                Some(slot) => (slot, false),
                None => return Err(subscriber),
            },
            ContextMode::Partition => {
                let mut guard = self.partition_slot.lock().unwrap();
                match *guard {
                    Some(slot) => (slot, true),
                    None => {
                        let Some(slot) = self.ring.admit_consumer() else {
                            return Err(subscriber);
                        };
                        *guard = Some(slot);
                        (slot, true)
                    }
                }
            }
        };
        let ring = self.ring.clone();
        let stop = self.stop.clone();
        let batch_max = self.batch_max;
        let name = subscriber.name().to_owned();
        let handle = std::thread::Builder::new()
            .name(format!("tips-ctx-{name}"))
            .spawn(move || {
                let mut loop_state = ConsumerLoop {
                    ring,
                    slot,
                    batch_max,
                    shared,
                    reassembly: None,
                };
                loop_state.run(subscriber.as_mut(), &stop);
            })
            .expect("failed to spawn consumer thread");
        self.threads.push(handle);
        Ok(())
    }

    /// Publish an envelope to every subscriber of this Context.
    pub fn publish(&self, envelope: Envelope<W>) {
        self.ring.publish(envelope);
    }

    pub fn try_publish(&self, envelope: Envelope<W>) -> crate::error::Result<()> {
        self.ring.try_publish(envelope)
    }

    /// Asynchronously request shutdown: sets a stop flag observed by all
    /// threads at their next loop head.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Block until every owned thread has exited.
    pub fn join(&mut self) {
        for h in self.threads.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = self.purger.take() {
            let _ = h.join();
        }
    }
}

impl<const W: usize> Drop for Context<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_purger<const W: usize>(
    ring: Arc<RingBuffer<W, 64>>,
    purge_interval: Duration,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("tips-purger".to_owned())
        .spawn(move || {
            let mut last_seen: HashMap<usize, u64> = HashMap::new();
            let mut ticks_since_check = 0u32;
            let ticks_per_check = purge_interval.as_secs().max(1) as u32;
            let grace = Duration::from_millis(purge_interval.min(Duration::from_secs(5)).as_millis() as u64);
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_secs(1));
                ticks_since_check += 1;
                if ticks_since_check < ticks_per_check {
                    continue;
                }
                ticks_since_check = 0;
                let mut purged_any = false;
                for slot in 0..ring.consumer_capacity() {
                    if !ring.is_live(slot) {
                        last_seen.remove(&slot);
                        continue;
                    }
                    let admitted_at = ring.admitted_at_millis(slot);
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    if now.saturating_sub(admitted_at) < grace.as_millis() as u64 {
                        continue; // Open Question #2: initial grace period
                    }
                    let progress = ring.progress_of(slot);
                    let prior = last_seen.insert(slot, progress);
                    if prior == Some(progress) && ring.read_seq(slot) < ring.committed_seq() {
                        if ring.purge_consumer(slot) {
                            tracing::warn!(slot, "purging stuck consumer");
                            purged_any = true;
                        }
                    }
                }
                if purged_any {
                    if let Some(flush) = Envelope::<W>::small(TAG_FLUSH, Scratchpad::default(), &[]) {
                        ring.publish(flush);
                    }
                }
            }
        })
        .expect("failed to spawn purger thread")
}
