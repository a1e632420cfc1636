// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Type-tag dispatch: routes an envelope to the interested entry among a
// subscriber's compile-time-declared set of message types. The source
// compiles a bespoke dispatcher per subscriber from a variadic template
// tuple; without variadic generics we build an equivalent table at
// construction time and pick a linear scan or a binary search over it
// depending on its size (§4.3, §9's "Compile-time dispatch" note).

use std::ops::Range;

use crate::envelope::{Envelope, TypeTag};

/// Above this many declared interests, `DispatchTable` switches from a
/// linear scan to a tag-sorted binary search.
pub const BINARY_SEARCH_THRESHOLD: usize = 16;

/// One entry of a subscriber's declared interest set: either a single
/// fixed tag or a contiguous tag range.
#[derive(Debug, Clone)]
pub enum Interest {
    Fixed(TypeTag),
    Range(Range<TypeTag>),
}

impl Interest {
    fn matches(&self, tag: TypeTag) -> bool {
        match self {
            Interest::Fixed(t) => *t == tag,
            Interest::Range(r) => r.contains(&tag),
        }
    }

    fn sort_key(&self) -> TypeTag {
        match self {
            Interest::Fixed(t) => *t,
            Interest::Range(r) => r.start,
        }
    }

    fn is_range(&self) -> bool {
        matches!(self, Interest::Range(_))
    }
}

/// One declared interest paired with the index identifying which typed
/// callback it corresponds to (the subscriber's `onMessage<Tᵢ>`).
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    pub interest: Interest,
    pub index: usize,
}

enum Strategy {
    Linear(Vec<DispatchEntry>),
    /// Fixed-tag entries sorted by tag (searched first), followed by
    /// range entries in declaration order (searched after, per the
    /// "tag-range types are tested last" tie-break rule).
    Sorted {
        fixed: Vec<DispatchEntry>,
        ranges: Vec<DispatchEntry>,
    },
}

/// Outcome of a dispatched callback. Represents the source's use of
/// thrown values ("this subscriber is done") as a sum type instead of
/// control-flow exceptions (§9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    CallbackFailed(String),
    ExplicitExit(i32),
}

/// The result of routing one envelope: which declared interest (if any)
/// matched, and whether it was a fixed-tag/range match or an in-band
/// attachment ref that should accumulate into a reassembly slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Typed { index: usize },
    AttachmentRef { index: usize },
    JustBytes,
    Unmatched,
}

/// A compile-time-shaped (for the source; runtime-built here) dispatcher
/// for one subscriber's declared interest tuple.
pub struct DispatchTable {
    strategy: Strategy,
    admits_just_bytes: bool,
}

impl DispatchTable {
    /// Build a dispatcher for `entries`. Fixed-tag entries take priority
    /// over tag-range entries at equal tag value, per the tie-break rule
    /// in §4.3. Switches to binary search past
    /// [`BINARY_SEARCH_THRESHOLD`] entries.
    pub fn new(entries: Vec<DispatchEntry>, admits_just_bytes: bool) -> Self {
        let strategy = if entries.len() <= BINARY_SEARCH_THRESHOLD {
            Strategy::Linear(entries)
        } else {
            let (mut fixed, mut ranges): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| !e.interest.is_range());
            fixed.sort_by_key(|e| e.interest.sort_key());
            ranges.sort_by_key(|e| e.interest.sort_key());
            Strategy::Sorted { fixed, ranges }
        };
        Self {
            strategy,
            admits_just_bytes,
        }
    }

    /// Decide which declared interest (if any) an envelope's tag matches.
    pub fn route(&self, tag: TypeTag, is_attachment_ref: bool) -> RouteDecision {
        let found = match &self.strategy {
            Strategy::Linear(entries) => entries
                .iter()
                .find(|e| !e.interest.is_range() && e.interest.matches(tag))
                .or_else(|| entries.iter().find(|e| e.interest.is_range() && e.interest.matches(tag))),
            Strategy::Sorted { fixed, ranges } => {
                fixed
                    .binary_search_by_key(&tag, |e| e.interest.sort_key())
                    .ok()
                    .map(|i| &fixed[i])
                    .or_else(|| ranges.iter().find(|e| e.interest.matches(tag)))
            }
        };

        match found {
            Some(e) if is_attachment_ref => RouteDecision::AttachmentRef { index: e.index },
            Some(e) => RouteDecision::Typed { index: e.index },
            None if self.admits_just_bytes => RouteDecision::JustBytes,
            None => RouteDecision::Unmatched,
        }
    }

    /// Route a full envelope in one call.
    pub fn route_envelope<const W: usize>(&self, envelope: &Envelope<W>) -> RouteDecision {
        self.route(envelope.type_tag, envelope.is_attachment_ref())
    }
}
