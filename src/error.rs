// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the transport engine. One variant per row of the
// error-handling design: capacity exceeded, attachment too large, peer
// disconnect, slow peer, consumer stuck, shm init conflict, callback
// failure.

use std::io;

/// Top-level error type for the transport engine.
#[derive(Debug, thiserror::Error)]
pub enum TipsError {
    #[error("ring buffer cannot admit {requested} slot(s): capacity exceeded")]
    CapacityExceeded { requested: usize },

    #[error("attachment of {len} bytes exceeds the configured maximum")]
    AttachmentTooLarge { len: usize },

    #[error("peer {peer} disconnected")]
    PeerDisconnected { peer: String },

    #[error("session to {peer} dropped: slow receiver")]
    SlowPeer { peer: String },

    #[error("consumer slot {slot} purged: stuck for longer than the purge interval")]
    ConsumerStuck { slot: usize },

    #[error("shared memory segment '{name}' init conflict: {reason}")]
    ShmInitConflict { name: String, reason: String },

    #[error("callback failed for subscriber '{subscriber}': {reason}")]
    CallbackFailure { subscriber: String, reason: String },

    #[error("no consumer slots available (capacity {capacity} exhausted)")]
    NoConsumerSlots { capacity: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TipsError {
    /// Whether the caller can reasonably retry/back off and continue.
    ///
    /// Mirrors `StreamError::is_recoverable` from the ringmpsc example:
    /// a handful of conditions are expected steady-state traffic, the rest
    /// indicate the caller must tear something down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TipsError::CapacityExceeded { .. } | TipsError::SlowPeer { .. }
        )
    }

    /// Whether this error means the affected resource (session, consumer,
    /// shm segment) cannot continue and must be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TipsError::PeerDisconnected { .. }
                | TipsError::ConsumerStuck { .. }
                | TipsError::ShmInitConflict { .. }
                | TipsError::CallbackFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TipsError>;
