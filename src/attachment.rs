// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Attachment handle and allocator. Two ownership paths per §9's Design
// Notes: `Inline` (heap `Vec<u8>`, freed on last release) and `Pooled`
// (shared-memory block from `chunk_storage`, refcounted, released back to
// the free-list on last release). Port/generalization of `chunk_storage.rs`'s
// `acquire_storage`/`recycle_storage` plus the inline path `buffer.rs`
// already provides for the teacher's own large-message framing.

use std::sync::Arc;

use crate::chunk_storage::{self, StorageId};
use crate::ShmHandle;

/// Backing storage for one Attachment.
enum Body {
    /// Heap-allocated bytes, not shared with any other process.
    Inline(Vec<u8>),
    /// A block inside a `chunk_storage` shm pool, identified by
    /// `storage_id`. Released back to the pool's free-list when the last
    /// holder drops its handle.
    Pooled {
        shm: Arc<ShmHandle>,
        chunk_size: usize,
        storage_id: StorageId,
        conn_id: u32,
        len: usize,
        ptr: *mut u8,
    },
}

// Pooled bodies reference shared memory explicitly managed with atomics;
// the raw pointer is only ever dereferenced for the block's own payload
// region, which outlives every handle that can observe it.
unsafe impl Send for Body {}
unsafe impl Sync for Body {}

/// A variable-sized opaque byte block accompanying a typed message.
/// Ownership transfers on enqueue to the Pump and on dispatch to a
/// callback; the backing storage is released exactly once, when the last
/// holder drops its `Attachment`.
pub struct Attachment {
    body: Body,
}

impl Attachment {
    /// Wrap owned bytes with no cross-process sharing.
    pub fn inline(bytes: Vec<u8>) -> Self {
        Self {
            body: Body::Inline(bytes),
        }
    }

    /// Construct a handle over an already-acquired pooled block (used by
    /// the allocator below and by receivers resolving an
    /// `InBandAttachmentRef { shmHandle, ... }`).
    fn pooled(
        shm: Arc<ShmHandle>,
        chunk_size: usize,
        storage_id: StorageId,
        conn_id: u32,
        len: usize,
        ptr: *mut u8,
    ) -> Self {
        Self {
            body: Body::Pooled {
                shm,
                chunk_size,
                storage_id,
                conn_id,
                len,
                ptr,
            },
        }
    }

    pub fn len(&self) -> usize {
        match &self.body {
            Body::Inline(v) => v.len(),
            Body::Pooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-copy byte view of the attachment.
    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            Body::Inline(v) => v,
            Body::Pooled { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.body, Body::Pooled { .. })
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Body::Pooled {
            shm,
            chunk_size,
            storage_id,
            conn_id,
            ..
        } = &self.body
        {
            chunk_storage::recycle_storage(shm, *chunk_size, *storage_id, *conn_id);
        }
    }
}

/// Resolves destination storage for attachments, per §4.2's reassembly
/// algorithm step 1 ("allocating or resolving the destination buffer").
pub struct AttachmentAllocator {
    pool_shm: Option<Arc<ShmHandle>>,
    prefix: String,
}

impl AttachmentAllocator {
    /// An allocator with no zero-copy pool: every attachment is reassembled
    /// into a heap buffer (`Inline`).
    pub fn inline_only() -> Self {
        Self {
            pool_shm: None,
            prefix: String::new(),
        }
    }

    /// An allocator backed by a zero-copy shm pool keyed by `prefix`
    /// (`ipcShmForAttPoolSize` must be nonzero for this path to be used —
    /// see `TipsConfig`).
    pub fn with_pool(prefix: impl Into<String>) -> Self {
        Self {
            pool_shm: None,
            prefix: prefix.into(),
        }
    }

    /// Allocate a fresh attachment buffer of `len` bytes, owned by `conns`
    /// known-interested local receivers (see §9: "incremented on the
    /// sender side by the number of local subscribers known at publish
    /// time"). Falls back to `Inline` when no pool is configured or the
    /// pool is exhausted.
    pub fn allocate(&mut self, len: usize, conns: u32) -> std::io::Result<Attachment> {
        let Some(prefix) = (!self.prefix.is_empty()).then_some(&self.prefix) else {
            return Ok(Attachment::inline(vec![0u8; len]));
        };
        let chunk_size = chunk_storage::calc_chunk_size(len);
        let shm = match &self.pool_shm {
            Some(shm) => shm.clone(),
            None => {
                let shm = Arc::new(chunk_storage::open_chunk_shm(prefix, chunk_size)?);
                self.pool_shm = Some(shm.clone());
                shm
            }
        };
        match chunk_storage::acquire_storage(&shm, chunk_size, conns) {
            Some((id, ptr)) => Ok(Attachment::pooled(shm, chunk_size, id, conns, len, ptr)),
            None => Ok(Attachment::inline(vec![0u8; len])),
        }
    }
}
