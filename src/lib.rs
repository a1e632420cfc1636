// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// TIPS: a type-inferred publish/subscribe message-transport engine.
// A lock-free MPMC ring buffer carries envelopes between producers and
// per-consumer dispatch threads; a Domain composes a local Context with
// an optional IPC Context and a network plane for inter-process and
// inter-host delivery. Grew out of a pure Rust port of cpp-ipc's shared
// memory and named mutex primitives, which remain available as the
// lower-level building blocks (`shm`, `mutex`, `channel`, `circ`, ...).

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod scoped_access;
pub use scoped_access::ScopedAccess;

mod condition;
pub use condition::IpcCondition;

mod semaphore;
pub use semaphore::IpcSemaphore;

mod spin_lock;
pub use spin_lock::SpinLock;

mod rw_lock;
pub use rw_lock::RwLock;

mod waiter;
pub use waiter::Waiter;

pub mod buffer;
pub use buffer::IpcBuffer;

pub mod chunk_storage;

pub mod circ;
pub use circ::{BroadcastConnHead, ConnId, UnicastConnHead};

pub mod channel;
pub use channel::{Channel, Mode, Route};

pub mod proto;

pub mod error;
pub use error::{Result, TipsError};

pub mod envelope;
pub use envelope::{Envelope, InBandAttachmentRef, Scratchpad, TypeTag};

pub mod attachment;
pub use attachment::{Attachment, AttachmentAllocator};

pub mod ring;
pub use ring::{Claim, RingBuffer};

pub mod subscription;
pub use subscription::SubscriptionTable;

pub mod dispatch;
pub use dispatch::{DispatchOutcome, DispatchTable, Interest, RouteDecision, StopReason};

pub mod context;
pub use context::{Context, ContextMode, Subscriber};

pub mod config;
pub use config::{IpcOwnership, PumpRunMode, TipsConfig};

pub mod domain;
pub use domain::{Domain, SendMask};

pub mod net;
