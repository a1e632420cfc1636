// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Message envelope: the uniform slot-sized record carried by a RingBuffer.
// Layout follows §3 of the transport spec: typeTag(2B) + desc.flag(1B) +
// scratchpad.ipc(8B) + payload(W-11B). Port of the shape implied by
// `channel.rs`'s `RingSlot` (data/size/cc_id/rc), generalized with an
// explicit header instead of an implicit one.

use std::convert::TryInto;

/// 16-bit type tag. Tags `0..=255` are reserved for control messages.
pub type TypeTag = u16;

pub const LAST_SYSTEM_TAG: TypeTag = 255;

pub const TAG_TYPE_TAG_SOURCE: TypeTag = 250;
pub const TAG_UDPCAST_LISTENED_AT: TypeTag = 251;
pub const TAG_FLUSH: TypeTag = 253;
pub const TAG_SESSION_STARTED: TypeTag = 254;
pub const TAG_SESSION_DROPPED: TypeTag = 255;

/// Fixed-size header preceding the payload in every slot.
pub const HEADER_SIZE: usize = 2 + 1 + 8;

/// Bit 0 of `desc.flag`: payload begins with an `InBandAttachmentRef`.
pub const DESC_FLAG_ATTACHMENT: u8 = 1 << 0;

/// Scratchpad carried alongside every envelope: sender pid (for IPC
/// loop-avoidance) and, for in-band attachment segments, the original tag
/// and segment length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Scratchpad {
    pub sender_pid: u32,
    pub inband_underlying_tag: TypeTag,
    pub inband_payload_len: u16,
}

impl Scratchpad {
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.sender_pid.to_le_bytes());
        out[4..6].copy_from_slice(&self.inband_underlying_tag.to_le_bytes());
        out[6..8].copy_from_slice(&self.inband_payload_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            sender_pid: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            inband_underlying_tag: TypeTag::from_le_bytes(bytes[4..6].try_into().unwrap()),
            inband_payload_len: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
        }
    }
}

/// First-slot payload of a multi-slot (large message / attachment) send.
/// §4.2: "the first slot holds an InBandAttachmentRef{originalTag,
/// attachmentLen}".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InBandAttachmentRef {
    pub original_tag: TypeTag,
    pub attachment_len: u32,
}

impl InBandAttachmentRef {
    pub const WIRE_SIZE: usize = 2 + 4;

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..2].copy_from_slice(&self.original_tag.to_le_bytes());
        out[2..6].copy_from_slice(&self.attachment_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            original_tag: TypeTag::from_le_bytes(bytes[0..2].try_into().unwrap()),
            attachment_len: u32::from_le_bytes(bytes[2..6].try_into().unwrap()),
        }
    }
}

/// A slot-sized message envelope. `W` is the slot width in bytes (fixed at
/// construction of the owning `RingBuffer`); payload occupies up to
/// `W - HEADER_SIZE` bytes.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct Envelope<const W: usize> {
    pub type_tag: TypeTag,
    pub desc_flag: u8,
    pub scratchpad: Scratchpad,
    payload: [u8; W],
    payload_len: usize,
}

impl<const W: usize> Default for Envelope<W> {
    /// An empty, tag-0 envelope — the "never written" state a ring slot
    /// starts in, both heap- and shm-resident (the latter gets this
    /// layout for free from zeroed pages, but the constructor keeps the
    /// same value for the heap path so the two storages are equivalent).
    fn default() -> Self {
        Self {
            type_tag: 0,
            desc_flag: 0,
            scratchpad: Scratchpad::default(),
            payload: [0u8; W],
            payload_len: 0,
        }
    }
}

impl<const W: usize> Envelope<W> {
    pub const PAYLOAD_CAPACITY: usize = W - HEADER_SIZE;

    /// Build an envelope whose payload fits in a single slot. Returns
    /// `None` if `payload` is larger than this slot width can carry.
    pub fn small(type_tag: TypeTag, scratchpad: Scratchpad, payload: &[u8]) -> Option<Self> {
        if payload.len() > Self::PAYLOAD_CAPACITY {
            return None;
        }
        let mut buf = [0u8; W];
        buf[..payload.len()].copy_from_slice(payload);
        Some(Self {
            type_tag,
            desc_flag: 0,
            scratchpad,
            payload: buf,
            payload_len: payload.len(),
        })
    }

    /// Build the ref-slot envelope that begins a fragmented/attachment
    /// message (§4.2).
    pub fn attachment_ref(
        type_tag: TypeTag,
        mut scratchpad: Scratchpad,
        reference: InBandAttachmentRef,
    ) -> Self {
        let bytes = reference.to_bytes();
        let mut buf = [0u8; W];
        buf[..bytes.len()].copy_from_slice(&bytes);
        scratchpad.inband_underlying_tag = reference.original_tag;
        Self {
            type_tag,
            desc_flag: DESC_FLAG_ATTACHMENT,
            scratchpad,
            payload: buf,
            payload_len: bytes.len(),
        }
    }

    /// Build a segment envelope carrying a contiguous slice of attachment
    /// bytes (one of the `ceil(attachmentLen / segSize)` follow-up slots).
    pub fn segment(type_tag: TypeTag, mut scratchpad: Scratchpad, segment: &[u8]) -> Option<Self> {
        if segment.len() > Self::PAYLOAD_CAPACITY {
            return None;
        }
        scratchpad.inband_payload_len = segment.len() as u16;
        let mut buf = [0u8; W];
        buf[..segment.len()].copy_from_slice(segment);
        Some(Self {
            type_tag,
            desc_flag: 0,
            scratchpad,
            payload: buf,
            payload_len: segment.len(),
        })
    }

    pub fn is_attachment_ref(&self) -> bool {
        self.desc_flag & DESC_FLAG_ATTACHMENT != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn attachment_ref_payload(&self) -> InBandAttachmentRef {
        InBandAttachmentRef::from_bytes(self.payload())
    }

    /// Maximum segment length that can be carried per follow-up slot,
    /// used to compute `ceil(attachmentLen / segSize)`.
    pub const fn segment_size() -> usize {
        Self::PAYLOAD_CAPACITY
    }

    /// Encode as the wire `MessageWrap{typeTag(2B), descFlag(1B),
    /// scratchpad(8B), payload}` (§6) carried over a TCP session or
    /// republished into a sibling process's IPC ring.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload_len);
        out.extend_from_slice(&self.type_tag.to_le_bytes());
        out.push(self.desc_flag);
        out.extend_from_slice(&self.scratchpad.to_bytes());
        out.extend_from_slice(self.payload());
        out
    }

    /// Inverse of [`Self::to_wire`]. Returns `None` if `bytes` is shorter
    /// than the fixed header or the payload would overflow this slot's
    /// width.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let type_tag = TypeTag::from_le_bytes(bytes[0..2].try_into().ok()?);
        let desc_flag = bytes[2];
        let scratchpad = Scratchpad::from_bytes(bytes[3..HEADER_SIZE].try_into().ok()?);
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() > Self::PAYLOAD_CAPACITY {
            return None;
        }
        let mut buf = [0u8; W];
        buf[..payload.len()].copy_from_slice(payload);
        Some(Self {
            type_tag,
            desc_flag,
            scratchpad,
            payload: buf,
            payload_len: payload.len(),
        })
    }
}
