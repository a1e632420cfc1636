// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-peer TCP unicast sessions (§4.7). Each `Session` pairs a socket with
// the peer's subscription set, an outbound write backlog, and an inbound
// reassembly state machine; `TcpSessionTable` owns the map of live
// sessions keyed by peer address plus the accept loop.
//
// The read/write state machine (length-prefixed header, write-or-enqueue
// on would-block, backlog drained on the next writable tick) follows the
// shape of `other_examples`' gattaca-com-flux `tcp/stream.rs`, reimplemented
// over non-blocking `std::net` with a dedicated thread per session instead
// of an external reactor (`mio`) — this crate has no event-loop dependency
// elsewhere, so one isn't introduced here either.
//
// Wire format per §6: `TransportHeader{flag: u8, payloadLen: u16}` followed
// by a flag-specific payload:
//   - `FLAG_DATA`: a `MessageWrap{typeTag, descFlag, scratchpad, payload}`.
//   - `FLAG_ATTACHMENT_REF`: an `InBandAttachmentRef` wire payload,
//     immediately followed (outside any further framing) by `attachmentLen`
//     raw bytes, per §4.7 "Data stream".
//   - `FLAG_SUBSCRIPTION`: ASCII lines `+<tag>\t` / `-<tag>\t`, terminated
//     by a bare `+\t` for the initial batch (§4.7 "Discovery").
//   - `FLAG_HEARTBEAT`: empty payload, sent every `heartbeatPeriodSeconds`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, ErrorKind, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::envelope::TypeTag;
use crate::net::rate_limit::TokenBucket;

pub const FLAG_DATA: u8 = 0;
pub const FLAG_ATTACHMENT_REF: u8 = 1;
pub const FLAG_SUBSCRIPTION: u8 = 2;
pub const FLAG_HEARTBEAT: u8 = 3;

pub const HEADER_SIZE: usize = 1 + 2;

/// `TransportHeader{ flag, payloadLen }`, little-endian, packed (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub flag: u8,
    pub payload_len: u16,
}

impl TransportHeader {
    pub fn encode(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.flag;
        out[1..3].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: [u8; HEADER_SIZE]) -> Self {
        Self {
            flag: bytes[0],
            payload_len: u16::from_le_bytes([bytes[1], bytes[2]]),
        }
    }
}

/// Build the ASCII subscription command batch for `tags`, each encoded as
/// `+<tag>\t`, terminated by the bare `+\t` sentinel (§4.7 "Discovery").
pub fn encode_subscription_batch(tags: &[TypeTag]) -> Vec<u8> {
    let mut out = Vec::new();
    for tag in tags {
        out.extend_from_slice(format!("+{tag}\t").as_bytes());
    }
    out.extend_from_slice(b"+\t");
    out
}

/// Encode a single incremental subscription change (`+<tag>\t` to add,
/// `-<tag>\t` to remove).
pub fn encode_subscription_delta(tag: TypeTag, add: bool) -> Vec<u8> {
    let sign = if add { '+' } else { '-' };
    format!("{sign}{tag}\t").into_bytes()
}

/// Parse a subscription frame's payload into `(add, tag)` pairs. The bare
/// `+\t` sentinel (empty digit run) is skipped.
pub fn parse_subscription_commands(bytes: &[u8]) -> Vec<(bool, TypeTag)> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for token in text.split('\t') {
        if token.is_empty() {
            continue;
        }
        let (sign, digits) = token.split_at(1);
        if digits.is_empty() {
            continue; // "+\t" sentinel
        }
        let add = match sign {
            "+" => true,
            "-" => false,
            _ => continue,
        };
        if let Ok(tag) = digits.parse::<TypeTag>() {
            out.push((add, tag));
        }
    }
    out
}

/// One fully-assembled inbound unit.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A `MessageWrap` payload: `typeTag(2) | descFlag(1) | scratchpad(8) | payload`.
    Data { tag: TypeTag, wire: Vec<u8> },
    /// A reassembled attachment: the ref's original tag plus the raw bytes
    /// that followed it on the wire.
    Attachment { tag: TypeTag, bytes: Vec<u8> },
    Subscription(Vec<(bool, TypeTag)>),
    Heartbeat,
}

enum RxState {
    Header { buf: [u8; HEADER_SIZE], have: usize },
    Payload { flag: u8, buf: Vec<u8>, have: usize },
    RawAttachment { tag: TypeTag, remaining: usize, buf: Vec<u8> },
}

/// Lifecycle events surfaced to the local bus as `SessionStarted{ip}` /
/// `SessionDropped{ip}` system messages (§4.7 "Heartbeat").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started(SocketAddr),
    Dropped(SocketAddr),
}

/// A TCP connection plus its per-peer subscription state (§3 "Session").
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    /// Tags the peer has told us it wants (we forward matching publishes
    /// to it). Populated from inbound `FLAG_SUBSCRIPTION` frames.
    remote_tags: HashSet<TypeTag>,
    rx: RxState,
    backlog: VecDeque<Vec<u8>>,
    backlog_bytes_at_last_check: usize,
    last_backlog_progress: Instant,
    last_heartbeat_sent: Instant,
    last_heartbeat_received: Instant,
    rate_limiter: Option<Arc<TokenBucket>>,
}

impl Session {
    fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let now = Instant::now();
        Ok(Self {
            stream,
            peer,
            remote_tags: HashSet::new(),
            rx: RxState::Header { buf: [0u8; HEADER_SIZE], have: 0 },
            backlog: VecDeque::new(),
            backlog_bytes_at_last_check: 0,
            last_backlog_progress: now,
            last_heartbeat_sent: now,
            last_heartbeat_received: now,
            rate_limiter: None,
        })
    }

    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?;
        Self::new(stream, peer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_subscribed(&self, tag: TypeTag) -> bool {
        self.remote_tags.contains(&tag)
    }

    pub fn set_rate_limiter(&mut self, bucket: Option<Arc<TokenBucket>>) {
        self.rate_limiter = bucket;
    }

    fn write_or_enqueue(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        if !self.backlog.is_empty() {
            let mut combined = Vec::with_capacity(header.len() + payload.len());
            combined.extend_from_slice(header);
            combined.extend_from_slice(payload);
            self.backlog.push_back(combined);
            return Ok(());
        }
        let res = if payload.is_empty() {
            self.stream.write(header)
        } else {
            self.stream.write_vectored(&[IoSlice::new(header), IoSlice::new(payload)])
        };
        match res {
            Ok(0) if !header.is_empty() || !payload.is_empty() => {
                Err(io::Error::new(ErrorKind::ConnectionAborted, "write returned 0"))
            }
            Ok(n) if n == header.len() + payload.len() => Ok(()),
            Ok(n) => {
                let mut combined = Vec::with_capacity(header.len() + payload.len());
                combined.extend_from_slice(header);
                combined.extend_from_slice(payload);
                self.backlog.push_back(combined[n..].to_vec());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let mut combined = Vec::with_capacity(header.len() + payload.len());
                combined.extend_from_slice(header);
                combined.extend_from_slice(payload);
                self.backlog.push_back(combined);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn send_frame(&mut self, flag: u8, payload: &[u8]) -> io::Result<()> {
        if let Some(bucket) = &self.rate_limiter {
            let total = HEADER_SIZE + payload.len();
            let mut spins = 0u32;
            while !bucket.try_take(total) {
                spins += 1;
                if spins > 1000 {
                    break; // rate limiter effectively disabled past this point
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        let header = TransportHeader { flag, payload_len: payload.len() as u16 }.encode();
        self.write_or_enqueue(&header, payload)
    }

    /// Send a small (single-slot) message.
    pub fn send_data(&mut self, tag: TypeTag, wire: &[u8]) -> io::Result<()> {
        self.send_frame(FLAG_DATA, wire)
    }

    /// Send an attachment: a `FLAG_ATTACHMENT_REF` frame followed
    /// immediately by the raw attachment bytes (§4.7).
    pub fn send_attachment(&mut self, ref_wire: &[u8], bytes: &[u8]) -> io::Result<()> {
        self.send_frame(FLAG_ATTACHMENT_REF, ref_wire)?;
        self.write_or_enqueue(&[], bytes)
    }

    pub fn send_subscription(&mut self, payload: &[u8]) -> io::Result<()> {
        self.send_frame(FLAG_SUBSCRIPTION, payload)
    }

    pub fn send_heartbeat(&mut self) -> io::Result<()> {
        self.last_heartbeat_sent = Instant::now();
        self.send_frame(FLAG_HEARTBEAT, &[])
    }

    fn drain_backlog(&mut self) -> io::Result<()> {
        while let Some(front) = self.backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(io::Error::new(ErrorKind::ConnectionAborted, "write returned 0")),
                Ok(n) if n == front.len() => {
                    self.backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(0..n);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        let bytes_pending: usize = self.backlog.iter().map(|b| b.len()).sum();
        if bytes_pending != self.backlog_bytes_at_last_check {
            self.backlog_bytes_at_last_check = bytes_pending;
            self.last_backlog_progress = Instant::now();
        }
        Ok(())
    }

    /// Whether the outbound backlog has been non-empty and unchanged for
    /// longer than `threshold` — the slow-peer signal (§4.7, §7).
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        !self.backlog.is_empty() && self.last_backlog_progress.elapsed() > threshold
    }

    /// Whether no heartbeat has arrived within `window` (§4.7 "Heartbeat").
    pub fn heartbeat_expired(&self, window: Duration) -> bool {
        self.last_heartbeat_received.elapsed() > window
    }

    pub fn heartbeat_due(&self, period: Duration) -> bool {
        self.last_heartbeat_sent.elapsed() >= period
    }

    /// Read and decode as many complete frames as are currently available
    /// without blocking.
    pub fn poll_read(&mut self) -> io::Result<Vec<Frame>> {
        let mut out = Vec::new();
        loop {
            match self.read_one() {
                Ok(Some(frame)) => {
                    if let Frame::Heartbeat = &frame {
                        self.last_heartbeat_received = Instant::now();
                    }
                    if let Frame::Subscription(deltas) = &frame {
                        for (add, tag) in deltas {
                            if *add {
                                self.remote_tags.insert(*tag);
                            } else {
                                self.remote_tags.remove(tag);
                            }
                        }
                    }
                    out.push(frame);
                }
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn read_one(&mut self) -> io::Result<Option<Frame>> {
        loop {
            match &mut self.rx {
                RxState::Header { buf, have } => {
                    let n = self.stream.read(&mut buf[*have..])?;
                    if n == 0 {
                        return Err(io::Error::new(ErrorKind::ConnectionAborted, "peer closed"));
                    }
                    *have += n;
                    if *have < HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = TransportHeader::decode(*buf);
                    self.rx = RxState::Payload {
                        flag: header.flag,
                        buf: vec![0u8; header.payload_len as usize],
                        have: 0,
                    };
                }
                RxState::Payload { flag, buf, have } => {
                    if buf.is_empty() {
                        let flag = *flag;
                        self.rx = RxState::Header { buf: [0u8; HEADER_SIZE], have: 0 };
                        return Ok(Some(finish_payload(flag, Vec::new())));
                    }
                    let n = self.stream.read(&mut buf[*have..])?;
                    if n == 0 {
                        return Err(io::Error::new(ErrorKind::ConnectionAborted, "peer closed"));
                    }
                    *have += n;
                    if *have < buf.len() {
                        return Ok(None);
                    }
                    let flag = *flag;
                    let payload = std::mem::take(buf);
                    if flag == FLAG_ATTACHMENT_REF && payload.len() >= 6 {
                        let tag = TypeTag::from_le_bytes([payload[0], payload[1]]);
                        let len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
                        self.rx = RxState::RawAttachment { tag, remaining: len, buf: Vec::with_capacity(len) };
                        continue;
                    }
                    self.rx = RxState::Header { buf: [0u8; HEADER_SIZE], have: 0 };
                    return Ok(Some(finish_payload(flag, payload)));
                }
                RxState::RawAttachment { tag, remaining, buf } => {
                    if *remaining == 0 {
                        let tag = *tag;
                        let bytes = std::mem::take(buf);
                        self.rx = RxState::Header { buf: [0u8; HEADER_SIZE], have: 0 };
                        return Ok(Some(Frame::Attachment { tag, bytes }));
                    }
                    let mut chunk = vec![0u8; *remaining];
                    let n = self.stream.read(&mut chunk)?;
                    if n == 0 {
                        return Err(io::Error::new(ErrorKind::ConnectionAborted, "peer closed"));
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    *remaining -= n;
                }
            }
        }
    }
}

fn finish_payload(flag: u8, payload: Vec<u8>) -> Frame {
    match flag {
        FLAG_SUBSCRIPTION => Frame::Subscription(parse_subscription_commands(&payload)),
        FLAG_HEARTBEAT => Frame::Heartbeat,
        _ => {
            let tag = if payload.len() >= 2 {
                TypeTag::from_le_bytes([payload[0], payload[1]])
            } else {
                0
            };
            Frame::Data { tag, wire: payload }
        }
    }
}

/// Owns every live per-peer session on this Domain and the accept loop
/// that creates new ones.
pub struct TcpSessionTable {
    sessions: Arc<Mutex<HashMap<SocketAddr, Arc<Mutex<Session>>>>>,
    stop: Arc<AtomicBool>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TcpSessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start accepting inbound connections on `bind_addr`. Every accepted
    /// session gets its own I/O thread and immediately receives its
    /// initial subscription batch from the caller-supplied `local_tags`.
    pub fn listen<F, G, H>(
        &self,
        bind_addr: SocketAddr,
        local_tags: F,
        on_frame: Arc<G>,
        on_event: Arc<H>,
    ) -> io::Result<JoinHandle<()>>
    where
        F: Fn() -> Vec<TypeTag> + Send + 'static,
        G: Fn(SocketAddr, Frame) + Send + Sync + 'static,
        H: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;
        let stop = self.stop.clone();
        let sessions = self.sessions.clone();
        let threads = self.threads.clone();
        Ok(std::thread::Builder::new()
            .name("tips-tcp-accept".to_owned())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match listener.accept() {
                        Ok((stream, peer)) => match Session::new(stream, peer) {
                            Ok(mut session) => {
                                let batch = encode_subscription_batch(&local_tags());
                                let _ = session.send_subscription(&batch);
                                let session = Arc::new(Mutex::new(session));
                                sessions.lock().unwrap().insert(peer, session.clone());
                                on_event(SessionEvent::Started(peer));
                                let h = spawn_session_io(
                                    session,
                                    peer,
                                    stop.clone(),
                                    on_frame.clone(),
                                    on_event.clone(),
                                    sessions.clone(),
                                );
                                threads.lock().unwrap().push(h);
                            }
                            Err(e) => tracing::warn!(error = %e, "failed to prepare accepted session"),
                        },
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept error");
                            std::thread::sleep(Duration::from_millis(50));
                        }
                    }
                }
            })
            .expect("failed to spawn tcp accept thread"))
    }

    /// Actively connect to a discovered peer (§4.7 "Discovery").
    pub fn connect<G, H>(
        &self,
        addr: SocketAddr,
        local_tags: &[TypeTag],
        on_frame: Arc<G>,
        on_event: Arc<H>,
    ) -> io::Result<()>
    where
        G: Fn(SocketAddr, Frame) + Send + Sync + 'static,
        H: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let mut session = Session::connect(addr)?;
        let peer = session.peer();
        let batch = encode_subscription_batch(local_tags);
        session.send_subscription(&batch)?;
        let session = Arc::new(Mutex::new(session));
        self.sessions.lock().unwrap().insert(peer, session.clone());
        on_event(SessionEvent::Started(peer));
        let h = spawn_session_io(session, peer, self.stop.clone(), on_frame, on_event, self.sessions.clone());
        self.threads.lock().unwrap().push(h);
        Ok(())
    }

    /// Forward a pre-encoded envelope `wire` (§6 `MessageWrap`) to every
    /// session whose remote peer subscribed to `tag` (§4.6 Pump "Network"
    /// branch).
    pub fn forward_if_subscribed(&self, tag: TypeTag, wire: &[u8]) {
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            let mut s = session.lock().unwrap();
            if s.is_subscribed(tag) {
                if let Err(e) = s.send_data(tag, wire) {
                    tracing::warn!(peer = %s.peer(), error = %e, "send failed");
                }
            }
        }
    }

    /// Push an incremental subscription change to every live session
    /// (§4.6 "additionally maintains remote counts keyed by peer").
    pub fn broadcast_subscription_change(&self, tag: TypeTag, add: bool) {
        let sessions = self.sessions.lock().unwrap();
        let payload = encode_subscription_delta(tag, add);
        for session in sessions.values() {
            let _ = session.lock().unwrap().send_subscription(&payload);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(&self) {
        for h in self.threads.lock().unwrap().drain(..) {
            let _ = h.join();
        }
    }
}

impl Default for TcpSessionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_session_io<G, H>(
    session: Arc<Mutex<Session>>,
    peer: SocketAddr,
    stop: Arc<AtomicBool>,
    on_frame: Arc<G>,
    on_event: Arc<H>,
    sessions: Arc<Mutex<HashMap<SocketAddr, Arc<Mutex<Session>>>>>,
) -> JoinHandle<()>
where
    G: Fn(SocketAddr, Frame) + Send + Sync + 'static,
    H: Fn(SessionEvent) + Send + Sync + 'static,
{
    std::thread::Builder::new()
        .name(format!("tips-tcp-{peer}"))
        .spawn(move || {
            let heartbeat_period = Duration::from_secs(5);
            let heartbeat_window = Duration::from_secs(15);
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let outcome = {
                    let mut s = session.lock().unwrap();
                    let read_result = s.poll_read();
                    let drain_result = s.drain_backlog();
                    if s.heartbeat_due(heartbeat_period) {
                        let _ = s.send_heartbeat();
                    }
                    let expired = s.heartbeat_expired(heartbeat_window);
                    (read_result, drain_result, expired)
                };
                match outcome {
                    (Ok(frames), Ok(()), false) => {
                        for frame in frames {
                            on_frame(peer, frame);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    (Err(e), _, _) | (_, Err(e), _) => {
                        tracing::info!(peer = %peer, error = %e, "session dropped");
                        break;
                    }
                    (Ok(_), Ok(()), true) => {
                        tracing::info!(peer = %peer, "session dropped: heartbeat expired");
                        break;
                    }
                }
            }
            sessions.lock().unwrap().remove(&peer);
            on_event(SessionEvent::Dropped(peer));
        })
        .expect("failed to spawn tcp session io thread")
}
