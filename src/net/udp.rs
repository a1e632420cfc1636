// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// UDP multicast advertisement and discovery (§4.7). A sender periodically
// emits `TypeTagSource{ip, tcpPort, pid, loopback, tagList}`, capped at 64
// tags per datagram (split across multiple datagrams if needed); a
// receiver whose subscriptions intersect a peer's tagList opens a TCP
// session to it.
//
// Wire format is little-endian (§6): a small fixed header followed by a
// `u16` tag list. Reuses no teacher code directly (the teacher has no
// network layer); grounded on `original_source/hmbdc/tips/tcpcast/*.hpp`
// for the constants (64-tags-per-datagram cap, re-advertise-on-every-tick
// behavior — see SPEC_FULL.md §4.7.1).

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::envelope::TypeTag;

pub const MAX_TAGS_PER_DATAGRAM: usize = 64;

/// One advertisement datagram's payload, deserialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeTagSource {
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    pub pid: u32,
    pub loopback: bool,
    pub tags: Vec<TypeTag>,
}

impl TypeTagSource {
    fn encode_into(&self, chunk: &[TypeTag], out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.tcp_port.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.push(self.loopback as u8);
        out.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
        for tag in chunk {
            out.extend_from_slice(&tag.to_le_bytes());
        }
    }

    /// Encode as one or more datagrams, each carrying at most
    /// [`MAX_TAGS_PER_DATAGRAM`] tags.
    pub fn encode_datagrams(&self) -> Vec<Vec<u8>> {
        if self.tags.is_empty() {
            let mut buf = Vec::new();
            self.encode_into(&[], &mut buf);
            return vec![buf];
        }
        self.tags
            .chunks(MAX_TAGS_PER_DATAGRAM)
            .map(|chunk| {
                let mut buf = Vec::with_capacity(11 + chunk.len() * 2);
                self.encode_into(chunk, &mut buf);
                buf
            })
            .collect()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 11 {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let tcp_port = u16::from_le_bytes([bytes[4], bytes[5]]);
        let pid = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let loopback = bytes[10] != 0;
        if bytes.len() < 13 {
            return None;
        }
        let tag_count = u16::from_le_bytes([bytes[11], bytes[12]]) as usize;
        let mut tags = Vec::with_capacity(tag_count);
        let mut pos = 13;
        for _ in 0..tag_count {
            if pos + 2 > bytes.len() {
                break;
            }
            tags.push(u16::from_le_bytes([bytes[pos], bytes[pos + 1]]));
            pos += 2;
        }
        Some(Self { ip, tcp_port, pid, loopback, tags })
    }
}

/// Periodically broadcasts this process's outbound tag list to a
/// multicast group. One [`TypeTagSource`] is re-sent in full on every
/// tick (see SPEC_FULL.md §4.7.1) rather than only on change, bounding
/// discovery latency after a receiver restarts.
pub struct UdpAdvertiser {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpAdvertiser {
    pub fn start(
        group: SocketAddr,
        local_bind: IpAddr,
        advertisement: impl Fn() -> TypeTagSource + Send + 'static,
        period: Duration,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((local_bind, 0))?;
        socket.set_broadcast(true).ok();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("tips-udp-advertiser".to_owned())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    let src = advertisement();
                    for datagram in src.encode_datagrams() {
                        if let Err(e) = socket.send_to(&datagram, group) {
                            tracing::warn!(error = %e, "failed to send advertisement datagram");
                        }
                    }
                    std::thread::sleep(period);
                }
            })
            .expect("failed to spawn udp advertiser thread");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for UdpAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listens on a multicast group for [`TypeTagSource`] advertisements,
/// invoking `on_discover` for each one whose `tagList` intersects
/// `local_tags()` and whose `(pid, ip)` is not self (unless `loopback`).
pub struct UdpListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpListener {
    pub fn start(
        bind_addr: SocketAddr,
        self_pid: u32,
        local_tags: impl Fn() -> Vec<TypeTag> + Send + 'static,
        on_discover: impl Fn(TypeTagSource) + Send + 'static,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("tips-udp-listener".to_owned())
            .spawn(move || {
                let mut buf = [0u8; 2048];
                while !thread_stop.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, _from)) => {
                            if let Some(src) = TypeTagSource::decode(&buf[..n]) {
                                let mine = local_tags();
                                let is_self = src.pid == self_pid && !src.loopback;
                                let intersects = src.tags.iter().any(|t| mine.contains(t));
                                if intersects && !is_self {
                                    on_discover(src);
                                }
                            }
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "udp listener recv error");
                        }
                    }
                }
            })
            .expect("failed to spawn udp listener thread");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.stop();
    }
}
