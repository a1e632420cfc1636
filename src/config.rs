// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Typed configuration for a Domain, plus a loader from the assumed
// external key->value configuration bag (recognized keys table, §6).

use std::collections::HashMap;
use std::time::Duration;

/// One of the three ownership policies for a shared-memory-backed
/// transport segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcOwnership {
    /// This process must create the segment; fails if it already exists.
    Own,
    /// This process must attach to an existing segment; fails if absent.
    Attach,
    /// Create-or-attach with randomized backoff (resolves the "optional"
    /// ownership race left open by the source; see DESIGN.md).
    Optional,
}

/// Run mode for the Domain's pump threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpRunMode {
    /// Pump threads start immediately on `Domain::new`.
    Auto,
    /// Caller starts pump threads explicitly via `Domain::start_pumps`.
    Manual,
    /// Like `Auto`, but the first pump tick is delayed (used to let Nodes
    /// finish subscribing before any network traffic is forwarded).
    Delayed,
}

/// Typed configuration, one field per recognized key in the configuration
/// table. Defaults follow the source's defaults where specified, and
/// conservative values elsewhere.
#[derive(Debug, Clone)]
pub struct TipsConfig {
    pub iface_addr: String,
    pub ipc_message_queue_size_power2_num: u32,
    pub ipc_max_message_size_runtime: usize,
    pub ipc_transport_ownership: IpcOwnership,
    pub ipc_purge_interval_seconds: u32,
    pub ipc_shm_for_att_pool_size: usize,
    pub net_max_message_size_runtime: usize,
    pub pump_count: usize,
    pub pump_cpu_affinity_hex: Option<u64>,
    pub pump_max_blocking_time: Duration,
    pub pump_run_mode: PumpRunMode,
    pub tcp_port: u16,
    pub udpcast_dests: Vec<String>,
    pub send_bytes_per_sec: u64,
    pub send_bytes_burst: u64,
    pub wait_for_slow_receivers: bool,
    pub heartbeat_period_seconds: u32,
    pub type_tag_advertise_period_seconds: u32,
}

impl Default for TipsConfig {
    fn default() -> Self {
        Self {
            iface_addr: "0.0.0.0".to_owned(),
            ipc_message_queue_size_power2_num: 12, // 4096 slots
            ipc_max_message_size_runtime: 256,
            ipc_transport_ownership: IpcOwnership::Optional,
            ipc_purge_interval_seconds: 5,
            ipc_shm_for_att_pool_size: 0,
            net_max_message_size_runtime: 1500,
            pump_count: 1,
            pump_cpu_affinity_hex: None,
            pump_max_blocking_time: Duration::from_millis(100),
            pump_run_mode: PumpRunMode::Auto,
            tcp_port: 0,
            udpcast_dests: Vec::new(),
            send_bytes_per_sec: 0,
            send_bytes_burst: 0,
            wait_for_slow_receivers: false,
            heartbeat_period_seconds: 5,
            type_tag_advertise_period_seconds: 2,
        }
    }
}

impl TipsConfig {
    /// Build a config from a key->value bag, applying defaults for any
    /// key left unset. Unknown keys are ignored; malformed values for a
    /// recognized key fall back to the default for that key.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut cfg = Self::default();
        let get = |k: &str| map.get(k).map(|s| s.as_str());

        if let Some(v) = get("ifaceAddr") {
            cfg.iface_addr = v.to_owned();
        }
        if let Some(v) = get("ipcMessageQueueSizePower2Num").and_then(|s| s.parse().ok()) {
            cfg.ipc_message_queue_size_power2_num = v;
        }
        if let Some(v) = get("ipcMaxMessageSizeRuntime").and_then(|s| s.parse().ok()) {
            cfg.ipc_max_message_size_runtime = v;
        }
        if let Some(v) = get("ipcTransportOwnership") {
            cfg.ipc_transport_ownership = match v {
                "own" => IpcOwnership::Own,
                "attach" => IpcOwnership::Attach,
                _ => IpcOwnership::Optional,
            };
        }
        if let Some(v) = get("ipcPurgeIntervalSeconds").and_then(|s| s.parse().ok()) {
            cfg.ipc_purge_interval_seconds = v;
        }
        if let Some(v) = get("ipcShmForAttPoolSize").and_then(|s| s.parse().ok()) {
            cfg.ipc_shm_for_att_pool_size = v;
        }
        if let Some(v) = get("netMaxMessageSizeRuntime").and_then(|s| s.parse().ok()) {
            cfg.net_max_message_size_runtime = v;
        }
        if let Some(v) = get("pumpCount").and_then(|s| s.parse().ok()) {
            cfg.pump_count = std::cmp::min(v, 64);
        }
        if let Some(v) = get("pumpCpuAffinityHex") {
            cfg.pump_cpu_affinity_hex = u64::from_str_radix(v.trim_start_matches("0x"), 16).ok();
        }
        if let Some(v) = get("pumpMaxBlockingTimeSec").and_then(|s| s.parse::<f64>().ok()) {
            cfg.pump_max_blocking_time = Duration::from_secs_f64(v);
        }
        if let Some(v) = get("pumpRunMode") {
            cfg.pump_run_mode = match v {
                "manual" => PumpRunMode::Manual,
                "delayed" => PumpRunMode::Delayed,
                _ => PumpRunMode::Auto,
            };
        }
        if let Some(v) = get("tcpPort").and_then(|s| s.parse().ok()) {
            cfg.tcp_port = v;
        }
        if let Some(v) = get("udpcastDests") {
            cfg.udpcast_dests = v.split(',').map(|s| s.trim().to_owned()).collect();
        }
        if let Some(v) = get("sendBytesPerSec").and_then(|s| s.parse().ok()) {
            cfg.send_bytes_per_sec = v;
        }
        if let Some(v) = get("sendBytesBurst").and_then(|s| s.parse().ok()) {
            cfg.send_bytes_burst = v;
        }
        if let Some(v) = get("waitForSlowReceivers").and_then(|s| s.parse().ok()) {
            cfg.wait_for_slow_receivers = v;
        }
        if let Some(v) = get("heartbeatPeriodSeconds").and_then(|s| s.parse().ok()) {
            cfg.heartbeat_period_seconds = v;
        }
        if let Some(v) = get("typeTagAdvertisePeriodSeconds").and_then(|s| s.parse().ok()) {
            cfg.type_tag_advertise_period_seconds = v;
        }
        cfg
    }

    pub fn ring_depth(&self) -> usize {
        1usize << self.ipc_message_queue_size_power2_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TipsConfig::default();
        assert_eq!(cfg.ring_depth(), 4096);
        assert!(!cfg.wait_for_slow_receivers);
    }

    #[test]
    fn from_map_overrides_recognized_keys() {
        let mut m = HashMap::new();
        m.insert("tcpPort".to_owned(), "9000".to_owned());
        m.insert("pumpCount".to_owned(), "4".to_owned());
        m.insert("ipcTransportOwnership".to_owned(), "own".to_owned());
        m.insert("udpcastDests".to_owned(), "239.1.1.1:9001, 239.1.1.1:9002".to_owned());
        let cfg = TipsConfig::from_map(&m);
        assert_eq!(cfg.tcp_port, 9000);
        assert_eq!(cfg.pump_count, 4);
        assert_eq!(cfg.ipc_transport_ownership, IpcOwnership::Own);
        assert_eq!(cfg.udpcast_dests, vec!["239.1.1.1:9001", "239.1.1.1:9002"]);
    }

    #[test]
    fn pump_count_is_capped_at_64() {
        let mut m = HashMap::new();
        m.insert("pumpCount".to_owned(), "1000".to_owned());
        let cfg = TipsConfig::from_map(&m);
        assert_eq!(cfg.pump_count, 64);
    }
}
