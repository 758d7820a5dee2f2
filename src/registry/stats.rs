//! The Stats record shared by all three registry levels, plus traffic
//! direction determination.

use serde::Serialize;

use crate::capture::decode::PacketMetadata;
use crate::net::LocalAddrs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    /// Neither or both sides are local; the packet counts into totals but
    /// not into the directional byte counters.
    Unknown,
}

/// Outbound if the source is local and the destination is not; inbound for
/// the reverse; unknown otherwise.
pub fn direction_of(packet: &PacketMetadata, local: &LocalAddrs) -> Direction {
    let src_local = packet.src_ip.as_deref().is_some_and(|a| local.contains(a));
    let dst_local = packet.dst_ip.as_deref().is_some_and(|a| local.contains(a));

    match (src_local, dst_local) {
        (true, false) => Direction::Outbound,
        (false, true) => Direction::Inbound,
        _ => Direction::Unknown,
    }
}

/// The remote endpoint of a packet: the non-local side, if there is exactly
/// one local side.
pub fn remote_ip_of(packet: &PacketMetadata, local: &LocalAddrs) -> Option<String> {
    match direction_of(packet, local) {
        Direction::Outbound => packet.dst_ip.clone(),
        Direction::Inbound => packet.src_ip.clone(),
        Direction::Unknown => None,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_packets: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub ipv4_percent: f64,
    pub ipv6_percent: f64,
    pub tcp_percent: f64,
    pub udp_percent: f64,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Stats {
    /// Fold one packet into the counters. Percentages are recomputed against
    /// `total_packets`, so `tcp_percent + udp_percent` can fall short of 100
    /// when non-TCP/UDP traffic is present.
    pub fn fold(&mut self, packet: &PacketMetadata, direction: Direction) {
        let bytes = u64::from(packet.frame_len);

        self.total_packets += 1;
        match direction {
            Direction::Outbound => {
                self.total_bytes_sent += bytes;
                self.outbound_bytes += bytes;
            }
            Direction::Inbound => {
                self.total_bytes_received += bytes;
                self.inbound_bytes += bytes;
            }
            Direction::Unknown => {}
        }

        if packet.ipv4.is_some() {
            self.ipv4_packets += 1;
        } else if packet.ipv6.is_some() {
            self.ipv6_packets += 1;
        }
        if packet.tcp.is_some() {
            self.tcp_packets += 1;
        } else if packet.udp.is_some() {
            self.udp_packets += 1;
        }

        self.recompute_percents();

        if self.first_seen == 0 || packet.timestamp_ms < self.first_seen {
            self.first_seen = packet.timestamp_ms;
        }
        if packet.timestamp_ms > self.last_seen {
            self.last_seen = packet.timestamp_ms;
        }
    }

    fn recompute_percents(&mut self) {
        let total = self.total_packets;
        let percent = |count: u64| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64 * 100.0
            }
        };
        self.ipv4_percent = percent(self.ipv4_packets);
        self.ipv6_percent = percent(self.ipv6_packets);
        self.tcp_percent = percent(self.tcp_packets);
        self.udp_percent = percent(self.udp_packets);
    }

    /// Persistence form: percent fields integer-rounded.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_packets: self.total_packets,
            total_bytes_sent: self.total_bytes_sent,
            total_bytes_received: self.total_bytes_received,
            inbound_bytes: self.inbound_bytes,
            outbound_bytes: self.outbound_bytes,
            ipv4_packets: self.ipv4_packets,
            ipv6_packets: self.ipv6_packets,
            tcp_packets: self.tcp_packets,
            udp_packets: self.udp_packets,
            ipv4_percent: round_percent(self.ipv4_percent),
            ipv6_percent: round_percent(self.ipv6_percent),
            tcp_percent: round_percent(self.tcp_percent),
            udp_percent: round_percent(self.udp_percent),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn round_percent(value: f64) -> u32 {
    value.round().clamp(0.0, 100.0) as u32
}

/// Serialized Stats with integer percents.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_packets: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub ipv4_percent: u32,
    pub ipv6_percent: u32,
    pub tcp_percent: u32,
    pub udp_percent: u32,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Per-interface counters kept by the application and process registries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceStats {
    pub packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl InterfaceStats {
    pub fn fold(&mut self, packet: &PacketMetadata, direction: Direction) {
        let bytes = u64::from(packet.frame_len);
        self.packets += 1;
        match direction {
            Direction::Outbound => self.bytes_sent += bytes,
            Direction::Inbound => self.bytes_received += bytes,
            Direction::Unknown => {}
        }
    }
}
