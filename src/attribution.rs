//! Attribution engine: attach `(pid, process name)` to decoded packets.
//!
//! Matching runs in order: system classification, bidirectional 5-tuple
//! lookup, TCP local-endpoint fallback, UDP local-endpoint fallback. The
//! outcome is a sum type; the legacy sentinel strings (`"SYSTEM"`,
//! `"UNKNOWN_MATCHTCP_PKT"`, …) exist only at the emission boundary.

use std::sync::Arc;

use chrono::Utc;

use crate::capture::decode::PacketMetadata;
use crate::net::{self, LocalAddrs, normalize_ipv6};
use crate::procs::ProcessIndex;
use crate::sockets::netstat::SocketProto;
use crate::sockets::{NetworkConnection, SocketIndex, conn_key};

/// Protocols that are always system traffic, whoever owns the socket.
const SYSTEM_PROTOCOLS: [&str; 6] = ["arp", "icmp", "icmpv6", "igmp", "dhcp", "dhcpv6"];

/// Outcome of one attribution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Matched { pid: i32, name: String },
    System,
    Unknown(UnknownReason),
}

/// Which matching stage gave up on the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownReason {
    /// The packet carries no usable 5-tuple (or an unmatched protocol).
    NoConnKey,
    /// TCP endpoint maps had no entry for the local side.
    NoTcpMap,
    /// UDP endpoint maps had no entry for the local side.
    NoUdpMap,
    /// Neither endpoint is a local address, so there is no side to look up.
    NoLocalEndpoint,
}

impl UnknownReason {
    /// Legacy sentinel rendered into emitted packets once retries run out.
    pub fn sentinel(self) -> &'static str {
        match self {
            Self::NoConnKey => "UNKNOWN",
            Self::NoTcpMap => "UNKNOWN_MATCHTCP_PKT",
            Self::NoUdpMap => "UNKNOWN_MATCHUDP_PKT",
            Self::NoLocalEndpoint => "UNKNOWN_NO_LOCAL",
        }
    }
}

pub struct ProcConManager {
    sockets: Arc<SocketIndex>,
    procs: Arc<ProcessIndex>,
    local: Arc<LocalAddrs>,
    output: Vec<(PacketMetadata, Attribution)>,
}

impl ProcConManager {
    pub fn new(sockets: Arc<SocketIndex>, procs: Arc<ProcessIndex>, local: Arc<LocalAddrs>) -> Self {
        Self {
            sockets,
            procs,
            local,
            output: Vec::new(),
        }
    }

    /// Attribute one packet and enqueue it on the output queue. Attribution
    /// is attempted exactly once per delivery; retries re-enter through the
    /// orchestrator's retry queue.
    pub fn process_packet(&mut self, mut packet: PacketMetadata) {
        let attribution = self.attribute(&mut packet);
        self.output.push((packet, attribution));
    }

    /// Drain everything attributed since the last call.
    pub fn drain_output(&mut self) -> Vec<(PacketMetadata, Attribution)> {
        std::mem::take(&mut self.output)
    }

    /// Background reconciliation: fill missing process names on socket index
    /// entries from the process index. Never blocks packet processing.
    pub fn update_proc_con_info(&self) {
        self.sockets.fill_missing_proc_names(&self.procs);
    }

    fn attribute(&self, packet: &mut PacketMetadata) -> Attribution {
        if classify_system(packet) {
            packet.pid = Some(-1);
            packet.proc_name = Some("SYSTEM".to_string());
            return Attribution::System;
        }

        let (Some(src_ip), Some(dst_ip)) = (packet.src_ip.clone(), packet.dst_ip.clone()) else {
            return Attribution::Unknown(UnknownReason::NoConnKey);
        };
        let (Some(src_port), Some(dst_port)) = (packet.src_port, packet.dst_port) else {
            return Attribution::Unknown(UnknownReason::NoConnKey);
        };
        let proto = match packet.protocol.as_str() {
            "tcp" => SocketProto::Tcp,
            "udp" => SocketProto::Udp,
            _ => return Attribution::Unknown(UnknownReason::NoConnKey),
        };

        // Bidirectional 5-tuple match.
        let key = conn_key(&src_ip, src_port, &dst_ip, dst_port, proto.as_str());
        if let Some((pid, name)) = self.sockets.connection_hit(&key) {
            return self.complete(packet, pid, name, proto);
        }

        // Endpoint fallbacks need to know which side is local.
        let (local_addr, local_port, remote_addr, remote_port) =
            if self.local.contains(&src_ip) {
                (src_ip, src_port, dst_ip, dst_port)
            } else if self.local.contains(&dst_ip) {
                (dst_ip, dst_port, src_ip, src_port)
            } else {
                return Attribution::Unknown(UnknownReason::NoLocalEndpoint);
            };

        let wildcard_key = match proto {
            SocketProto::Tcp if local_addr.contains(':') => {
                format!("{}:{local_port}", normalize_ipv6("::"))
            }
            SocketProto::Tcp => format!("0.0.0.0:{local_port}"),
            SocketProto::Udp => format!(":{local_port}"),
        };

        let now = Utc::now().timestamp_millis();
        let hit = self
            .sockets
            .endpoint_hit(proto, &local_addr, local_port, &wildcard_key, now);

        let Some((pid, name)) = hit else {
            return Attribution::Unknown(match proto {
                SocketProto::Tcp => UnknownReason::NoTcpMap,
                SocketProto::Udp => UnknownReason::NoUdpMap,
            });
        };

        // Promote the pairing so the next packet of this flow matches on the
        // connection map directly.
        self.sockets.promote(
            key,
            NetworkConnection {
                pid,
                proc_name: name.clone(),
                src_addr: local_addr,
                src_port: local_port,
                dst_addr: remote_addr,
                dst_port: remote_port,
                protocol: proto.as_str().to_string(),
                state: "ESTABLISHED".to_string(),
            },
        );

        self.complete(packet, pid, name, proto)
    }

    /// Copy a lookup hit onto the packet. A hit missing its pid or name is
    /// not a match yet; the retry queue gives reconciliation time to fill it.
    fn complete(
        &self,
        packet: &mut PacketMetadata,
        pid: Option<i32>,
        name: Option<String>,
        proto: SocketProto,
    ) -> Attribution {
        packet.pid = pid.or(packet.pid);

        let name = name.or_else(|| pid.and_then(|p| self.procs.get_name(p)));
        if let Some(name) = &name {
            packet.proc_name = Some(name.clone());
        }

        match (pid, name) {
            (Some(pid), Some(name)) => Attribution::Matched { pid, name },
            _ => Attribution::Unknown(match proto {
                SocketProto::Tcp => UnknownReason::NoTcpMap,
                SocketProto::Udp => UnknownReason::NoUdpMap,
            }),
        }
    }
}

/// System traffic: infrastructure protocols, multicast/link-local/broadcast
/// ranges, or well-known system service ports on either side.
fn classify_system(packet: &PacketMetadata) -> bool {
    if SYSTEM_PROTOCOLS.contains(&packet.protocol.as_str()) {
        return true;
    }

    for addr in [&packet.src_ip, &packet.dst_ip].into_iter().flatten() {
        if net::is_system_range(addr) {
            return true;
        }
    }

    for port in [packet.src_port, packet.dst_port].into_iter().flatten() {
        if net::is_system_port(port) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decode::{self, tests::tcp_frame};
    use crate::config::EngineConfig;
    use crate::sockets::netstat::NetstatRow;

    fn manager(local: &[&str]) -> ProcConManager {
        let sockets = Arc::new(SocketIndex::new(&EngineConfig::default()));
        let procs = Arc::new(ProcessIndex::new());
        let local = Arc::new(LocalAddrs::from_addrs(
            local.iter().map(|a| a.parse().expect("addr")),
        ));
        ProcConManager::new(sockets, procs, local)
    }

    fn install_connection(manager: &ProcConManager) {
        manager.sockets.install_rows(
            vec![NetstatRow {
                proto: SocketProto::Tcp,
                local_addr: "10.0.0.2".to_string(),
                local_port: Some(443),
                remote_addr: "10.0.0.1".to_string(),
                remote_port: Some(55555),
                state: Some("ESTABLISHED".to_string()),
                pid: Some(100),
                proc_name: Some("nginx".to_string()),
            }],
            0,
        );
    }

    fn packet(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> PacketMetadata {
        let frame = tcp_frame(src, sport, dst, dport);
        decode::decode_frame("eth0", 0, &frame).expect("decode")
    }

    #[test]
    fn bidirectional_match_attributes_both_directions() {
        let mut manager = manager(&["10.0.0.2"]);
        install_connection(&manager);

        manager.process_packet(packet([10, 0, 0, 1], 55555, [10, 0, 0, 2], 443));
        manager.process_packet(packet([10, 0, 0, 2], 443, [10, 0, 0, 1], 55555));

        let output = manager.drain_output();
        assert_eq!(output.len(), 2);
        for (packet, attribution) in output {
            assert_eq!(
                attribution,
                Attribution::Matched {
                    pid: 100,
                    name: "nginx".to_string()
                }
            );
            assert_eq!(packet.pid, Some(100));
            assert_eq!(packet.proc_name.as_deref(), Some("nginx"));
        }
    }

    #[test]
    fn system_ports_and_protocols_classify_as_system() {
        let mut manager = manager(&["10.0.0.2"]);

        // DNS port.
        manager.process_packet(packet([10, 0, 0, 2], 40000, [8, 8, 8, 8], 53));
        // Multicast destination.
        manager.process_packet(packet([10, 0, 0, 2], 40000, [224, 0, 0, 251], 9999));

        for (packet, attribution) in manager.drain_output() {
            assert_eq!(attribution, Attribution::System);
            assert_eq!(packet.pid, Some(-1));
            assert_eq!(packet.proc_name.as_deref(), Some("SYSTEM"));
        }
    }

    #[test]
    fn tcp_fallback_promotes_into_connection_map() {
        let mut manager = manager(&["10.0.0.2"]);
        // Listener only: no established row for this flow yet.
        manager.sockets.install_rows(
            vec![NetstatRow {
                proto: SocketProto::Tcp,
                local_addr: "0.0.0.0".to_string(),
                local_port: Some(8080),
                remote_addr: "0.0.0.0".to_string(),
                remote_port: None,
                state: Some("LISTENING".to_string()),
                pid: Some(777),
                proc_name: Some("miniserve".to_string()),
            }],
            0,
        );

        manager.process_packet(packet([203, 0, 113, 9], 51000, [10, 0, 0, 2], 8080));
        let output = manager.drain_output();
        assert_eq!(
            output[0].1,
            Attribution::Matched {
                pid: 777,
                name: "miniserve".to_string()
            }
        );

        let key = conn_key("203.0.113.9", 51000, "10.0.0.2", 8080, "tcp");
        assert_eq!(
            manager.sockets.connection_hit(&key),
            Some((Some(777), Some("miniserve".to_string())))
        );
    }

    #[test]
    fn unmatched_tcp_reports_no_tcp_map() {
        let mut manager = manager(&["10.0.0.2"]);
        manager.process_packet(packet([10, 0, 0, 2], 40000, [93, 184, 216, 34], 8443));

        let output = manager.drain_output();
        assert_eq!(output[0].1, Attribution::Unknown(UnknownReason::NoTcpMap));
        assert!(output[0].0.proc_name.is_none());
    }

    #[test]
    fn packet_with_no_local_side_reports_no_local_endpoint() {
        let mut manager = manager(&["10.0.0.2"]);
        manager.process_packet(packet([203, 0, 113, 1], 1000, [198, 51, 100, 1], 2000));

        let output = manager.drain_output();
        assert_eq!(
            output[0].1,
            Attribution::Unknown(UnknownReason::NoLocalEndpoint)
        );
    }

    #[test]
    fn sentinels_render_failure_modes() {
        assert_eq!(UnknownReason::NoConnKey.sentinel(), "UNKNOWN");
        assert_eq!(UnknownReason::NoTcpMap.sentinel(), "UNKNOWN_MATCHTCP_PKT");
        assert_eq!(UnknownReason::NoUdpMap.sentinel(), "UNKNOWN_MATCHUDP_PKT");
        assert!(
            UnknownReason::NoLocalEndpoint
                .sentinel()
                .starts_with("UNKNOWN")
        );
    }
}
