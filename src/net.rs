//! Address canonicalization and range classification.
//!
//! Every IPv6 literal that enters the engine (from the decoder, from netstat,
//! from the local interface enumeration) is rewritten to one canonical form:
//! zone-stripped, fully expanded, zero-padded, lowercase. Matching between the
//! capture path and the socket table only works because both sides agree on
//! this form.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Ports owned by OS-level services; traffic on these is classified as system
/// traffic regardless of which process the socket table would attribute it to.
const SYSTEM_PORTS: [u16; 12] = [53, 67, 68, 123, 137, 138, 139, 161, 162, 514, 546, 547];

/// Canonicalize an IPv6 literal: strip any `%zone` suffix, expand `::`,
/// zero-pad each group to four hex digits, lowercase. Non-IPv6 input is
/// passed through unchanged.
///
/// ```
/// # use netlens::net::normalize_ipv6;
/// assert_eq!(
///     normalize_ipv6("2001:db8::1%eth0"),
///     "2001:0db8:0000:0000:0000:0000:0000:0001"
/// );
/// assert_eq!(normalize_ipv6("10.1.2.3"), "10.1.2.3");
/// ```
pub fn normalize_ipv6(addr: &str) -> String {
    if !addr.contains(':') {
        return addr.to_string();
    }

    let bare = addr.split('%').next().unwrap_or(addr);

    match bare.parse::<Ipv6Addr>() {
        Ok(v6) => expand(v6),
        Err(_) => addr.to_string(),
    }
}

/// Render an [`Ipv6Addr`] in the canonical fully-expanded form.
pub fn expand(v6: Ipv6Addr) -> String {
    let groups = v6.segments();
    let mut out = String::with_capacity(39);
    for (i, group) in groups.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        out.push_str(&format!("{group:04x}"));
    }
    out
}

/// Canonicalize an IPv6 literal that may be in the 16-part byte-wise form some
/// capture decoders emit (`"20:01:0d:b8:…"`, one group per byte). Byte pairs
/// are recombined into the usual eight groups before normalization; anything
/// else is handed to [`normalize_ipv6`] as-is.
pub fn format_ipv6(raw: &str) -> String {
    let parts: Vec<&str> = raw.split(':').collect();

    if parts.len() == 16 && parts.iter().all(|p| p.len() <= 2 && !p.is_empty()) {
        let mut grouped = String::with_capacity(39);
        for (i, pair) in parts.chunks(2).enumerate() {
            if i > 0 {
                grouped.push(':');
            }
            grouped.push_str(&format!("{:0>2}{:0>2}", pair[0], pair[1]));
        }
        return normalize_ipv6(&grouped);
    }

    normalize_ipv6(raw)
}

fn parse_ip(addr: &str) -> Option<IpAddr> {
    let bare = addr.split('%').next().unwrap_or(addr);
    bare.parse().ok()
}

/// Loopback: `127.0.0.0/8` or `::1`.
pub fn is_loopback(addr: &str) -> bool {
    matches!(parse_ip(addr), Some(ip) if ip.is_loopback())
}

/// Multicast: `224.0.0.0/4` or `ff00::/8`.
pub fn is_multicast(addr: &str) -> bool {
    matches!(parse_ip(addr), Some(ip) if ip.is_multicast())
}

/// Link-local: `169.254.0.0/16` or `fe80::/10`.
pub fn is_link_local(addr: &str) -> bool {
    match parse_ip(addr) {
        Some(IpAddr::V4(v4)) => v4.is_link_local(),
        Some(IpAddr::V6(v6)) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        None => false,
    }
}

/// The limited broadcast address `255.255.255.255`.
pub fn is_broadcast(addr: &str) -> bool {
    parse_ip(addr) == Some(IpAddr::V4(Ipv4Addr::BROADCAST))
}

/// True when the address falls in any range the attribution engine treats as
/// system traffic rather than per-process traffic.
pub fn is_system_range(addr: &str) -> bool {
    is_multicast(addr) || is_link_local(addr) || is_broadcast(addr)
}

pub fn is_system_port(port: u16) -> bool {
    SYSTEM_PORTS.contains(&port)
}

/// The set of addresses assigned to local interfaces, in canonical form.
///
/// Used by the attribution engine to decide which side of a packet is local,
/// and by the registry manager to pick the remote endpoint and the traffic
/// direction.
#[derive(Debug, Default, Clone)]
pub struct LocalAddrs {
    addrs: HashSet<String>,
}

impl LocalAddrs {
    /// Enumerate every capturable device and collect its addresses.
    /// Loopback forms are always present so loopback frames never look remote.
    pub fn discover() -> eyre::Result<Self> {
        let mut local = Self::default();

        for device in pcap::Device::list()? {
            for address in device.addresses {
                local.insert(address.addr);
            }
        }

        local.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        local.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));

        Ok(local)
    }

    pub fn from_addrs<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Self {
        let mut local = Self::default();
        for addr in addrs {
            local.insert(addr);
        }
        local
    }

    pub fn insert(&mut self, addr: IpAddr) {
        let canonical = match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => expand(v6),
        };
        self.addrs.insert(canonical);
    }

    /// Membership test against a canonical address string.
    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr) || is_loopback(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.addrs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_zone_and_compression() {
        assert_eq!(
            normalize_ipv6("2001:db8::1%eth0"),
            "2001:0db8:0000:0000:0000:0000:0000:0001"
        );
        assert_eq!(
            normalize_ipv6("::1"),
            "0000:0000:0000:0000:0000:0000:0000:0001"
        );
        assert_eq!(
            normalize_ipv6("FE80::ABCD"),
            "fe80:0000:0000:0000:0000:0000:0000:abcd"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in ["2001:db8::1%eth0", "::", "fe80::1", "10.0.0.1", "not-an-ip"] {
            let once = normalize_ipv6(input);
            assert_eq!(normalize_ipv6(&once), once);
        }
    }

    #[test]
    fn non_ipv6_passes_through() {
        assert_eq!(normalize_ipv6("192.168.1.10"), "192.168.1.10");
        assert_eq!(normalize_ipv6("hostname"), "hostname");
    }

    #[test]
    fn formats_bytewise_form() {
        assert_eq!(
            format_ipv6("20:01:0d:b8:00:00:00:00:00:00:00:00:00:00:00:01"),
            "2001:0db8:0000:0000:0000:0000:0000:0001"
        );
        // Already grouped input goes straight through normalization.
        assert_eq!(
            format_ipv6("2001:db8::1"),
            "2001:0db8:0000:0000:0000:0000:0000:0001"
        );
    }

    #[test]
    fn classifies_ranges() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("127.4.5.6"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("0000:0000:0000:0000:0000:0000:0000:0001"));
        assert!(is_multicast("224.0.0.251"));
        assert!(is_multicast("ff02:0000:0000:0000:0000:0000:0000:00fb"));
        assert!(is_link_local("169.254.10.20"));
        assert!(is_link_local("fe80:0000:0000:0000:0000:0000:0000:0001"));
        assert!(is_broadcast("255.255.255.255"));
        assert!(!is_system_range("8.8.8.8"));
    }

    #[test]
    fn local_set_contains_canonical_forms() {
        let local = LocalAddrs::from_addrs([
            "10.0.0.2".parse().expect("v4"),
            "2001:db8::1".parse().expect("v6"),
        ]);

        assert!(local.contains("10.0.0.2"));
        assert!(local.contains("2001:0db8:0000:0000:0000:0000:0000:0001"));
        assert!(local.contains("127.0.0.1"));
        assert!(!local.contains("10.0.0.3"));
    }
}
