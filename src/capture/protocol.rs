//! Lookup tables for IP protocol numbers and ethertypes.
//!
//! Names follow the IANA assigned-numbers registry, lowercased, so they can
//! be compared directly against the attribution engine's system-protocol set.

/// Well-known IP protocol numbers. Returns `None` for numbers the engine has
/// no name for; callers fall back to the `IP-<n>` form.
pub fn protocol_name(number: u8) -> Option<&'static str> {
    Some(match number {
        0 => "hopopt",
        1 => "icmp",
        2 => "igmp",
        3 => "ggp",
        4 => "ipv4",
        5 => "st",
        6 => "tcp",
        8 => "egp",
        9 => "igp",
        12 => "pup",
        17 => "udp",
        20 => "hmp",
        27 => "rdp",
        33 => "dccp",
        41 => "ipv6",
        43 => "ipv6-route",
        44 => "ipv6-frag",
        46 => "rsvp",
        47 => "gre",
        50 => "esp",
        51 => "ah",
        58 => "icmpv6",
        59 => "ipv6-nonxt",
        60 => "ipv6-opts",
        88 => "eigrp",
        89 => "ospf",
        94 => "ipip",
        97 => "etherip",
        103 => "pim",
        108 => "ipcomp",
        112 => "vrrp",
        115 => "l2tp",
        132 => "sctp",
        136 => "udplite",
        137 => "mpls-in-ip",
        139 => "hip",
        140 => "shim6",
        141 => "wesp",
        142 => "rohc",
        _ => return None,
    })
}

/// Protocol label for a raw IP protocol byte: the IANA name when known,
/// otherwise `IP-<n>`.
pub fn ip_protocol_label(number: u8) -> String {
    protocol_name(number).map_or_else(|| format!("IP-{number}"), str::to_string)
}

/// Names for the ethertypes the decoder can encounter above the IP family.
pub fn ethertype_name(ethertype: u16) -> Option<&'static str> {
    Some(match ethertype {
        0x0800 => "ipv4",
        0x0806 => "arp",
        0x8035 => "rarp",
        0x8100 => "vlan",
        0x86DD => "ipv6",
        0x8847 => "mpls",
        0x8863 => "pppoe-discovery",
        0x8864 => "pppoe-session",
        0x88CC => "lldp",
        _ => return None,
    })
}
