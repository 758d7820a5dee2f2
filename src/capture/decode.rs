//! Frame decoder: Ethernet → IPv4/IPv6 → TCP/UDP.
//!
//! The decoder owns nothing: it reads one copied-out frame buffer and emits a
//! [`PacketMetadata`] with the header fields the rest of the pipeline keys on.
//! Anything it cannot make sense of is reported as an error so the capture
//! thread can drop the frame with a debug log.

use eyre::bail;
use serde::Serialize;

use crate::capture::protocol::{ethertype_name, ip_protocol_label};
use crate::net::expand;

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct EthernetHeader {
    pub src_mac: String,
    pub dst_mac: String,
    pub ethertype: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ipv4Header {
    pub version: u8,
    pub header_len: u8,
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src_addr: String,
    pub dst_addr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ipv6Header {
    pub version: u8,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: String,
    pub dst_addr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub header_len: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

/// One observed frame, decoded and (later) attributed.
///
/// The `src_ip`/`dst_ip`/`src_port`/`dst_port`/`protocol` fields are
/// denormalized copies of the header fields so consumers never have to walk
/// the optional headers. The attribution fields start empty and are filled by
/// the attribution engine and the registry manager.
#[derive(Debug, Clone, Serialize)]
pub struct PacketMetadata {
    pub timestamp_ms: i64,
    pub frame_len: u32,
    pub interface: String,
    pub ethernet: EthernetHeader,
    pub ipv4: Option<Ipv4Header>,
    pub ipv6: Option<Ipv6Header>,
    pub tcp: Option<TcpHeader>,
    pub udp: Option<UdpHeader>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// `"tcp"`/`"udp"` when an L4 header was decoded, otherwise the IP
    /// protocol name or `IP-<n>`, or the ethertype name for non-IP frames.
    pub protocol: String,
    /// Hex-encoded slice from the end of the L4 header to the end of frame.
    pub payload_hex: String,
    pub pid: Option<i32>,
    pub proc_name: Option<String>,
    pub app_registry_id: Option<String>,
    pub app_name: Option<String>,
    pub app_display_name: Option<String>,
    #[serde(skip)]
    pub retry_count: u8,
}

fn format_mac(bytes: &[u8]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Decode one frame copied out of the capture buffer.
pub fn decode_frame(interface: &str, timestamp_ms: i64, frame: &[u8]) -> eyre::Result<PacketMetadata> {
    if frame.len() < ETHERNET_HEADER_LEN {
        bail!("frame of {} bytes is shorter than an Ethernet header", frame.len());
    }

    let dst_mac = format_mac(&frame[0..6]);
    let src_mac = format_mac(&frame[6..12]);
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut l3_offset = ETHERNET_HEADER_LEN;

    // 802.1Q: skip the tag and read the inner ethertype.
    if ethertype == 0x8100 {
        if frame.len() < ETHERNET_HEADER_LEN + 4 {
            bail!("vlan-tagged frame truncated");
        }
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        l3_offset += 4;
    }

    let mut packet = PacketMetadata {
        timestamp_ms,
        frame_len: u32::try_from(frame.len()).unwrap_or(u32::MAX),
        interface: interface.to_string(),
        ethernet: EthernetHeader {
            src_mac,
            dst_mac,
            ethertype,
        },
        ipv4: None,
        ipv6: None,
        tcp: None,
        udp: None,
        src_ip: None,
        dst_ip: None,
        src_port: None,
        dst_port: None,
        protocol: String::new(),
        payload_hex: String::new(),
        pid: None,
        proc_name: None,
        app_registry_id: None,
        app_name: None,
        app_display_name: None,
        retry_count: 0,
    };

    match ethertype {
        0x0800 => decode_ipv4(&mut packet, frame, l3_offset)?,
        0x86DD => decode_ipv6(&mut packet, frame, l3_offset)?,
        other => {
            packet.protocol = ethertype_name(other)
                .map_or_else(|| format!("eth-0x{other:04x}"), str::to_string);
        }
    }

    Ok(packet)
}

fn decode_ipv4(packet: &mut PacketMetadata, frame: &[u8], offset: usize) -> eyre::Result<()> {
    let Some(header) = frame.get(offset..) else {
        bail!("ipv4 header out of range");
    };
    if header.len() < IPV4_MIN_HEADER_LEN {
        bail!("ipv4 header truncated at {} bytes", header.len());
    }

    let version = header[0] >> 4;
    let header_len = (header[0] & 0x0F) * 4;
    if version != 4 || usize::from(header_len) < IPV4_MIN_HEADER_LEN {
        bail!("malformed ipv4 header (version {version}, ihl {header_len})");
    }
    if header.len() < usize::from(header_len) {
        bail!("ipv4 options truncated");
    }

    let protocol = header[9];
    let src_addr = format!("{}.{}.{}.{}", header[12], header[13], header[14], header[15]);
    let dst_addr = format!("{}.{}.{}.{}", header[16], header[17], header[18], header[19]);

    packet.ipv4 = Some(Ipv4Header {
        version,
        header_len,
        total_len: u16::from_be_bytes([header[2], header[3]]),
        ttl: header[8],
        protocol,
        src_addr: src_addr.clone(),
        dst_addr: dst_addr.clone(),
    });
    packet.src_ip = Some(src_addr);
    packet.dst_ip = Some(dst_addr);

    decode_l4(packet, frame, offset + usize::from(header_len), protocol);
    Ok(())
}

fn decode_ipv6(packet: &mut PacketMetadata, frame: &[u8], offset: usize) -> eyre::Result<()> {
    let Some(header) = frame.get(offset..) else {
        bail!("ipv6 header out of range");
    };
    if header.len() < IPV6_HEADER_LEN {
        bail!("ipv6 header truncated at {} bytes", header.len());
    }

    let version = header[0] >> 4;
    if version != 6 {
        bail!("malformed ipv6 header (version {version})");
    }

    let next_header = header[6];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&header[8..24]);
    dst.copy_from_slice(&header[24..40]);

    let src_addr = expand(std::net::Ipv6Addr::from(src));
    let dst_addr = expand(std::net::Ipv6Addr::from(dst));

    packet.ipv6 = Some(Ipv6Header {
        version,
        payload_len: u16::from_be_bytes([header[4], header[5]]),
        next_header,
        hop_limit: header[7],
        src_addr: src_addr.clone(),
        dst_addr: dst_addr.clone(),
    });
    packet.src_ip = Some(src_addr);
    packet.dst_ip = Some(dst_addr);

    decode_l4(packet, frame, offset + IPV6_HEADER_LEN, next_header);
    Ok(())
}

/// Decode the transport header when it is TCP or UDP; for every other
/// protocol byte the packet keeps the IP-protocol label and the payload is
/// everything past the network header.
fn decode_l4(packet: &mut PacketMetadata, frame: &[u8], offset: usize, protocol: u8) {
    let payload_start = match protocol {
        6 => decode_tcp(packet, frame, offset),
        17 => decode_udp(packet, frame, offset),
        _ => None,
    };

    match payload_start {
        Some(start) => {
            packet.payload_hex = hex::encode(frame.get(start..).unwrap_or_default());
        }
        None => {
            packet.protocol = ip_protocol_label(protocol);
            packet.payload_hex = hex::encode(frame.get(offset..).unwrap_or_default());
        }
    }
}

fn decode_tcp(packet: &mut PacketMetadata, frame: &[u8], offset: usize) -> Option<usize> {
    let header = frame.get(offset..)?;
    if header.len() < TCP_MIN_HEADER_LEN {
        return None;
    }

    let header_len = (header[12] >> 4) * 4;
    if usize::from(header_len) < TCP_MIN_HEADER_LEN || header.len() < usize::from(header_len) {
        return None;
    }

    let src_port = u16::from_be_bytes([header[0], header[1]]);
    let dst_port = u16::from_be_bytes([header[2], header[3]]);

    packet.tcp = Some(TcpHeader {
        src_port,
        dst_port,
        sequence: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        acknowledgement: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        header_len,
        flags: header[13],
        window: u16::from_be_bytes([header[14], header[15]]),
        checksum: u16::from_be_bytes([header[16], header[17]]),
    });
    packet.src_port = Some(src_port);
    packet.dst_port = Some(dst_port);
    packet.protocol = "tcp".to_string();

    Some(offset + usize::from(header_len))
}

fn decode_udp(packet: &mut PacketMetadata, frame: &[u8], offset: usize) -> Option<usize> {
    let header = frame.get(offset..)?;
    if header.len() < UDP_HEADER_LEN {
        return None;
    }

    let src_port = u16::from_be_bytes([header[0], header[1]]);
    let dst_port = u16::from_be_bytes([header[2], header[3]]);

    packet.udp = Some(UdpHeader {
        src_port,
        dst_port,
        length: u16::from_be_bytes([header[4], header[5]]),
        checksum: u16::from_be_bytes([header[6], header[7]]),
    });
    packet.src_port = Some(src_port);
    packet.dst_port = Some(dst_port);
    packet.protocol = "udp".to_string();

    Some(offset + UDP_HEADER_LEN)
}
