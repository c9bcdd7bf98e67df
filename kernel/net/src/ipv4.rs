//! IPv4 layer.
//!
//! # Header Format (RFC 791)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |Ver|IHL|  DSCP/ECN     |          Total Length                 |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |      Identification           |Flags|    Fragment Offset      |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |  TTL  |   Protocol    |        Header Checksum                |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                       Source Address                          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Destination Address                       |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! On decode the layer records tag 1, validates the header (version, IHL,
//! total length, header checksum) and dispatches on the protocol byte.  On
//! encode it asks the Ethernet layer for a frame (resolving the destination
//! MAC through the neighbor cache), writes its header at tag 1 and advances.
//! Fragmentation and routing beyond on-link delivery are out of scope.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::arp;
use crate::checksum;
use crate::ethernet::{self, ETHERTYPE_IPV4};
use crate::icmp;
use crate::interface::Interface;
use crate::packet::Packet;
use crate::socket::{socket_table, SocketError, SocketProtocol};
use crate::stack::{net_stats, DropReason, ProcessResult};
use crate::tcp;
use crate::udp;

// ============================================================================
// Constants
// ============================================================================

/// IPv4 header length in bytes (no options are ever emitted).
pub const IPV4_HEADER_LEN: usize = 20;

/// Time-to-live for originated packets.
pub const IPV4_DEFAULT_TTL: u8 = 64;

/// ICMP protocol number.
pub const PROTO_ICMP: u8 = 0x01;

/// TCP protocol number.
pub const PROTO_TCP: u8 = 0x06;

/// UDP protocol number.
pub const PROTO_UDP: u8 = 0x11;

/// Identification counter for originated packets.
static IDENT: AtomicU16 = AtomicU16::new(0);

// ============================================================================
// Address
// ============================================================================

/// An IPv4 address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Build an address from its four octets.
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// The unspecified address 0.0.0.0.
    pub const UNSPECIFIED: Self = Ipv4Addr([0; 4]);

    /// The four octets.
    #[inline]
    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    /// Limited broadcast (255.255.255.255).
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    /// Class D multicast (224.0.0.0/4).
    pub fn is_multicast(&self) -> bool {
        (self.0[0] & 0xF0) == 0xE0
    }

    /// 0.0.0.0.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 4]
    }

    /// Loopback range (127.0.0.0/8).
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl core::fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self, f)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while validating an IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    /// Packet shorter than the minimum header.
    Truncated,
    /// Version field is not 4.
    BadVersion,
    /// IHL below 5 or beyond the packet.
    BadHeaderLen,
    /// Total length below the header length or beyond the packet.
    BadTotalLen,
    /// Header checksum does not verify.
    BadChecksum,
}

// ============================================================================
// Header
// ============================================================================

/// Parsed IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4).
    pub header_len: usize,
    /// Total datagram length (header + payload).
    pub total_len: usize,
    /// Identification field.
    pub ident: u16,
    /// Time to live.
    pub ttl: u8,
    /// Protocol byte.
    pub protocol: u8,
    /// Header checksum as received.
    pub checksum: u16,
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse and validate an IPv4 header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Ipv4Header, Ipv4Error> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(Ipv4Error::Truncated);
        }
        if buf[0] >> 4 != 4 {
            return Err(Ipv4Error::BadVersion);
        }
        let header_len = ((buf[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > buf.len() {
            return Err(Ipv4Error::BadHeaderLen);
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < header_len || total_len > buf.len() {
            return Err(Ipv4Error::BadTotalLen);
        }
        if checksum::fold(checksum::add_bytes(0, &buf[..header_len])) != 0xFFFF {
            return Err(Ipv4Error::BadChecksum);
        }

        Ok(Ipv4Header {
            header_len,
            total_len,
            ident: u16::from_be_bytes([buf[4], buf[5]]),
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr([buf[12], buf[13], buf[14], buf[15]]),
            dst: Ipv4Addr([buf[16], buf[17], buf[18], buf[19]]),
        })
    }

    /// Payload length (total length minus header).
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.total_len - self.header_len
    }

    /// Parse without validating the checksum.
    ///
    /// Egress finalize paths read their own half-built header, whose
    /// checksum field is still zero; only the structural length checks
    /// apply there.
    pub(crate) fn parse_unchecked(buf: &[u8]) -> Option<Ipv4Header> {
        if buf.len() < IPV4_HEADER_LEN {
            return None;
        }
        let header_len = ((buf[0] & 0x0F) as usize) * 4;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if header_len < IPV4_HEADER_LEN || total_len < header_len || total_len > buf.len() {
            return None;
        }
        Some(Ipv4Header {
            header_len,
            total_len,
            ident: u16::from_be_bytes([buf[4], buf[5]]),
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr([buf[12], buf[13], buf[14], buf[15]]),
            dst: Ipv4Addr([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Parameters a transport layer passes down to request an IPv4 packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    /// Bytes of IPv4 payload (transport header + transport payload).
    pub payload_size: usize,
    /// Destination address.
    pub target_ip: Ipv4Addr,
    /// Protocol byte to record in the header.
    pub protocol: u8,
}

// ============================================================================
// Decode
// ============================================================================

/// Decode an IPv4 packet and dispatch to the transport layer.
///
/// Must only be called from the Ethernet layer; the cursor sits at the IPv4
/// header.  Never suspends.
pub fn decode(interface: &Arc<Interface>, packet: &mut Packet) -> ProcessResult {
    packet.set_tag(1, packet.index);

    let header = match Ipv4Header::parse(packet.at(packet.index)) {
        Ok(header) => header,
        Err(e) => {
            klog!(Debug, "ipv4: dropping packet: {:?}", e);
            return ProcessResult::Dropped(DropReason::Ipv4(e));
        }
    };
    net_stats().inc_ipv4_rx();

    klog!(Trace, "ipv4: packet {} -> {} proto {:#04x}", header.src, header.dst, header.protocol);

    packet.advance(header.header_len);

    match header.protocol {
        PROTO_ICMP => icmp::decode(interface, packet),
        PROTO_TCP => tcp::decode(interface, packet),
        PROTO_UDP => udp::decode(interface, packet),
        proto => {
            klog!(Trace, "ipv4: unsupported protocol {:#04x}", proto);
            ProcessResult::Dropped(DropReason::UnsupportedProtocol)
        }
    }
}

// ============================================================================
// Encode
// ============================================================================

/// Write the IPv4 header at the cursor and advance past it.
fn prepare_packet(packet: &mut Packet, interface: &Interface, descriptor: &PacketDescriptor) {
    packet.set_tag(1, packet.index);

    let total_len = (IPV4_HEADER_LEN + descriptor.payload_size) as u16;
    let ident = IDENT.fetch_add(1, Ordering::Relaxed);

    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45; // version 4, IHL 5
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[4..6].copy_from_slice(&ident.to_be_bytes());
    header[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    header[8] = IPV4_DEFAULT_TTL;
    header[9] = descriptor.protocol;
    // checksum filled in by finalize
    header[12..16].copy_from_slice(&interface.ip.octets());
    header[16..20].copy_from_slice(&descriptor.target_ip.octets());

    packet.append(&header);
}

/// Resolve the on-link destination MAC for `target_ip`.
fn resolve_mac(target_ip: Ipv4Addr) -> Result<crate::device::MacAddress, SocketError> {
    match arp::lookup(target_ip) {
        Some(mac) => Ok(mac),
        None => {
            klog!(Error, "ipv4: no neighbor entry for {}", target_ip);
            Err(SocketError::Unresolved)
        }
    }
}

/// Prepare a kernel-originated packet with room for `descriptor.payload_size`
/// bytes of IPv4 payload.
pub fn kernel_prepare_packet(
    interface: &Arc<Interface>,
    descriptor: &PacketDescriptor,
) -> Result<Packet, SocketError> {
    let mac = resolve_mac(descriptor.target_ip)?;
    let desc = ethernet::PacketDescriptor {
        payload_size: IPV4_HEADER_LEN + descriptor.payload_size,
        target_mac: mac,
        ethertype: ETHERTYPE_IPV4,
    };
    let mut packet = ethernet::kernel_prepare_packet(interface, &desc);
    prepare_packet(&mut packet, interface, descriptor);
    Ok(packet)
}

/// Prepare a packet that will carry user payload.
pub fn user_prepare_packet(
    interface: &Arc<Interface>,
    descriptor: &PacketDescriptor,
) -> Result<Packet, SocketError> {
    let mac = resolve_mac(descriptor.target_ip)?;
    let desc = ethernet::PacketDescriptor {
        payload_size: IPV4_HEADER_LEN + descriptor.payload_size,
        target_mac: mac,
        ethertype: ETHERTYPE_IPV4,
    };
    let mut packet = ethernet::user_prepare_packet(interface, &desc);
    prepare_packet(&mut packet, interface, descriptor);
    Ok(packet)
}

/// Rewind past the header and fill in the header checksum.
///
/// Factored out of [`finalize_packet`] so the deferred-transmit path can
/// finalize without touching the driver.
pub(crate) fn finalize_checksum(packet: &mut Packet) {
    packet.rewind(IPV4_HEADER_LEN);
    let offset = packet.tag(1);
    debug_assert_eq!(offset, packet.index);

    net_stats().count_tx_origin(packet.origin());

    packet.write_at(offset + 10, &[0, 0]);
    let sum = checksum::add_bytes(0, &packet.frame()[offset..offset + IPV4_HEADER_LEN]);
    packet.write_at(offset + 10, &checksum::finalize(sum).to_be_bytes());
}

/// Finalize a prepared packet and hand it to the link layer for transmission.
///
/// Task context only; interrupt-context callers use the deferred variant.
pub fn finalize_packet(interface: &Arc<Interface>, packet: &mut Packet) -> Result<(), SocketError> {
    finalize_checksum(packet);
    ethernet::finalize_packet(interface, packet)
}

/// Finalize a prepared packet onto the deferred-transmit queue.
///
/// Safe from interrupt context: no driver call, no blocking.
pub(crate) fn finalize_packet_deferred(interface: &Arc<Interface>, mut packet: Packet) {
    finalize_checksum(&mut packet);
    crate::stack::defer_transmit(interface, packet);
}

/// Deliver a copy of `packet` to every listening socket bound at the IP
/// protocol level (e.g. ICMP sockets).
pub fn propagate_packet(packet: &Packet, protocol: SocketProtocol) {
    let delivered = socket_table().deliver_to_protocol(protocol, packet);
    if delivered > 0 {
        klog!(Trace, "ipv4: propagated packet to {} socket(s)", delivered);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> [u8; IPV4_HEADER_LEN] {
        let mut buf = [0u8; IPV4_HEADER_LEN];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&20u16.to_be_bytes());
        buf[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = PROTO_TCP;
        buf[12..16].copy_from_slice(&[10, 0, 0, 2]);
        buf[16..20].copy_from_slice(&[10, 0, 0, 1]);
        let sum = checksum::add_bytes(0, &buf);
        buf[10..12].copy_from_slice(&checksum::finalize(sum).to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_valid_header() {
        let buf = sample_header();
        let header = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(header.header_len, 20);
        assert_eq!(header.total_len, 20);
        assert_eq!(header.ident, 0x1234);
        assert_eq!(header.ttl, 64);
        assert_eq!(header.protocol, PROTO_TCP);
        assert_eq!(header.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(header.dst, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut buf = sample_header();
        buf[0] = 0x65;
        assert_eq!(Ipv4Header::parse(&buf), Err(Ipv4Error::BadVersion));
    }

    #[test]
    fn test_parse_rejects_bad_checksum() {
        let mut buf = sample_header();
        buf[10] ^= 0xFF;
        assert_eq!(Ipv4Header::parse(&buf), Err(Ipv4Error::BadChecksum));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert_eq!(Ipv4Header::parse(&[0x45, 0]), Err(Ipv4Error::Truncated));
    }

    #[test]
    fn test_parse_rejects_bad_total_len() {
        let mut buf = sample_header();
        buf[2..4].copy_from_slice(&200u16.to_be_bytes());
        // checksum no longer matters: length check comes first
        assert_eq!(Ipv4Header::parse(&buf), Err(Ipv4Error::BadTotalLen));
    }

    #[test]
    fn test_address_predicates() {
        assert!(Ipv4Addr::new(255, 255, 255, 255).is_broadcast());
        assert!(Ipv4Addr::new(224, 0, 0, 1).is_multicast());
        assert!(Ipv4Addr::new(127, 0, 0, 1).is_loopback());
        assert!(Ipv4Addr::UNSPECIFIED.is_unspecified());
        assert!(!Ipv4Addr::new(10, 0, 0, 1).is_broadcast());
    }
}
