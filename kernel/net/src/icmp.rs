//! ICMP layer.
//!
//! # Header Format (RFC 792)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Type  | Code  |   Checksum    |       Rest of Header          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                             Data                              |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Echo requests addressed to the interface are answered with an echo reply
//! carrying the request's rest-of-header (identifier + sequence number) and
//! payload verbatim.  Because decode may run in interrupt context, the reply
//! is finalized onto the deferred-transmit queue rather than handed to the
//! driver inline.  All ICMP packets are additionally propagated to sockets
//! bound at protocol level.

use alloc::sync::Arc;

use crate::checksum;
use crate::interface::Interface;
use crate::ipv4::{self, Ipv4Addr, Ipv4Header, PROTO_ICMP};
use crate::packet::Packet;
use crate::socket::{Socket, SocketError, SocketProtocol};
use crate::stack::{net_stats, DropReason, ProcessResult};

// ============================================================================
// Constants
// ============================================================================

/// ICMP header length: type, code, checksum, rest-of-header.
pub const ICMP_HEADER_LEN: usize = 8;

/// Bytes of the header before the rest-of-header field.  Prepare leaves the
/// cursor here so the caller can fill the rest-of-header in place.
pub const ICMP_FIXED_LEN: usize = 4;

/// Echo reply type.
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;

/// Destination unreachable type.
pub const ICMP_TYPE_UNREACHABLE: u8 = 3;

/// Echo request type.
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// Time exceeded type.
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

// ============================================================================
// Errors
// ============================================================================

/// Errors from ICMP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Message shorter than the ICMP header.
    Truncated,
}

// ============================================================================
// Header
// ============================================================================

/// Parsed ICMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    /// Message type.
    pub icmp_type: u8,
    /// Message code.
    pub code: u8,
    /// Checksum as received.
    pub checksum: u16,
    /// Rest-of-header (identifier + sequence number for echo messages).
    pub rest: [u8; 4],
}

impl IcmpHeader {
    /// Parse a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<IcmpHeader, IcmpError> {
        if buf.len() < ICMP_HEADER_LEN {
            return Err(IcmpError::Truncated);
        }
        Ok(IcmpHeader {
            icmp_type: buf[0],
            code: buf[1],
            checksum: u16::from_be_bytes([buf[2], buf[3]]),
            rest: [buf[4], buf[5], buf[6], buf[7]],
        })
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Parameters for preparing an ICMP message.
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    /// Bytes of echo data beyond the 8-byte header.
    pub payload_size: usize,
    /// Destination address.
    pub target_ip: Ipv4Addr,
    /// Message type.
    pub icmp_type: u8,
    /// Message code.
    pub code: u8,
}

// ============================================================================
// Decode
// ============================================================================

/// Decode an ICMP message.
///
/// Must only be called from the IPv4 layer; the cursor sits at the ICMP
/// header.  Never suspends; replies go through the deferred-transmit queue.
pub fn decode(interface: &Arc<Interface>, packet: &mut Packet) -> ProcessResult {
    packet.set_tag(2, packet.index);

    let header = match IcmpHeader::parse(packet.at(packet.index)) {
        Ok(header) => header,
        Err(e) => {
            klog!(Debug, "icmp: dropping short message");
            return ProcessResult::Dropped(DropReason::Icmp(e));
        }
    };
    net_stats().inc_icmp_rx();

    match header.icmp_type {
        ICMP_TYPE_ECHO_REQUEST => {
            klog!(Trace, "icmp: received echo request");
            // parsed by the IPv4 layer already; cannot fail here
            if let Ok(ip_header) = Ipv4Header::parse(packet.at(packet.tag(1))) {
                if ip_header.dst == interface.ip {
                    klog!(Trace, "icmp: replying to echo request for own address");
                    send_echo_reply(interface, packet, &ip_header);
                }
            }
        }
        ICMP_TYPE_ECHO_REPLY => {
            klog!(Trace, "icmp: echo reply");
        }
        ICMP_TYPE_UNREACHABLE => {
            klog!(Trace, "icmp: destination unreachable");
        }
        ICMP_TYPE_TIME_EXCEEDED => {
            klog!(Trace, "icmp: time exceeded");
        }
        other => {
            klog!(Trace, "icmp: unsupported message type {}", other);
        }
    }

    // Raw ICMP sockets see every message, handled or not.
    ipv4::propagate_packet(packet, SocketProtocol::Icmp);

    ProcessResult::Handled
}

/// Build and queue an echo reply mirroring the request's rest-of-header and
/// payload.
fn send_echo_reply(interface: &Arc<Interface>, request: &Packet, ip_header: &Ipv4Header) {
    let echo_len = ip_header
        .payload_len()
        .saturating_sub(ICMP_HEADER_LEN);

    let descriptor = PacketDescriptor {
        payload_size: echo_len,
        target_ip: ip_header.src,
        icmp_type: ICMP_TYPE_ECHO_REPLY,
        code: 0,
    };

    let mut reply = match kernel_prepare_packet(interface, &descriptor) {
        Ok(reply) => reply,
        Err(e) => {
            klog!(Error, "icmp: failed to prepare echo reply: {:?}", e);
            return;
        }
    };

    // Identifier, sequence number and echo data are echoed verbatim.
    let start = request.tag(2) + ICMP_FIXED_LEN;
    let end = request.tag(2) + ICMP_HEADER_LEN + echo_len;
    reply
        .payload_mut(4 + echo_len)
        .copy_from_slice(&request.frame()[start..end]);

    finalize_packet_deferred(interface, reply);
    net_stats().inc_echo_replies();
}

// ============================================================================
// Encode
// ============================================================================

/// Write type, code and a zeroed checksum; the cursor ends up at the
/// rest-of-header so the caller fills it (and any echo data) in place.
fn prepare_packet(packet: &mut Packet, descriptor: &PacketDescriptor) {
    packet.set_tag(2, packet.index);
    packet.append(&[descriptor.icmp_type, descriptor.code, 0, 0]);
}

/// Prepare a kernel-originated ICMP message.
pub fn kernel_prepare_packet(
    interface: &Arc<Interface>,
    descriptor: &PacketDescriptor,
) -> Result<Packet, SocketError> {
    let desc = ipv4::PacketDescriptor {
        payload_size: ICMP_HEADER_LEN + descriptor.payload_size,
        target_ip: descriptor.target_ip,
        protocol: PROTO_ICMP,
    };
    let mut packet = ipv4::kernel_prepare_packet(interface, &desc)?;
    prepare_packet(&mut packet, descriptor);
    Ok(packet)
}

/// Prepare an ICMP message carrying user payload (raw ICMP sockets).
pub fn user_prepare_packet(
    _socket: &Arc<Socket>,
    descriptor: &PacketDescriptor,
) -> Result<Packet, SocketError> {
    let interface = crate::interface::select_interface(descriptor.target_ip)
        .ok_or(SocketError::NoRoute)?;
    let desc = ipv4::PacketDescriptor {
        payload_size: ICMP_HEADER_LEN + descriptor.payload_size,
        target_ip: descriptor.target_ip,
        protocol: PROTO_ICMP,
    };
    let mut packet = ipv4::user_prepare_packet(&interface, &desc)?;
    prepare_packet(&mut packet, descriptor);
    Ok(packet)
}

/// Rewind to the header and fill in the checksum over header + data.
fn finalize_checksum(packet: &mut Packet) {
    packet.rewind(ICMP_FIXED_LEN);
    let offset = packet.tag(2);
    debug_assert_eq!(offset, packet.index);

    // Segment length comes from the IPv4 total length already in place.
    // The IPv4 checksum is not computed yet, so this read is unchecked.
    let ip_header = Ipv4Header::parse_unchecked(packet.at(packet.tag(1)))
        .expect("finalize on a packet this layer prepared");
    let segment_len = ip_header.payload_len();

    packet.write_at(offset + 2, &[0, 0]);
    let sum = checksum::add_bytes(0, &packet.frame()[offset..offset + segment_len]);
    packet.write_at(offset + 2, &checksum::finalize(sum).to_be_bytes());
}

/// Finalize a prepared ICMP message and transmit it (task context).
pub fn finalize_packet(interface: &Arc<Interface>, packet: &mut Packet) -> Result<(), SocketError> {
    finalize_checksum(packet);
    ipv4::finalize_packet(interface, packet)
}

/// Finalize a prepared ICMP message onto the deferred-transmit queue
/// (interrupt-safe).
fn finalize_packet_deferred(interface: &Arc<Interface>, mut packet: Packet) {
    finalize_checksum(&mut packet);
    ipv4::finalize_packet_deferred(interface, packet);
}

// ============================================================================
// Tests
// ============================================================================
