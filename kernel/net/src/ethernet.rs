//! Ethernet layer.
//!
//! Layer 0 of the pipeline: tags the frame start, filters by destination
//! MAC, and dispatches by EtherType.  On egress it allocates the packet
//! buffer sized for the whole frame and writes the 14-byte header.

use alloc::sync::Arc;

use crate::device::{MacAddress, MAC_BROADCAST};
use crate::interface::Interface;
use crate::ipv4;
use crate::packet::Packet;
use crate::socket::SocketError;
use crate::stack::{net_stats, DropReason, ProcessResult};

// ============================================================================
// Constants
// ============================================================================

/// Ethernet header size (6 dst + 6 src + 2 ethertype).
pub const ETH_HEADER_LEN: usize = 14;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType for ARP (recognized, handled elsewhere).
pub const ETHERTYPE_ARP: u16 = 0x0806;

// ============================================================================
// Errors
// ============================================================================

/// Errors from Ethernet frame parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthError {
    /// Frame shorter than the Ethernet header.
    Truncated,
}

// ============================================================================
// Header
// ============================================================================

/// Parsed Ethernet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    /// Destination MAC.
    pub dst: MacAddress,
    /// Source MAC.
    pub src: MacAddress,
    /// EtherType of the payload.
    pub ethertype: u16,
}

impl EthHeader {
    /// Parse a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<EthHeader, EthError> {
        if buf.len() < ETH_HEADER_LEN {
            return Err(EthError::Truncated);
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Ok(EthHeader {
            dst,
            src,
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
        })
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; ETH_HEADER_LEN] {
        let mut bytes = [0u8; ETH_HEADER_LEN];
        bytes[0..6].copy_from_slice(&self.dst);
        bytes[6..12].copy_from_slice(&self.src);
        bytes[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
        bytes
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Parameters the IPv4 layer passes down to request a frame.
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    /// Bytes of Ethernet payload (IPv4 header + IPv4 payload).
    pub payload_size: usize,
    /// Destination MAC address.
    pub target_mac: MacAddress,
    /// EtherType to record in the header.
    pub ethertype: u16,
}

// ============================================================================
// Decode
// ============================================================================

/// Decode an Ethernet frame.
///
/// This must only be called from the ingress entry point.  Frames addressed
/// to neither our MAC nor broadcast are dropped silently (no error counted).
pub fn decode(interface: &Arc<Interface>, packet: &mut Packet) -> ProcessResult {
    packet.set_tag(0, packet.index);

    let header = match EthHeader::parse(packet.at(packet.index)) {
        Ok(header) => header,
        Err(_) => {
            return ProcessResult::Dropped(DropReason::EthParse);
        }
    };

    if header.dst != interface.mac && header.dst != MAC_BROADCAST {
        // Stray traffic; not an error.
        return ProcessResult::Handled;
    }

    packet.advance(ETH_HEADER_LEN);

    match header.ethertype {
        ETHERTYPE_IPV4 => ipv4::decode(interface, packet),
        ethertype => {
            klog!(Trace, "ethernet: unsupported ethertype {:#06x}", ethertype);
            net_stats().inc_unsupported_proto();
            ProcessResult::Dropped(DropReason::UnsupportedEtherType)
        }
    }
}

// ============================================================================
// Encode
// ============================================================================

fn prepare_packet(packet: &mut Packet, interface: &Interface, descriptor: &PacketDescriptor) {
    packet.set_tag(0, packet.index);
    let header = EthHeader {
        dst: descriptor.target_mac,
        src: interface.mac,
        ethertype: descriptor.ethertype,
    };
    packet.append(&header.to_bytes());
}

/// Allocate a kernel frame sized for `descriptor.payload_size` bytes of
/// payload and write the Ethernet header.
pub fn kernel_prepare_packet(interface: &Arc<Interface>, descriptor: &PacketDescriptor) -> Packet {
    let mut packet = Packet::kernel(ETH_HEADER_LEN + descriptor.payload_size);
    prepare_packet(&mut packet, interface, descriptor);
    packet
}

/// Allocate a frame that will carry user payload and write the header.
pub fn user_prepare_packet(interface: &Arc<Interface>, descriptor: &PacketDescriptor) -> Packet {
    let mut packet = Packet::user(ETH_HEADER_LEN + descriptor.payload_size);
    prepare_packet(&mut packet, interface, descriptor);
    packet
}

/// Finalize a frame: hand it to the driver.
///
/// Task context only.  Interrupt-context egress goes through the deferred
/// transmit queue instead.
pub fn finalize_packet(interface: &Arc<Interface>, packet: &Packet) -> Result<(), SocketError> {
    interface.transmit(packet.frame()).map_err(SocketError::Tx)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = EthHeader {
            dst: [1, 2, 3, 4, 5, 6],
            src: [7, 8, 9, 10, 11, 12],
            ethertype: ETHERTYPE_IPV4,
        };
        let parsed = EthHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(EthHeader::parse(&[0; 13]), Err(EthError::Truncated));
    }

    #[test]
    fn test_prepare_tags_frame_start() {
        let net = crate::testutil::test_net();
        let desc = PacketDescriptor {
            payload_size: 4,
            target_mac: net.peer_mac,
            ethertype: ETHERTYPE_IPV4,
        };
        let packet = kernel_prepare_packet(&net.iface, &desc);
        assert_eq!(packet.tag(0), 0);
        assert_eq!(packet.index, ETH_HEADER_LEN);
        assert_eq!(packet.capacity(), ETH_HEADER_LEN + 4);
        let header = EthHeader::parse(packet.frame()).unwrap();
        assert_eq!(header.dst, net.peer_mac);
        assert_eq!(header.src, net.iface.mac);
    }
}
