//! DNS hand-off.
//!
//! The UDP layer hands any datagram with source port 53 to this hook before
//! normal socket delivery.  Full DNS parsing belongs to the resolver; this
//! module only sanity-parses the fixed 12-byte header for diagnostics and
//! tags the layer so later consumers can find it.

use alloc::sync::Arc;

use crate::interface::Interface;
use crate::packet::Packet;

/// Fixed DNS header length.
pub const DNS_HEADER_LEN: usize = 12;

/// DNS server port.
pub const DNS_PORT: u16 = 53;

/// Parsed DNS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    /// Transaction identifier.
    pub id: u16,
    /// Flags word.
    pub flags: u16,
    /// Question count.
    pub questions: u16,
    /// Answer record count.
    pub answers: u16,
    /// Authority record count.
    pub authority: u16,
    /// Additional record count.
    pub additional: u16,
}

impl DnsHeader {
    /// Parse the fixed header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Option<DnsHeader> {
        if buf.len() < DNS_HEADER_LEN {
            return None;
        }
        let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        Some(DnsHeader {
            id: word(0),
            flags: word(2),
            questions: word(4),
            answers: word(6),
            authority: word(8),
            additional: word(10),
        })
    }
}

/// Peek at a DNS message.
///
/// The cursor sits at the DNS header (just past UDP) and is left untouched
/// so socket delivery still sees the full datagram payload.
pub fn decode(_interface: &Arc<Interface>, packet: &mut Packet) {
    packet.set_tag(3, packet.index);

    match DnsHeader::parse(packet.at(packet.index)) {
        Some(header) => {
            klog!(
                Trace,
                "dns: message id {:#06x} questions {} answers {}",
                header.id,
                header.questions,
                header.answers
            );
        }
        None => {
            klog!(Debug, "dns: short message from port 53");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let buf = [
            0xBE, 0xEF, // id
            0x81, 0x80, // flags: response, recursion
            0x00, 0x01, // one question
            0x00, 0x02, // two answers
            0x00, 0x00, 0x00, 0x00,
        ];
        let header = DnsHeader::parse(&buf).unwrap();
        assert_eq!(header.id, 0xBEEF);
        assert_eq!(header.flags, 0x8180);
        assert_eq!(header.questions, 1);
        assert_eq!(header.answers, 2);
        assert_eq!(header.authority, 0);
    }

    #[test]
    fn test_parse_short_message() {
        assert_eq!(DnsHeader::parse(&[0; 11]), None);
    }
}
