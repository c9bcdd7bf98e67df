//! Stack entry points and the deferred-transmit worker.
//!
//! # Ingress
//!
//! The driver's receive path calls [`on_frame_received`], from interrupt
//! context in the worst case.  Decode walks the layers without ever
//! suspending, and without ever calling back into a driver: any reply a
//! decode handler wants to send (ICMP echo replies, TCP unsolicited ACKs)
//! is finalized onto the deferred-transmit queue instead.
//!
//! # Deferred Transmit
//!
//! [`process_deferred`] drains that queue from task context; the network
//! worker task runs it after each ingress batch.  Keeping the driver out of
//! the interrupt path is what makes the decode handlers reentrancy-safe.
//!
//! ```text
//!   ISR: driver --> on_frame_received --> decode layers --+--> queues/waiters
//!                                                         |
//!                                                         +--> DEFERRED_TX
//!   task: net worker --> process_deferred --> interface.transmit
//! ```

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::ethernet;
use crate::icmp::IcmpError;
use crate::interface::{interface_by_index, Interface};
use crate::ipv4::Ipv4Error;
use crate::packet::{Packet, PacketOrigin};
use crate::tcp::TcpError;
use crate::udp::UdpError;

// ============================================================================
// Results
// ============================================================================

/// Outcome of processing one ingress frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// The frame was consumed (delivered, answered, or deliberately ignored).
    Handled,
    /// The frame was dropped; nothing upstream is waiting, so the reason is
    /// only logged and counted.
    Dropped(DropReason),
}

/// Why an ingress frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No interface is registered under the given index.
    NoInterface,
    /// Ethernet header parsing failed.
    EthParse,
    /// EtherType we do not handle.
    UnsupportedEtherType,
    /// IPv4 validation failed.
    Ipv4(Ipv4Error),
    /// IP protocol we do not handle.
    UnsupportedProtocol,
    /// ICMP validation failed.
    Icmp(IcmpError),
    /// UDP validation failed.
    Udp(UdpError),
    /// TCP validation failed.
    Tcp(TcpError),
    /// No transport connection matches the segment.
    NoConnection,
}

// ============================================================================
// Statistics
// ============================================================================

/// Network stack statistics.
#[derive(Debug)]
pub struct NetStats {
    /// Frames handed to the stack.
    pub rx_frames: AtomicU64,
    /// Frames dropped during decode.
    pub rx_dropped: AtomicU64,
    /// Valid IPv4 packets.
    pub ipv4_rx: AtomicU64,
    /// ICMP messages received.
    pub icmp_rx: AtomicU64,
    /// UDP datagrams received.
    pub udp_rx: AtomicU64,
    /// TCP segments received.
    pub tcp_rx: AtomicU64,
    /// Packets dropped because a socket ready-queue was full.
    pub rx_queue_full: AtomicU64,
    /// Frames handed to drivers.
    pub tx_frames: AtomicU64,
    /// Driver transmit failures.
    pub tx_errors: AtomicU64,
    /// Packets finalized onto the deferred-transmit queue.
    pub tx_deferred: AtomicU64,
    /// Deferred packets dropped because the queue was full.
    pub tx_deferred_dropped: AtomicU64,
    /// Kernel-originated packets finalized.
    pub tx_kernel_packets: AtomicU64,
    /// User-originated packets finalized.
    pub tx_user_packets: AtomicU64,
    /// ICMP echo replies generated.
    pub echo_replies: AtomicU64,
    /// Unsolicited ACKs generated for PSH segments.
    pub unsolicited_acks: AtomicU64,
    /// TCP segments retransmitted by the reliable path.
    pub tcp_retransmits: AtomicU64,
    /// Frames with an EtherType or protocol we do not handle.
    pub unsupported_proto: AtomicU64,
}

impl NetStats {
    /// Zeroed statistics block.
    pub const fn new() -> Self {
        NetStats {
            rx_frames: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            ipv4_rx: AtomicU64::new(0),
            icmp_rx: AtomicU64::new(0),
            udp_rx: AtomicU64::new(0),
            tcp_rx: AtomicU64::new(0),
            rx_queue_full: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            tx_errors: AtomicU64::new(0),
            tx_deferred: AtomicU64::new(0),
            tx_deferred_dropped: AtomicU64::new(0),
            tx_kernel_packets: AtomicU64::new(0),
            tx_user_packets: AtomicU64::new(0),
            echo_replies: AtomicU64::new(0),
            unsolicited_acks: AtomicU64::new(0),
            tcp_retransmits: AtomicU64::new(0),
            unsupported_proto: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc_rx_frames(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_ipv4_rx(&self) {
        self.ipv4_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_icmp_rx(&self) {
        self.icmp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_udp_rx(&self) {
        self.udp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_rx(&self) {
        self.tcp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_rx_queue_full(&self) {
        self.rx_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tx_frames(&self) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tx_errors(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_echo_replies(&self) {
        self.echo_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_unsolicited_acks(&self) {
        self.unsolicited_acks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_retransmits(&self) {
        self.tcp_retransmits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_unsupported_proto(&self) {
        self.unsupported_proto.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_tx_origin(&self, origin: PacketOrigin) {
        match origin {
            PacketOrigin::Kernel => self.tx_kernel_packets.fetch_add(1, Ordering::Relaxed),
            PacketOrigin::User => self.tx_user_packets.fetch_add(1, Ordering::Relaxed),
        };
    }
}

static NET_STATS: NetStats = NetStats::new();

/// The global statistics block.
pub fn net_stats() -> &'static NetStats {
    &NET_STATS
}

// ============================================================================
// Deferred Transmit Queue
// ============================================================================

/// Bound on queued deferred transmissions.
pub const MAX_DEFERRED_TX: usize = 64;

/// Finalized packets awaiting transmission from task context, paired with
/// their interface index.
static DEFERRED_TX: Mutex<VecDeque<(usize, Packet)>> = Mutex::new(VecDeque::new());

/// Queue a finalized packet for transmission by the worker.
///
/// Interrupt-safe: takes only the queue's spin lock, which no task-context
/// holder sleeps under.
pub(crate) fn defer_transmit(interface: &Arc<Interface>, packet: Packet) {
    let mut queue = DEFERRED_TX.lock();
    if queue.len() >= MAX_DEFERRED_TX {
        klog!(Warn, "net: deferred transmit queue full, dropping packet");
        net_stats().tx_deferred_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    queue.push_back((interface.index, packet));
    drop(queue);
    net_stats().tx_deferred.fetch_add(1, Ordering::Relaxed);
}

/// Drain the deferred-transmit queue, handing each packet to its interface.
///
/// Task context only.  Returns the number of packets transmitted.
pub fn process_deferred() -> usize {
    let mut transmitted = 0;
    loop {
        // Pop one at a time: the lock must not be held across the driver.
        let entry = DEFERRED_TX.lock().pop_front();
        let Some((index, packet)) = entry else {
            break;
        };
        match interface_by_index(index) {
            Some(interface) => {
                if interface.transmit(packet.frame()).is_ok() {
                    transmitted += 1;
                }
            }
            None => {
                klog!(Error, "net: deferred packet for unknown interface {}", index);
            }
        }
    }
    transmitted
}

// ============================================================================
// Ingress
// ============================================================================

/// Ingress entry point: decode one received frame.
///
/// Called by the driver's receive path, possibly in interrupt context.  The
/// frame is copied into an owned packet and walked through the layered
/// decode; replies land on the deferred-transmit queue.
pub fn on_frame_received(interface_index: usize, frame: &[u8]) -> ProcessResult {
    net_stats().inc_rx_frames();

    let Some(interface) = interface_by_index(interface_index) else {
        net_stats().inc_rx_dropped();
        return ProcessResult::Dropped(DropReason::NoInterface);
    };

    let mut packet = Packet::from_frame(frame);
    let result = ethernet::decode(&interface, &mut packet);

    if let ProcessResult::Dropped(reason) = result {
        net_stats().inc_rx_dropped();
        klog!(Debug, "net: dropped frame: {:?}", reason);
    }

    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY};
    use crate::ipv4::{Ipv4Error, PROTO_ICMP};
    use crate::testutil;

    #[test]
    fn test_unknown_interface_is_dropped() {
        testutil::setup();
        assert_eq!(
            on_frame_received(usize::MAX, &[0; 64]),
            ProcessResult::Dropped(DropReason::NoInterface)
        );
    }

    #[test]
    fn test_short_frame_is_dropped() {
        let net = testutil::test_net();
        assert_eq!(
            on_frame_received(net.iface.index, &[0; 8]),
            ProcessResult::Dropped(DropReason::EthParse)
        );
    }

    #[test]
    fn test_frame_for_other_mac_is_ignored() {
        let net = testutil::test_net();
        let mut frame = net.udp_from_peer(1, 2, b"x");
        frame[0..6].copy_from_slice(&[0x02, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE]);
        // Silently consumed, nothing delivered, no reply.
        assert_eq!(net.inject(&frame), ProcessResult::Handled);
        assert_eq!(net.tx.len(), 0);
    }

    // Scenario: an echo request to the interface address produces exactly one
    // echo reply, mirroring identifier, sequence number and payload, with a
    // checksum that verifies, transmitted by the worker rather than the ISR
    // path.
    #[test]
    fn test_icmp_echo_request_reply() {
        let net = testutil::test_net();
        let frame = net.icmp_echo_from_peer(0x1234, 0x0001, b"ABCDEFGH");

        let deferred_before = net_stats().tx_deferred.load(Ordering::Relaxed);
        assert_eq!(on_frame_received(net.iface.index, &frame), ProcessResult::Handled);
        assert!(net_stats().tx_deferred.load(Ordering::Relaxed) > deferred_before);

        // Drain until our interface has seen the reply (other tests share
        // the global queue).
        for _ in 0..200 {
            process_deferred();
            if net.tx.len() >= 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let frames = net.tx.frames();
        assert_eq!(frames.len(), 1, "exactly one echo reply");

        let (ip, payload) = testutil::parse_ipv4_frame(&frames[0]).unwrap();
        assert_eq!(ip.protocol, PROTO_ICMP);
        assert_eq!(ip.src, net.local_ip);
        assert_eq!(ip.dst, net.peer_ip);

        let header = IcmpHeader::parse(payload).unwrap();
        assert_eq!(header.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(header.code, 0);
        assert_eq!(header.rest, [0x12, 0x34, 0x00, 0x01]);
        assert_eq!(&payload[8..16], b"ABCDEFGH");

        // The reply checksum verifies to zero.
        let message = &payload[..ip.payload_len()];
        assert_eq!(checksum::fold(checksum::add_bytes(0, message)), 0xFFFF);
    }

    #[test]
    fn test_echo_request_for_other_address_is_not_answered() {
        let net = testutil::test_net();
        let mut frame = net.icmp_echo_from_peer(0x77, 0x01, b"misdirected");
        // Rewrite the IP destination to a stranger and fix the checksum.
        let ip_start = 14;
        frame[ip_start + 16..ip_start + 20].copy_from_slice(&[192, 0, 2, 200]);
        frame[ip_start + 10..ip_start + 12].copy_from_slice(&[0, 0]);
        let sum = checksum::add_bytes(0, &frame[ip_start..ip_start + 20]);
        frame[ip_start + 10..ip_start + 12].copy_from_slice(&checksum::finalize(sum).to_be_bytes());

        assert_eq!(net.inject(&frame), ProcessResult::Handled);
        assert_eq!(net.tx.len(), 0);
    }

    #[test]
    fn test_ingress_counts_frames() {
        let net = testutil::test_net();
        let before = net_stats().rx_frames.load(Ordering::Relaxed);
        net.inject(&net.udp_from_peer(9, 9, b""));
        assert!(net_stats().rx_frames.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn test_ipv4_header_parse_checks_reach_stack() {
        let net = testutil::test_net();
        let mut frame = net.udp_from_peer(1000, 1001, b"abc");
        // Corrupt the IP header checksum.
        frame[14 + 10] ^= 0xA5;
        assert_eq!(
            net.inject(&frame),
            ProcessResult::Dropped(DropReason::Ipv4(Ipv4Error::BadChecksum))
        );
    }
}
