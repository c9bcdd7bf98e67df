//! TCP layer.
//!
//! # Header Format (RFC 793)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Offs  | Resv  |N|C|E|U|A|P|R|S|F|        Window               |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The data offset and every flag live in one 16-bit word: offset in bits
//! 15..12, then three reserved bits, NS, CWR, ECE, URG, ACK, PSH, RST, SYN
//! and FIN in bit 0.  No options are emitted (data offset is always 5) and
//! a fixed 1024-byte receive window is advertised.
//!
//! # Egress
//!
//! Two finalize paths exist.  *Direct* finalize checksums and transmits,
//! fire-and-forget; it serves the pure ACKs.  *Reliable* finalize
//! additionally flags the connection as listening, then retransmits up to
//! [`TCP_MAX_TRIES`] times, each attempt waiting up to [`TCP_TIMEOUT_MS`]
//! on the connection's queue for a segment whose flags acknowledge the
//! operation (SYN wants SYN+ACK, everything else wants ACK).  It serves
//! SYN, data and FIN segments.
//!
//! # Ingress
//!
//! Dispatch runs in interrupt context and never suspends.  A matched
//! connection gets its next sequence/acknowledgement numbers updated, a
//! copy queued for any listening sender, and, for PSH segments, a copy
//! into the socket's ready-queue.  PSH segments are acknowledged with an
//! unsolicited ACK routed through the deferred-transmit queue, never the
//! driver directly.

use alloc::sync::{Arc, Weak};
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use spin::Mutex;

use conc::WaitQueue;

use crate::checksum;
use crate::connection::{ConnTable, Endpoints};
use crate::interface::{select_interface, Interface};
use crate::ipv4::{self, Ipv4Addr, Ipv4Header, PROTO_TCP};
use crate::packet::Packet;
use crate::socket::{Socket, SocketError};
use crate::stack::{net_stats, DropReason, ProcessResult};

// ============================================================================
// Constants
// ============================================================================

/// TCP header length in bytes (no options are emitted).
pub const TCP_HEADER_LEN: usize = 20;

/// Wait per transmit attempt for an acknowledgement, in milliseconds.
pub const TCP_TIMEOUT_MS: u64 = 1000;

/// Transmit attempts before a reliable operation gives up.
pub const TCP_MAX_TRIES: usize = 5;

/// Advertised receive window.
pub const TCP_WINDOW_SIZE: u16 = 1024;

/// Packets buffered on a connection for its acknowledgement listener.
pub const TCP_CONN_QUEUE: usize = 8;

/// FIN flag.
pub const TCP_FLAG_FIN: u16 = 1 << 0;
/// SYN flag.
pub const TCP_FLAG_SYN: u16 = 1 << 1;
/// RST flag.
pub const TCP_FLAG_RST: u16 = 1 << 2;
/// PSH flag.
pub const TCP_FLAG_PSH: u16 = 1 << 3;
/// ACK flag.
pub const TCP_FLAG_ACK: u16 = 1 << 4;
/// URG flag.
pub const TCP_FLAG_URG: u16 = 1 << 5;
/// ECE flag.
pub const TCP_FLAG_ECE: u16 = 1 << 6;
/// CWR flag.
pub const TCP_FLAG_CWR: u16 = 1 << 7;
/// NS flag.
pub const TCP_FLAG_NS: u16 = 1 << 8;

/// Bit position of the 4-bit data offset within the flags word.
pub const TCP_DATA_OFFSET_SHIFT: u32 = 12;

/// Flags word for an optionless segment: data offset 5, no flags set.
pub fn default_flags() -> u16 {
    ((TCP_HEADER_LEN / 4) as u16) << TCP_DATA_OFFSET_SHIFT
}

/// Header length in bytes encoded in a flags word.
pub fn header_len_from_flags(flags: u16) -> usize {
    (((flags >> TCP_DATA_OFFSET_SHIFT) & 0xF) as usize) * 4
}

/// Local port counter; pre-incremented, so the first port handed out is 1024.
static LOCAL_PORT: AtomicU16 = AtomicU16::new(1023);

fn allocate_local_port() -> u16 {
    LOCAL_PORT.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from TCP segment validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Segment shorter than its header.
    Truncated,
    /// Checksum does not verify.
    BadChecksum,
}

// ============================================================================
// Header
// ============================================================================

/// Parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgement number.
    pub ack: u32,
    /// Data offset + flags word.
    pub flags: u16,
    /// Advertised window.
    pub window: u16,
    /// Checksum as received.
    pub checksum: u16,
    /// Urgent pointer.
    pub urgent: u16,
}

impl TcpHeader {
    /// Parse a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<TcpHeader, TcpError> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(TcpError::Truncated);
        }
        let header = TcpHeader {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u16::from_be_bytes([buf[12], buf[13]]),
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            urgent: u16::from_be_bytes([buf[18], buf[19]]),
        };
        if header.header_len() < TCP_HEADER_LEN || header.header_len() > buf.len() {
            return Err(TcpError::Truncated);
        }
        Ok(header)
    }

    /// Serialize the header (no options).
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut bytes = [0u8; TCP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack.to_be_bytes());
        bytes[12..14].copy_from_slice(&self.flags.to_be_bytes());
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        bytes
    }

    /// Header length in bytes from the data offset field.
    #[inline]
    pub fn header_len(&self) -> usize {
        header_len_from_flags(self.flags)
    }

    /// SYN flag set.
    #[inline]
    pub fn has_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    /// ACK flag set.
    #[inline]
    pub fn has_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    /// PSH flag set.
    #[inline]
    pub fn has_psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }

    /// FIN flag set.
    #[inline]
    pub fn has_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Mutable per-connection counters.
struct TcpState {
    /// Next sequence number to send.
    seq_number: u32,
    /// Next acknowledgement number to send.
    ack_number: u32,
    /// Whether the three-way handshake completed.
    connected: bool,
}

/// Transport state for one TCP connection.
///
/// At most one sender at a time runs the reliable finalize path for a
/// connection; `listening` is true exactly while that sender is inside it.
pub struct TcpConnection {
    /// Our port.
    pub local_port: u16,
    /// The server's port.
    pub remote_port: u16,
    /// The server's address.
    pub remote_addr: Ipv4Addr,
    /// Sequence counters and the connected flag.
    state: Mutex<TcpState>,
    /// A sender is waiting on `packets` for an acknowledgement.
    listening: AtomicBool,
    /// Copies of recently received segments for the listening sender.
    packets: Mutex<VecDeque<Packet>>,
    /// Waiter for `packets`.
    pub waiter: WaitQueue,
    /// The owning socket.
    socket: Mutex<Option<Weak<Socket>>>,
}

impl TcpConnection {
    fn new(local_port: u16, remote_port: u16, remote_addr: Ipv4Addr) -> Self {
        TcpConnection {
            local_port,
            remote_port,
            remote_addr,
            state: Mutex::new(TcpState {
                seq_number: 0,
                ack_number: 0,
                connected: false,
            }),
            listening: AtomicBool::new(false),
            packets: Mutex::new(VecDeque::new()),
            waiter: WaitQueue::new(),
            socket: Mutex::new(None),
        }
    }

    /// Whether the handshake completed and no disconnect has run.
    pub fn connected(&self) -> bool {
        self.state.lock().connected
    }

    fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Current (sequence, acknowledgement) counters.
    pub fn seq_ack(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.seq_number, state.ack_number)
    }

    fn set_seq_ack(&self, seq: u32, ack: u32) {
        let mut state = self.state.lock();
        state.seq_number = seq;
        state.ack_number = ack;
    }

    fn socket(&self) -> Option<Arc<Socket>> {
        self.socket.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Queue a copy of a received segment for the listening sender.
    fn push_packet(&self, packet: Packet) {
        {
            let mut packets = self.packets.lock();
            if packets.len() >= TCP_CONN_QUEUE {
                klog!(Warn, "tcp: connection queue full, dropping segment copy");
                return;
            }
            packets.push_back(packet);
        }
        // Ingress may run in interrupt context.
        self.waiter.notify_one_irq();
    }

    fn pop_packet(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }
}

impl Endpoints for TcpConnection {
    fn local_port(&self) -> u16 {
        self.local_port
    }
    fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

/// Active TCP connections.
static CONNECTIONS: ConnTable<TcpConnection> = ConnTable::new();

fn connection_of(socket: &Socket) -> Result<Arc<TcpConnection>, SocketError> {
    socket
        .connection()
        .and_then(|handle| CONNECTIONS.get(handle))
        .ok_or(SocketError::NotConnected)
}

// ============================================================================
// Segment Accessors
// ============================================================================

/// Payload length of a decoded segment: IP total length minus both headers.
pub fn tcp_payload_len(packet: &Packet) -> usize {
    let Some(ip_header) = Ipv4Header::parse_unchecked(packet.at(packet.tag(1))) else {
        return 0;
    };
    let offset = packet.tag(2);
    let flags = u16::from_be_bytes([packet.frame()[offset + 12], packet.frame()[offset + 13]]);
    ip_header
        .payload_len()
        .saturating_sub(header_len_from_flags(flags))
}

/// Verify the checksum of a decoded segment (cursor at the TCP header).
fn verify_checksum(packet: &Packet) -> bool {
    let Some(ip_header) = Ipv4Header::parse_unchecked(packet.at(packet.tag(1))) else {
        return false;
    };
    let offset = packet.tag(2);
    let segment_len = ip_header.payload_len();
    if offset + segment_len > packet.capacity() {
        return false;
    }
    let sum = checksum::add_bytes(
        checksum::pseudo_header_sum(ip_header.src, ip_header.dst, PROTO_TCP, segment_len as u16),
        &packet.frame()[offset..offset + segment_len],
    );
    checksum::finalize(sum) == 0
}

// ============================================================================
// Decode
// ============================================================================

/// Decode a TCP segment.
///
/// Must only be called from the IPv4 layer; the cursor sits at the TCP
/// header.  Never suspends; the unsolicited ACK for PSH segments goes
/// through the deferred-transmit queue.
pub fn decode(interface: &Arc<Interface>, packet: &mut Packet) -> ProcessResult {
    packet.set_tag(2, packet.index);

    let header = match TcpHeader::parse(packet.at(packet.index)) {
        Ok(header) => header,
        Err(e) => {
            klog!(Debug, "tcp: dropping short segment");
            return ProcessResult::Dropped(DropReason::Tcp(e));
        }
    };

    if !verify_checksum(packet) {
        klog!(Debug, "tcp: dropping segment with bad checksum");
        return ProcessResult::Dropped(DropReason::Tcp(TcpError::BadChecksum));
    }
    net_stats().inc_tcp_rx();

    klog!(Trace, "tcp: source port {}", header.src_port);
    klog!(Trace, "tcp: target port {}", header.dst_port);
    klog!(Trace, "tcp: seq number {}", header.seq);
    klog!(Trace, "tcp: ack number {}", header.ack);

    let payload_len = tcp_payload_len(packet) as u32;
    let next_seq = header.ack;
    let next_ack = header.seq.wrapping_add(payload_len);

    match CONNECTIONS.lookup(header.src_port, header.dst_port) {
        Some(connection) => {
            // Update the connection counters first: a listening sender reads
            // them only after consuming the copy queued below.
            connection.set_seq_ack(next_seq, next_ack);

            // Feed the acknowledgement listener.
            if connection.listening.load(Ordering::Acquire) {
                connection.push_packet(packet.clone());
            }

            // Feed the socket reader.
            if header.has_psh() {
                if let Some(socket) = connection.socket() {
                    packet.advance(header.header_len());
                    socket.deliver(packet.clone());
                }
            }
        }
        None => {
            klog!(Debug, "tcp: received segment for which there is no connection");
        }
    }

    // Acknowledge pushed data, connection or not.  This ACK is unsolicited:
    // it bypasses the acknowledgement-wait path entirely.
    if header.has_psh() {
        send_unsolicited_ack(interface, packet, &header, next_seq, next_ack);
    }

    ProcessResult::Handled
}

/// Build a bare ACK for a PSH segment and queue it for transmission.
fn send_unsolicited_ack(
    interface: &Arc<Interface>,
    packet: &Packet,
    header: &TcpHeader,
    seq: u32,
    ack: u32,
) {
    // validated during decode
    let Some(ip_header) = Ipv4Header::parse_unchecked(packet.at(packet.tag(1))) else {
        return;
    };

    let desc = ipv4::PacketDescriptor {
        payload_size: TCP_HEADER_LEN,
        target_ip: ip_header.src,
        protocol: PROTO_TCP,
    };
    let mut reply = match ipv4::kernel_prepare_packet(interface, &desc) {
        Ok(reply) => reply,
        Err(e) => {
            klog!(Error, "tcp: impossible to prepare packet for ACK: {:?}", e);
            return;
        }
    };
    prepare_packet(
        &mut reply,
        header.dst_port,
        header.src_port,
        seq,
        ack,
        default_flags() | TCP_FLAG_ACK,
    );
    finalize_packet_deferred(interface, reply);
    net_stats().inc_unsolicited_acks();
}

// ============================================================================
// Encode
// ============================================================================

/// Parameters for preparing a data segment.
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    /// Bytes of segment payload.
    pub payload_size: usize,
}

fn prepare_packet(packet: &mut Packet, source: u16, target: u16, seq: u32, ack: u32, flags: u16) {
    packet.set_tag(2, packet.index);
    let header = TcpHeader {
        src_port: source,
        dst_port: target,
        seq,
        ack,
        flags,
        window: TCP_WINDOW_SIZE,
        checksum: 0,
        urgent: 0,
    };
    packet.append(&header.to_bytes());
}

/// Prepare a kernel-originated segment for `connection` with its current
/// sequence numbers and the given flags.
pub fn kernel_prepare_packet(
    interface: &Arc<Interface>,
    connection: &TcpConnection,
    payload_size: usize,
    flags: u16,
) -> Result<Packet, SocketError> {
    let desc = ipv4::PacketDescriptor {
        payload_size: TCP_HEADER_LEN + payload_size,
        target_ip: connection.remote_addr,
        protocol: PROTO_TCP,
    };
    let mut packet = ipv4::kernel_prepare_packet(interface, &desc)?;
    let (seq, ack) = connection.seq_ack();
    prepare_packet(
        &mut packet,
        connection.local_port,
        connection.remote_port,
        seq,
        ack,
        flags,
    );
    Ok(packet)
}

/// Prepare a PSH+ACK data segment carrying user payload.
pub fn user_prepare_packet(
    socket: &Arc<Socket>,
    descriptor: &PacketDescriptor,
) -> Result<Packet, SocketError> {
    let connection = connection_of(socket)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    let interface = select_interface(connection.remote_addr).ok_or(SocketError::NoRoute)?;
    let desc = ipv4::PacketDescriptor {
        payload_size: TCP_HEADER_LEN + descriptor.payload_size,
        target_ip: connection.remote_addr,
        protocol: PROTO_TCP,
    };
    let mut packet = ipv4::user_prepare_packet(&interface, &desc)?;
    let (seq, ack) = connection.seq_ack();
    prepare_packet(
        &mut packet,
        connection.local_port,
        connection.remote_port,
        seq,
        ack,
        default_flags() | TCP_FLAG_PSH | TCP_FLAG_ACK,
    );
    Ok(packet)
}

/// Rewind past the header and fill in the checksum (pseudo-header included,
/// zero-avoidance applied).
fn finalize_checksum(packet: &mut Packet) {
    let offset = packet.tag(2);
    let flags = u16::from_be_bytes([packet.frame()[offset + 12], packet.frame()[offset + 13]]);
    packet.rewind(header_len_from_flags(flags));
    debug_assert_eq!(offset, packet.index);

    // The IPv4 checksum is not computed yet, so this read is unchecked.
    let ip_header = Ipv4Header::parse_unchecked(packet.at(packet.tag(1)))
        .expect("finalize on a packet this layer prepared");
    let segment_len = ip_header.payload_len();

    packet.write_at(offset + 16, &[0, 0]);
    let sum = checksum::add_bytes(
        checksum::pseudo_header_sum(ip_header.src, ip_header.dst, PROTO_TCP, segment_len as u16),
        &packet.frame()[offset..offset + segment_len],
    );
    packet.write_at(offset + 16, &checksum::finalize_nz(sum).to_be_bytes());
}

/// Direct finalize: checksum and transmit, fire-and-forget (task context).
pub fn finalize_packet_direct(
    interface: &Arc<Interface>,
    packet: &mut Packet,
) -> Result<(), SocketError> {
    finalize_checksum(packet);
    ipv4::finalize_packet(interface, packet)
}

/// Direct finalize onto the deferred-transmit queue (interrupt-safe).
fn finalize_packet_deferred(interface: &Arc<Interface>, mut packet: Packet) {
    finalize_checksum(&mut packet);
    ipv4::finalize_packet_deferred(interface, packet);
}

/// Reliable finalize: transmit and wait for the peer's acknowledgement,
/// retrying up to [`TCP_MAX_TRIES`] times.
///
/// A SYN expects SYN+ACK; anything else accepts any segment with ACK set.
/// On success the connection's counters advance to the acknowledged
/// position (`seq = received ack`, `ack = received seq + 1`).
pub fn finalize_packet(
    interface: &Arc<Interface>,
    connection: &Arc<TcpConnection>,
    packet: &mut Packet,
) -> Result<(), SocketError> {
    let sent_flags = {
        let offset = packet.tag(2);
        u16::from_be_bytes([packet.frame()[offset + 12], packet.frame()[offset + 13]])
    };

    finalize_checksum(packet);
    ipv4::finalize_checksum(packet);

    connection.listening.store(true, Ordering::Release);

    let mut received: Option<(u32, u32)> = None;

    'attempts: for attempt in 0..TCP_MAX_TRIES {
        if let Err(e) = interface.transmit(packet.frame()) {
            connection.listening.store(false, Ordering::Release);
            return Err(SocketError::Tx(e));
        }
        if attempt > 0 {
            net_stats().inc_tcp_retransmits();
        }

        let start = conc::now_ms();
        loop {
            let waited = conc::now_ms().saturating_sub(start);
            if waited >= TCP_TIMEOUT_MS {
                break;
            }
            if !connection.waiter.wait_for(TCP_TIMEOUT_MS - waited) {
                break;
            }
            while let Some(reply) = connection.pop_packet() {
                let header = match TcpHeader::parse(reply.at(reply.index)) {
                    Ok(header) => header,
                    Err(_) => continue,
                };
                let acknowledged = if sent_flags & TCP_FLAG_SYN != 0 {
                    header.has_syn() && header.has_ack()
                } else {
                    header.has_ack()
                };
                if acknowledged {
                    klog!(Trace, "tcp: received ACK");
                    received = Some((header.seq, header.ack));
                    break 'attempts;
                }
                klog!(Trace, "tcp: received unrelated answer");
            }
        }
    }

    connection.listening.store(false, Ordering::Release);

    match received {
        Some((seq, ack)) => {
            // The +1 matches the handshake arithmetic: SYN and FIN occupy
            // one sequence slot each.
            connection.set_seq_ack(ack, seq.wrapping_add(1));
            Ok(())
        }
        None => Err(SocketError::TcpFailure),
    }
}

// ============================================================================
// Connect
// ============================================================================

/// Three-way connect to `server:server_port`.
///
/// Returns the allocated local port once the handshake completed.
pub fn connect(
    socket: &Arc<Socket>,
    interface: &Arc<Interface>,
    server_port: u16,
    server: Ipv4Addr,
) -> Result<u16, SocketError> {
    let connection = Arc::new(TcpConnection::new(
        allocate_local_port(),
        server_port,
        server,
    ));
    *connection.socket.lock() = Some(Arc::downgrade(socket));

    let handle = CONNECTIONS.insert(connection.clone());
    socket.set_connection(Some(handle));

    let teardown = |e: SocketError| {
        socket.set_connection(None);
        CONNECTIONS.remove(handle);
        e
    };

    // SYN, acknowledged by the reliable path (SYN expects SYN+ACK).
    let mut packet = kernel_prepare_packet(interface, &connection, 0, default_flags() | TCP_FLAG_SYN)
        .map_err(teardown)?;
    klog!(Trace, "tcp: send SYN");
    finalize_packet(interface, &connection, &mut packet).map_err(teardown)?;

    // The SYN+ACK advanced our counters; all that remains is the bare ACK.
    let mut ack = kernel_prepare_packet(interface, &connection, 0, default_flags() | TCP_FLAG_ACK)
        .map_err(teardown)?;
    klog!(Trace, "tcp: send ACK");
    finalize_packet_direct(interface, &mut ack).map_err(teardown)?;

    connection.set_connected(true);

    Ok(connection.local_port)
}

// ============================================================================
// Disconnect
// ============================================================================

/// Four-way disconnect.
///
/// Sends FIN+ACK and listens for either the server's combined FIN+ACK or a
/// bare ACK followed by its FIN+ACK; both end with our terminal ACK and the
/// connection's removal.  This loop dispatches on two acceptable flag
/// patterns, which is why it drives the direct finalize path itself instead
/// of using the reliable one.
pub fn disconnect(socket: &Arc<Socket>) -> Result<(), SocketError> {
    klog!(Trace, "tcp: disconnect");

    let handle = socket.connection().ok_or(SocketError::NotConnected)?;
    let connection = CONNECTIONS.get(handle).ok_or(SocketError::NotConnected)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    let interface = select_interface(connection.remote_addr).ok_or(SocketError::NoRoute)?;

    let mut packet =
        kernel_prepare_packet(&interface, &connection, 0, default_flags() | TCP_FLAG_FIN | TCP_FLAG_ACK)?;

    // Finalize once; every retry retransmits the same frame.
    finalize_checksum(&mut packet);
    ipv4::finalize_checksum(&mut packet);

    connection.listening.store(true, Ordering::Release);
    klog!(Trace, "tcp: send FIN/ACK");

    let mut received_ack_only = false;
    let mut received: Option<(u32, u32)> = None;

    'attempts: for _ in 0..TCP_MAX_TRIES {
        if let Err(e) = interface.transmit(packet.frame()) {
            connection.listening.store(false, Ordering::Release);
            return Err(SocketError::Tx(e));
        }

        let start = conc::now_ms();
        loop {
            let waited = conc::now_ms().saturating_sub(start);
            if waited >= TCP_TIMEOUT_MS {
                break;
            }
            if !connection.waiter.wait_for(TCP_TIMEOUT_MS - waited) {
                break;
            }
            while let Some(reply) = connection.pop_packet() {
                let header = match TcpHeader::parse(reply.at(reply.index)) {
                    Ok(header) => header,
                    Err(_) => continue,
                };
                if header.has_fin() && header.has_ack() {
                    received = Some((header.seq, header.ack));
                    break 'attempts;
                }
                if header.has_ack() {
                    received_ack_only = true;
                    received = Some((header.seq, header.ack));
                    break 'attempts;
                }
            }
        }
    }

    let Some((seq, ack)) = received else {
        connection.listening.store(false, Ordering::Release);
        return Err(SocketError::TcpFailure);
    };
    connection.set_seq_ack(ack, seq.wrapping_add(1));

    // A bare ACK means the server will FIN separately: wait for it.
    if received_ack_only {
        klog!(Trace, "tcp: received ACK, waiting for FIN/ACK");

        let mut fin_received: Option<(u32, u32)> = None;
        let start = conc::now_ms();
        loop {
            let waited = conc::now_ms().saturating_sub(start);
            if waited >= TCP_TIMEOUT_MS {
                break;
            }
            match connection.pop_packet() {
                Some(reply) => {
                    let header = match TcpHeader::parse(reply.at(reply.index)) {
                        Ok(header) => header,
                        Err(_) => continue,
                    };
                    if header.has_fin() && header.has_ack() {
                        fin_received = Some((header.seq, header.ack));
                        break;
                    }
                }
                None => {
                    if !connection.waiter.wait_for(TCP_TIMEOUT_MS - waited) {
                        break;
                    }
                }
            }
        }

        let Some((seq, ack)) = fin_received else {
            connection.listening.store(false, Ordering::Release);
            return Err(SocketError::TcpFailure);
        };
        connection.set_seq_ack(ack, seq.wrapping_add(1));
        klog!(Trace, "tcp: received FIN/ACK, sending ACK");
    } else {
        klog!(Trace, "tcp: received FIN/ACK directly, sending ACK");
    }

    connection.listening.store(false, Ordering::Release);

    // Terminal ACK for the server's FIN.
    let mut ack_packet =
        kernel_prepare_packet(&interface, &connection, 0, default_flags() | TCP_FLAG_ACK)?;
    klog!(Trace, "tcp: send ACK");
    finalize_packet_direct(&interface, &mut ack_packet)?;

    connection.set_connected(false);
    socket.set_connection(None);
    CONNECTIONS.remove(handle);

    Ok(())
}

// ============================================================================
// Send / Receive
// ============================================================================

/// Send `data` as one PSH+ACK segment, waiting for the acknowledgement.
pub fn send(socket: &Arc<Socket>, data: &[u8]) -> Result<(), SocketError> {
    let connection = connection_of(socket)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    klog!(Trace, "tcp: send {} bytes", data.len());

    let descriptor = PacketDescriptor {
        payload_size: data.len(),
    };
    let mut packet = user_prepare_packet(socket, &descriptor)?;
    packet.payload_mut(data.len()).copy_from_slice(data);

    let interface = select_interface(connection.remote_addr).ok_or(SocketError::NoRoute)?;
    finalize_packet(&interface, &connection, &mut packet)
}

/// Copy a queued segment's payload out to the caller.
fn read_stream_payload(packet: &Packet, buf: &mut [u8]) -> Result<usize, SocketError> {
    let payload_len = tcp_payload_len(packet);
    if payload_len > buf.len() {
        // The packet copy is discarded with the error.
        return Err(SocketError::BufferTooSmall);
    }
    let available = core::cmp::min(payload_len, packet.remaining());
    buf[..available].copy_from_slice(&packet.frame()[packet.index..packet.index + available]);
    Ok(payload_len)
}

/// Receive one segment's payload, blocking until data arrives.
pub fn receive(socket: &Arc<Socket>, buf: &mut [u8]) -> Result<usize, SocketError> {
    let connection = connection_of(socket)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    loop {
        if let Some(packet) = socket.pop_ready() {
            return read_stream_payload(&packet, buf);
        }
        if socket.waiter.is_closed() {
            return Err(SocketError::NotConnected);
        }
        socket.waiter.wait();
    }
}

/// Receive one segment's payload, blocking for at most `ms` milliseconds.
///
/// `ms == 0` is a non-blocking poll.
pub fn receive_timeout(
    socket: &Arc<Socket>,
    buf: &mut [u8],
    ms: u64,
) -> Result<usize, SocketError> {
    let connection = connection_of(socket)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    let start = conc::now_ms();
    loop {
        if let Some(packet) = socket.pop_ready() {
            return read_stream_payload(&packet, buf);
        }
        if ms == 0 {
            return Err(SocketError::TimedOut);
        }
        let waited = conc::now_ms().saturating_sub(start);
        if waited >= ms {
            return Err(SocketError::TimedOut);
        }
        if !socket.waiter.wait_for(ms - waited) {
            return match socket.pop_ready() {
                Some(packet) => read_stream_payload(&packet, buf),
                None => Err(SocketError::TimedOut),
            };
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
