//! UDP layer.
//!
//! # Header Format (RFC 768)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |            Length             |           Checksum            |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! UDP is stateless on ingress: the datagram is matched against the
//! connection table by `(source port, destination port)` and deep-copied
//! into the bound socket's ready-queue.  Datagrams from source port 53 are
//! additionally handed to the DNS hook before delivery.
//!
//! A "connection" here is only a bound port pair: `client_bind` allocates a
//! local port from a monotonic counter and links socket and connection,
//! `client_unbind` tears the pair down.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use spin::Mutex;

use crate::checksum;
use crate::connection::{ConnTable, Endpoints};
use crate::dns::{self, DNS_PORT};
use crate::interface::{select_interface, Interface};
use crate::ipv4::{self, Ipv4Addr, Ipv4Header, PROTO_UDP};
use crate::packet::Packet;
use crate::socket::{Socket, SocketError};
use crate::stack::{net_stats, DropReason, ProcessResult};

// ============================================================================
// Constants
// ============================================================================

/// UDP header length in bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// Local port counter; pre-incremented, so the first port handed out is 1024.
static LOCAL_PORT: AtomicU16 = AtomicU16::new(1023);

/// Allocate the next local port.
fn allocate_local_port() -> u16 {
    LOCAL_PORT.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from UDP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Datagram shorter than the UDP header.
    Truncated,
}

// ============================================================================
// Header
// ============================================================================

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Total length (header + payload).
    pub length: u16,
    /// Checksum as received.
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse a header from the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<UdpHeader, UdpError> {
        if buf.len() < UDP_HEADER_LEN {
            return Err(UdpError::Truncated);
        }
        Ok(UdpHeader {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A bound UDP port pair.
///
/// UDP needs no sequence state or listener queue; datagrams deliver straight
/// to the socket.
pub struct UdpConnection {
    /// Our port.
    pub local_port: u16,
    /// The server's port.
    pub remote_port: u16,
    /// The server's address.
    pub remote_addr: Ipv4Addr,
    /// Whether the pair is currently bound.
    connected: AtomicBool,
    /// The owning socket.
    socket: Mutex<Option<Weak<Socket>>>,
}

impl UdpConnection {
    fn new(local_port: u16, remote_port: u16, remote_addr: Ipv4Addr) -> Self {
        UdpConnection {
            local_port,
            remote_port,
            remote_addr,
            connected: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    /// Whether the pair is currently bound.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn socket(&self) -> Option<Arc<Socket>> {
        self.socket.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl Endpoints for UdpConnection {
    fn local_port(&self) -> u16 {
        self.local_port
    }
    fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

/// Active UDP connections.
static CONNECTIONS: ConnTable<UdpConnection> = ConnTable::new();

/// Resolve the socket's connection handle; an unbound socket (or a stale
/// handle) reports `NotConnected`.
fn connection_of(socket: &Socket) -> Result<Arc<UdpConnection>, SocketError> {
    socket
        .connection()
        .and_then(|handle| CONNECTIONS.get(handle))
        .ok_or(SocketError::NotConnected)
}

// ============================================================================
// Decode
// ============================================================================

/// Decode a UDP datagram and deliver it to the bound socket.
///
/// Must only be called from the IPv4 layer; the cursor sits at the UDP
/// header.  Never suspends.
pub fn decode(interface: &Arc<Interface>, packet: &mut Packet) -> ProcessResult {
    packet.set_tag(2, packet.index);

    let header = match UdpHeader::parse(packet.at(packet.index)) {
        Ok(header) => header,
        Err(e) => {
            klog!(Debug, "udp: dropping short datagram");
            return ProcessResult::Dropped(DropReason::Udp(e));
        }
    };
    net_stats().inc_udp_rx();

    klog!(Trace, "udp: source port {}", header.src_port);
    klog!(Trace, "udp: target port {}", header.dst_port);
    klog!(Trace, "udp: length {}", header.length);

    packet.advance(UDP_HEADER_LEN);

    if header.src_port == DNS_PORT {
        dns::decode(interface, packet);
    }

    match CONNECTIONS.lookup(header.src_port, header.dst_port) {
        Some(connection) => {
            if let Some(socket) = connection.socket() {
                socket.deliver(packet.clone());
            }
            ProcessResult::Handled
        }
        None => {
            klog!(Debug, "udp: received datagram for which there is no connection");
            if header.src_port == DNS_PORT {
                // The DNS hook consumed it.
                ProcessResult::Handled
            } else {
                ProcessResult::Dropped(DropReason::NoConnection)
            }
        }
    }
}

// ============================================================================
// Encode
// ============================================================================

/// Parameters for preparing a UDP datagram.
#[derive(Debug, Clone, Copy)]
pub struct PacketDescriptor {
    /// Bytes of datagram payload.
    pub payload_size: usize,
}

fn prepare_packet(packet: &mut Packet, source: u16, target: u16, payload_size: usize) {
    packet.set_tag(2, packet.index);
    let header = UdpHeader {
        src_port: source,
        dst_port: target,
        length: (UDP_HEADER_LEN + payload_size) as u16,
        checksum: 0,
    };
    packet.append(&header.to_bytes());
}

/// Prepare a datagram carrying user payload for a bound socket.
pub fn user_prepare_packet(
    socket: &Arc<Socket>,
    descriptor: &PacketDescriptor,
) -> Result<Packet, SocketError> {
    let connection = connection_of(socket)?;

    klog!(
        Trace,
        "udp: craft datagram for {}:{}",
        connection.remote_addr,
        connection.remote_port
    );

    let interface = select_interface(connection.remote_addr).ok_or(SocketError::NoRoute)?;
    let desc = ipv4::PacketDescriptor {
        payload_size: UDP_HEADER_LEN + descriptor.payload_size,
        target_ip: connection.remote_addr,
        protocol: PROTO_UDP,
    };
    let mut packet = ipv4::user_prepare_packet(&interface, &desc)?;
    prepare_packet(
        &mut packet,
        connection.local_port,
        connection.remote_port,
        descriptor.payload_size,
    );
    Ok(packet)
}

/// Compute the UDP checksum (pseudo-header + segment) with zero-avoidance.
///
/// The segment's checksum field must already be zero.
pub(crate) fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = checksum::pseudo_header_sum(src, dst, PROTO_UDP, segment.len() as u16);
    sum = checksum::add_bytes(sum, segment);
    checksum::finalize_nz(sum)
}

/// Rewind past the header, fill in the checksum, and hand down to IPv4.
pub fn finalize_packet(interface: &Arc<Interface>, packet: &mut Packet) -> Result<(), SocketError> {
    packet.rewind(UDP_HEADER_LEN);
    let offset = packet.tag(2);
    debug_assert_eq!(offset, packet.index);

    let ip_header = Ipv4Header::parse_unchecked(packet.at(packet.tag(1)))
        .expect("finalize on a packet this layer prepared");
    let length = u16::from_be_bytes([packet.frame()[offset + 4], packet.frame()[offset + 5]]);

    packet.write_at(offset + 6, &[0, 0]);
    let sum = udp_checksum(
        ip_header.src,
        ip_header.dst,
        &packet.frame()[offset..offset + length as usize],
    );
    packet.write_at(offset + 6, &sum.to_be_bytes());

    ipv4::finalize_packet(interface, packet)
}

// ============================================================================
// Bind / Unbind
// ============================================================================

/// Bind a socket to a server endpoint, allocating the local port.
///
/// Returns the allocated local port.
pub fn client_bind(
    socket: &Arc<Socket>,
    server_port: u16,
    server: Ipv4Addr,
) -> Result<u16, SocketError> {
    let connection = Arc::new(UdpConnection::new(
        allocate_local_port(),
        server_port,
        server,
    ));
    *connection.socket.lock() = Some(Arc::downgrade(socket));
    connection.set_connected(true);

    let local_port = connection.local_port;
    let handle = CONNECTIONS.insert(connection);
    socket.set_connection(Some(handle));

    klog!(Trace, "udp: bound local port {} to {}:{}", local_port, server, server_port);
    Ok(local_port)
}

/// Remove a socket's binding.  Fails if the socket is not bound.
pub fn client_unbind(socket: &Arc<Socket>) -> Result<(), SocketError> {
    let handle = socket.connection().ok_or(SocketError::NotConnected)?;
    let connection = CONNECTIONS.get(handle).ok_or(SocketError::NotConnected)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    connection.set_connected(false);
    CONNECTIONS.remove(handle);
    socket.set_connection(None);
    Ok(())
}

// ============================================================================
// Send / Receive
// ============================================================================

/// Send one datagram on a bound socket.
pub fn send(socket: &Arc<Socket>, data: &[u8]) -> Result<(), SocketError> {
    let connection = connection_of(socket)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    let descriptor = PacketDescriptor {
        payload_size: data.len(),
    };
    let mut packet = user_prepare_packet(socket, &descriptor)?;
    packet.payload_mut(data.len()).copy_from_slice(data);

    let interface = select_interface(connection.remote_addr).ok_or(SocketError::NoRoute)?;
    finalize_packet(&interface, &mut packet)
}

/// Copy a queued datagram out to the caller.
///
/// The reported size is the datagram's length field, header included; that
/// is the observable the socket API exposes.  The copy itself is bounded by
/// the bytes actually present in the frame.
fn read_datagram(packet: &Packet, buf: &mut [u8]) -> Result<usize, SocketError> {
    let offset = packet.tag(2);
    let length = u16::from_be_bytes([packet.frame()[offset + 4], packet.frame()[offset + 5]]) as usize;

    if length > buf.len() {
        return Err(SocketError::BufferTooSmall);
    }

    let available = core::cmp::min(length, packet.remaining());
    buf[..available].copy_from_slice(&packet.frame()[packet.index..packet.index + available]);
    Ok(length)
}

/// Receive one datagram, blocking until one arrives.
pub fn receive(socket: &Arc<Socket>, buf: &mut [u8]) -> Result<usize, SocketError> {
    let connection = connection_of(socket)?;
    if !connection.connected() {
        return Err(SocketError::NotConnected);
    }

    loop {
        if let Some(packet) = socket.pop_ready() {
            return read_datagram(&packet, buf);
        }
        if socket.waiter.is_closed() {
            return Err(SocketError::NotConnected);
        }
        socket.waiter.wait();
    }
}

/// Receive one datagram, blocking for at most `ms` milliseconds.
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
            return read_datagram(&packet, buf);
        }
        if ms == 0 {
            return Err(SocketError::TimedOut);
        }
        let waited = conc::now_ms().saturating_sub(start);
        if waited >= ms {
            return Err(SocketError::TimedOut);
        }
        if !socket.waiter.wait_for(ms - waited) {
            // Timed out or closed; one final queue check before reporting.
            return match socket.pop_ready() {
                Some(packet) => read_datagram(&packet, buf),
                None => Err(SocketError::TimedOut),
            };
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{socket_table, SocketDomain, SocketProtocol, SocketType};
    use crate::testutil;

    fn udp_socket() -> Arc<Socket> {
        socket_table().create(SocketDomain::Inet4, SocketType::Dgram, SocketProtocol::Udp)
    }

    #[test]
    fn test_header_round_trip() {
        let header = UdpHeader {
            src_port: 53,
            dst_port: 1024,
            length: 13,
            checksum: 0xABCD,
        };
        assert_eq!(UdpHeader::parse(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_parse_truncated() {
        assert_eq!(UdpHeader::parse(&[0; 7]), Err(UdpError::Truncated));
    }

    #[test]
    fn test_local_ports_are_monotonic() {
        // Other tests allocate concurrently, so only strict monotonicity of
        // this thread's observations can be asserted.
        let a = allocate_local_port();
        let b = allocate_local_port();
        let c = allocate_local_port();
        assert!(a >= 1024);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn test_checksum_zero_avoidance() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(10, 0, 0, 1);

        // Search for a two-byte payload that makes the one's-complement sum
        // fold to all ones; the transmitted checksum must then be 0xFFFF.
        let mut segment = [0u8; UDP_HEADER_LEN + 2];
        segment[0..2].copy_from_slice(&53u16.to_be_bytes());
        segment[2..4].copy_from_slice(&1024u16.to_be_bytes());
        segment[4..6].copy_from_slice(&10u16.to_be_bytes());

        let mut found = false;
        for word in 0..=u16::MAX {
            segment[8..10].copy_from_slice(&word.to_be_bytes());
            if checksum::finalize(checksum::add_bytes(
                checksum::pseudo_header_sum(src, dst, PROTO_UDP, segment.len() as u16),
                &segment,
            )) == 0
            {
                found = true;
                break;
            }
        }
        assert!(found, "no zero-summing payload exists");
        assert_eq!(udp_checksum(src, dst, &segment), 0xFFFF);
    }

    #[test]
    fn test_bind_links_socket_and_connection() {
        let _net = testutil::test_net();
        let socket = udp_socket();
        let server = Ipv4Addr::new(192, 0, 2, 10);
        let port = client_bind(&socket, 53, server).unwrap();
        assert!(port >= 1024);

        let connection = connection_of(&socket).unwrap();
        assert_eq!(connection.local_port, port);
        assert_eq!(connection.remote_port, 53);
        assert_eq!(connection.remote_addr, server);
        assert!(connection.connected());
        assert!(Arc::ptr_eq(&connection.socket().unwrap(), &socket));

        client_unbind(&socket).unwrap();
        assert!(connection_of(&socket).is_err());
        // Unbinding twice reports the missing connection.
        assert_eq!(client_unbind(&socket), Err(SocketError::NotConnected));
        socket_table().close(socket.id());
    }

    #[test]
    fn test_send_requires_bound_socket() {
        let socket = udp_socket();
        assert_eq!(send(&socket, b"x"), Err(SocketError::NotConnected));
        socket_table().close(socket.id());
    }

    // Scenario: bind to a DNS server, inject a datagram, read it back.  The
    // reported size is the UDP length field: payload plus the 8-byte header.
    #[test]
    fn test_bind_and_receive_datagram() {
        let net = testutil::test_net();
        let socket = udp_socket();
        socket.set_listen(true);

        let local_port = client_bind(&socket, 53, net.peer_ip).unwrap();

        let frame = net.udp_from_peer(53, local_port, b"hello");
        assert_eq!(net.inject(&frame), ProcessResult::Handled);

        let mut buf = [0u8; 64];
        let n = receive(&socket, &mut buf).unwrap();
        assert_eq!(n, 5 + UDP_HEADER_LEN);
        assert_eq!(&buf[..5], b"hello");

        client_unbind(&socket).unwrap();
        socket_table().close(socket.id());
    }

    #[test]
    fn test_receive_timeout_on_empty_queue() {
        let net = testutil::test_net();
        let socket = udp_socket();
        socket.set_listen(true);
        let _ = client_bind(&socket, 2000, net.peer_ip).unwrap();

        let mut buf = [0u8; 16];
        // Zero window polls.
        assert_eq!(receive_timeout(&socket, &mut buf, 0), Err(SocketError::TimedOut));

        let start = conc::now_ms();
        assert_eq!(receive_timeout(&socket, &mut buf, 40), Err(SocketError::TimedOut));
        assert!(conc::now_ms().saturating_sub(start) >= 35);

        client_unbind(&socket).unwrap();
        socket_table().close(socket.id());
    }

    #[test]
    fn test_datagram_for_unknown_port_is_dropped() {
        let net = testutil::test_net();
        let frame = net.udp_from_peer(2001, 9999, b"nobody home");
        assert_eq!(
            net.inject(&frame),
            ProcessResult::Dropped(DropReason::NoConnection)
        );
    }

    #[test]
    fn test_send_produces_valid_datagram() {
        let net = testutil::test_net();
        let socket = udp_socket();
        let local_port = client_bind(&socket, 4242, net.peer_ip).unwrap();

        send(&socket, b"ping").unwrap();

        let frames = net.tx.frames();
        assert_eq!(frames.len(), 1);
        let (ip, payload) = testutil::parse_ipv4_frame(&frames[0]).unwrap();
        assert_eq!(ip.protocol, PROTO_UDP);
        assert_eq!(ip.dst, net.peer_ip);
        let header = UdpHeader::parse(payload).unwrap();
        assert_eq!(header.src_port, local_port);
        assert_eq!(header.dst_port, 4242);
        assert_eq!(header.length as usize, UDP_HEADER_LEN + 4);
        assert_eq!(&payload[UDP_HEADER_LEN..UDP_HEADER_LEN + 4], b"ping");
        // Checksum over the segment folds to all ones.
        assert_eq!(
            checksum::fold(checksum::add_bytes(
                checksum::pseudo_header_sum(ip.src, ip.dst, PROTO_UDP, header.length),
                &payload[..header.length as usize],
            )),
            0xFFFF
        );

        client_unbind(&socket).unwrap();
        socket_table().close(socket.id());
    }
}
