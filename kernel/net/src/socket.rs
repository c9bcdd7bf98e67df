//! Socket layer.
//!
//! A [`Socket`] is the per-descriptor object the system-call shim talks to:
//! protocol identity, a listen flag, a bounded ready-queue of packet copies
//! and the waiter a blocked reader suspends on.  Transport state lives in
//! the transport's own connection table; the socket stores only an opaque
//! [`ConnHandle`] that the owning transport resolves.
//!
//! # Delivery
//!
//! The ingress path (which may run in interrupt context) deep-copies a
//! packet into the ready-queue and signals the waiter through the IRQ-safe
//! notify variant.  While the listen flag is off the ready-queue stays
//! empty: [`deliver`](Socket::deliver) refuses the copy up front.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, Once, RwLock};

use conc::WaitQueue;

use crate::connection::ConnHandle;
use crate::device::TxError;
use crate::packet::Packet;
use crate::stack::net_stats;

// ============================================================================
// Constants
// ============================================================================

/// Sentinel id of an invalidated socket (all ones).
pub const INVALID_SOCKET_ID: u64 = u64::MAX;

/// Maximum packets queued for reading per socket.
///
/// When the queue is full new packets are dropped, which is normal network
/// behavior rather than an error surfaced to the reader.
pub const MAX_READY_QUEUE: usize = 32;

// ============================================================================
// Identity Enums
// ============================================================================

/// Socket address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketDomain {
    /// AF_INET
    Inet4,
}

impl SocketDomain {
    /// Validate a raw domain value (AF_INET = 2).
    pub fn from_raw(domain: u32) -> Option<Self> {
        match domain {
            2 => Some(SocketDomain::Inet4),
            _ => None,
        }
    }
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// SOCK_STREAM
    Stream,
    /// SOCK_DGRAM
    Dgram,
    /// SOCK_RAW
    Raw,
}

impl SocketType {
    /// Validate a raw type value.
    pub fn from_raw(ty: u32) -> Option<Self> {
        match ty {
            1 => Some(SocketType::Stream),
            2 => Some(SocketType::Dgram),
            3 => Some(SocketType::Raw),
            _ => None,
        }
    }
}

/// Socket protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl SocketProtocol {
    /// Validate a raw protocol value against the socket type.
    ///
    /// Zero selects the type's default protocol.
    pub fn from_raw(proto: u32, sock_type: SocketType) -> Option<Self> {
        match (proto, sock_type) {
            (0 | 6, SocketType::Stream) => Some(SocketProtocol::Tcp),
            (0 | 17, SocketType::Dgram) => Some(SocketProtocol::Udp),
            (1, SocketType::Raw | SocketType::Dgram) => Some(SocketProtocol::Icmp),
            _ => None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the socket operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Operation requires a connected socket.
    NotConnected,
    /// Nothing arrived within the requested window.
    TimedOut,
    /// No acknowledgement after all transmit attempts.
    TcpFailure,
    /// Caller's buffer is smaller than the waiting payload (which is
    /// discarded).
    BufferTooSmall,
    /// No interface can reach the destination.
    NoRoute,
    /// No neighbor entry for the destination.
    Unresolved,
    /// Driver transmit error, propagated unchanged.
    Tx(TxError),
}

impl From<TxError> for SocketError {
    fn from(e: TxError) -> Self {
        SocketError::Tx(e)
    }
}

// ============================================================================
// Socket
// ============================================================================

/// A network socket.
pub struct Socket {
    /// Socket id; [`INVALID_SOCKET_ID`] once invalidated.
    id: AtomicU64,
    /// Address family.
    pub domain: SocketDomain,
    /// Socket type.
    pub ty: SocketType,
    /// Transport protocol.
    pub protocol: SocketProtocol,
    /// Whether the socket accepts packets into its ready-queue.
    listen: AtomicBool,
    /// Handle into the owning transport's connection table.  Opaque here;
    /// the transport knows which table it indexes.
    connection: Mutex<Option<ConnHandle>>,
    /// Outgoing packets prepared but not yet finalized, keyed by the packet
    /// descriptor handed back to the caller.  The two-phase egress syscalls
    /// (prepare, write payload, finalize) park packets here in between.
    prepared: Mutex<Vec<(u64, Packet)>>,
    /// Next packet descriptor for `prepared`.
    next_packet_fd: AtomicU64,
    /// Packets waiting to be read.
    ready_queue: Mutex<VecDeque<Packet>>,
    /// Waiter a blocked reader suspends on.
    pub waiter: WaitQueue,
}

impl Socket {
    fn new(id: u64, domain: SocketDomain, ty: SocketType, protocol: SocketProtocol) -> Self {
        Socket {
            id: AtomicU64::new(id),
            domain,
            ty,
            protocol,
            listen: AtomicBool::new(false),
            connection: Mutex::new(None),
            prepared: Mutex::new(Vec::new()),
            next_packet_fd: AtomicU64::new(0),
            ready_queue: Mutex::new(VecDeque::new()),
            waiter: WaitQueue::new(),
        }
    }

    /// Socket id.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Whether the socket has not been invalidated.
    pub fn is_valid(&self) -> bool {
        self.id() != INVALID_SOCKET_ID
    }

    /// Invalidate the socket.
    pub fn invalidate(&self) {
        self.id.store(INVALID_SOCKET_ID, Ordering::Release);
    }

    /// Whether the ready-queue accepts packets.
    pub fn listen(&self) -> bool {
        self.listen.load(Ordering::Acquire)
    }

    /// Enable or disable packet delivery.
    pub fn set_listen(&self, on: bool) {
        self.listen.store(on, Ordering::Release);
    }

    /// The transport connection handle, if bound.
    pub fn connection(&self) -> Option<ConnHandle> {
        *self.connection.lock()
    }

    /// Bind or clear the transport connection handle.
    pub fn set_connection(&self, handle: Option<ConnHandle>) {
        *self.connection.lock() = handle;
    }

    /// Park a prepared packet until its finalize call, returning the packet
    /// descriptor the caller names it by.
    pub fn register_packet(&self, packet: Packet) -> u64 {
        let fd = self.next_packet_fd.fetch_add(1, Ordering::Relaxed);
        self.prepared.lock().push((fd, packet));
        fd
    }

    /// Whether a prepared packet with this descriptor exists.
    pub fn has_packet(&self, fd: u64) -> bool {
        self.prepared.lock().iter().any(|(id, _)| *id == fd)
    }

    /// Remove and return a prepared packet.
    pub fn take_packet(&self, fd: u64) -> Option<Packet> {
        let mut prepared = self.prepared.lock();
        let index = prepared.iter().position(|(id, _)| *id == fd)?;
        Some(prepared.swap_remove(index).1)
    }

    /// Deep-copy `packet` into the ready-queue and wake one reader.
    ///
    /// Called from the ingress path, possibly in interrupt context: the
    /// wake goes through the IRQ-safe notify.  Returns whether the packet
    /// was queued.
    pub(crate) fn deliver(&self, packet: Packet) -> bool {
        if !self.listen() {
            return false;
        }
        {
            let mut queue = self.ready_queue.lock();
            if queue.len() >= MAX_READY_QUEUE {
                klog!(Warn, "socket {}: ready queue full, dropping packet", self.id());
                net_stats().inc_rx_queue_full();
                return false;
            }
            queue.push_back(packet);
        }
        self.waiter.notify_one_irq();
        true
    }

    /// Pop the oldest queued packet.
    pub(crate) fn pop_ready(&self) -> Option<Packet> {
        self.ready_queue.lock().pop_front()
    }

    /// Number of packets waiting to be read.
    pub fn ready_len(&self) -> usize {
        self.ready_queue.lock().len()
    }
}

impl core::fmt::Debug for Socket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("protocol", &self.protocol)
            .field("listen", &self.listen())
            .field("ready", &self.ready_len())
            .finish()
    }
}

// ============================================================================
// Socket Table
// ============================================================================

/// Global id-allocating socket registry.
pub struct SocketTable {
    sockets: RwLock<BTreeMap<u64, Arc<Socket>>>,
    next_id: AtomicU64,
}

impl SocketTable {
    fn new() -> Self {
        SocketTable {
            sockets: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Create and register a socket.
    pub fn create(
        &self,
        domain: SocketDomain,
        ty: SocketType,
        protocol: SocketProtocol,
    ) -> Arc<Socket> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::new(Socket::new(id, domain, ty, protocol));
        self.sockets.write().insert(id, socket.clone());
        socket
    }

    /// Get a socket by id.
    pub fn get(&self, id: u64) -> Option<Arc<Socket>> {
        self.sockets.read().get(&id).cloned()
    }

    /// Remove a socket from the table, invalidating it and waking any
    /// blocked reader.
    ///
    /// The caller is responsible for disconnecting/unbinding the transport
    /// first.
    pub fn close(&self, id: u64) -> Option<Arc<Socket>> {
        let socket = self.sockets.write().remove(&id)?;
        socket.set_listen(false);
        socket.invalidate();
        socket.waiter.close();
        Some(socket)
    }

    /// Deliver a copy of `packet` to every listening socket of `protocol`.
    ///
    /// Used for IP-level delivery (ICMP sockets).  Returns the number of
    /// sockets that accepted a copy.
    pub fn deliver_to_protocol(&self, protocol: SocketProtocol, packet: &Packet) -> usize {
        let sockets = self.sockets.read();
        sockets
            .values()
            .filter(|s| s.protocol == protocol)
            .filter(|s| s.deliver(packet.clone()))
            .count()
    }

    /// Number of registered sockets.
    pub fn count(&self) -> usize {
        self.sockets.read().len()
    }
}

static SOCKET_TABLE: Once<SocketTable> = Once::new();

/// The global socket table.
pub fn socket_table() -> &'static SocketTable {
    SOCKET_TABLE.call_once(SocketTable::new)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_udp_socket() -> Arc<Socket> {
        socket_table().create(SocketDomain::Inet4, SocketType::Dgram, SocketProtocol::Udp)
    }

    #[test]
    fn test_from_raw_validation() {
        assert_eq!(SocketDomain::from_raw(2), Some(SocketDomain::Inet4));
        assert_eq!(SocketDomain::from_raw(10), None); // AF_INET6
        assert_eq!(SocketType::from_raw(1), Some(SocketType::Stream));
        assert_eq!(SocketType::from_raw(9), None);
        assert_eq!(
            SocketProtocol::from_raw(0, SocketType::Stream),
            Some(SocketProtocol::Tcp)
        );
        assert_eq!(
            SocketProtocol::from_raw(17, SocketType::Dgram),
            Some(SocketProtocol::Udp)
        );
        assert_eq!(SocketProtocol::from_raw(6, SocketType::Dgram), None);
    }

    #[test]
    fn test_ids_are_unique_and_invalidate() {
        let a = make_udp_socket();
        let b = make_udp_socket();
        assert_ne!(a.id(), b.id());
        assert!(a.is_valid());
        a.invalidate();
        assert!(!a.is_valid());
        assert_eq!(a.id(), INVALID_SOCKET_ID);
    }

    #[test]
    fn test_ready_queue_respects_listen_flag() {
        let socket = make_udp_socket();
        // Not listening: the ready-queue must stay empty.
        assert!(!socket.deliver(Packet::kernel(16)));
        assert_eq!(socket.ready_len(), 0);

        socket.set_listen(true);
        assert!(socket.deliver(Packet::kernel(16)));
        assert_eq!(socket.ready_len(), 1);
        assert!(socket.pop_ready().is_some());
        assert!(socket.pop_ready().is_none());
    }

    #[test]
    fn test_ready_queue_bound() {
        let socket = make_udp_socket();
        socket.set_listen(true);
        for _ in 0..MAX_READY_QUEUE {
            assert!(socket.deliver(Packet::kernel(1)));
        }
        // Full queue drops the newcomer.
        assert!(!socket.deliver(Packet::kernel(1)));
        assert_eq!(socket.ready_len(), MAX_READY_QUEUE);
    }

    #[test]
    fn test_prepared_packets_by_descriptor() {
        let socket = make_udp_socket();
        let fd_a = socket.register_packet(Packet::kernel(4));
        let fd_b = socket.register_packet(Packet::kernel(8));
        assert_ne!(fd_a, fd_b);
        assert!(socket.has_packet(fd_a));
        assert_eq!(socket.take_packet(fd_b).unwrap().capacity(), 8);
        assert!(!socket.has_packet(fd_b));
        assert!(socket.take_packet(fd_b).is_none());
        assert!(socket.has_packet(fd_a));
        socket_table().close(socket.id());
    }

    #[test]
    fn test_close_removes_and_invalidates() {
        let socket = make_udp_socket();
        let id = socket.id();
        assert!(socket_table().get(id).is_some());
        socket_table().close(id);
        assert!(socket_table().get(id).is_none());
        assert!(!socket.is_valid());
        assert!(socket.waiter.is_closed());
    }

    #[test]
    fn test_deliver_to_protocol_filters() {
        let icmp = socket_table().create(SocketDomain::Inet4, SocketType::Raw, SocketProtocol::Icmp);
        icmp.set_listen(true);
        let udp = make_udp_socket();
        udp.set_listen(true);

        let delivered = socket_table().deliver_to_protocol(SocketProtocol::Icmp, &Packet::kernel(8));
        assert!(delivered >= 1);
        assert!(icmp.ready_len() >= 1);
        assert_eq!(udp.ready_len(), 0);
        socket_table().close(icmp.id());
        socket_table().close(udp.id());
    }
}
