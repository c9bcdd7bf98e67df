//! Shared test harness.
//!
//! Host-side replacements for the kernel environment: a capture-only
//! [`NetDevice`], poll-based [`SchedHooks`] so blocking waits work on std
//! threads, raw frame builders for injecting traffic, and a scripted TCP
//! peer driven from a helper thread.
//!
//! Each call to [`test_net`] registers a fresh interface on its own /24
//! (10.77.N.0) so concurrently running tests cannot route into each other.

use std::boxed::Box;
use std::format;
use std::string::String;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

use conc::{SchedHooks, WaitOutcome, WaitQueue};
use spin::{Mutex, Once};

use crate::arp;
use crate::checksum;
use crate::device::{LinkStatus, MacAddress, NetDevice, TxError};
use crate::ethernet::{EthHeader, ETHERTYPE_IPV4, ETH_HEADER_LEN};
use crate::icmp::ICMP_TYPE_ECHO_REQUEST;
use crate::interface::{register_interface, Interface};
use crate::ipv4::{Ipv4Addr, Ipv4Header, IPV4_HEADER_LEN, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::stack::{on_frame_received, process_deferred, ProcessResult};
use crate::tcp::{default_flags, TcpHeader, TCP_WINDOW_SIZE};
use crate::udp;
use crate::udp::UDP_HEADER_LEN;

// ============================================================================
// Scheduler Hooks
// ============================================================================

/// Poll-based hooks: a parked "task" sleeps in short slices and watches the
/// queue's wake-signal counter.
struct TestHooks;

static CLOCK_START: Once<Instant> = Once::new();

fn clock_ms() -> u64 {
    CLOCK_START.call_once(Instant::now).elapsed().as_millis() as u64
}

impl SchedHooks for TestHooks {
    fn wait(&self, queue: &WaitQueue, timeout_ms: Option<u64>) -> WaitOutcome {
        let start = Instant::now();
        loop {
            if queue.take_wake_signal() {
                return WaitOutcome::Woken;
            }
            if queue.is_closed() {
                return WaitOutcome::Closed;
            }
            if let Some(ms) = timeout_ms {
                if start.elapsed() >= Duration::from_millis(ms) {
                    return WaitOutcome::TimedOut;
                }
            }
            thread::sleep(Duration::from_micros(500));
        }
    }

    // Signals are latched in the queue itself; the polling waiter picks
    // them up without help.
    fn wake_one(&self, _queue: &WaitQueue) {}

    fn wake_one_irq(&self, _queue: &WaitQueue) {}

    fn now_ms(&self) -> u64 {
        clock_ms()
    }
}

static TEST_HOOKS: TestHooks = TestHooks;

/// Register the test hooks (idempotent).
pub fn setup() {
    conc::register_sched_hooks(&TEST_HOOKS);
}

// ============================================================================
// Capture Device
// ============================================================================

/// A device that records every transmitted frame.
pub struct TestDevice {
    name: String,
    mac: MacAddress,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Shared view of a [`TestDevice`]'s transmit log.
#[derive(Clone)]
pub struct TxLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl TxLog {
    /// Number of captured frames.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Copies of all captured frames.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }
}

impl NetDevice for TestDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::UP_UNKNOWN
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TxError> {
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }
}

// ============================================================================
// Test Network
// ============================================================================

static NEXT_SUBNET: AtomicU8 = AtomicU8::new(1);

/// One isolated interface plus a pre-resolved peer on its subnet.
#[derive(Clone)]
pub struct TestNet {
    pub iface: Arc<Interface>,
    pub tx: TxLog,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub local_mac: MacAddress,
    pub peer_mac: MacAddress,
}

/// Register a fresh interface on its own subnet with a capture device and a
/// seeded neighbor entry for the peer.
pub fn test_net() -> TestNet {
    setup();

    let n = NEXT_SUBNET.fetch_add(1, Ordering::Relaxed);
    let local_ip = Ipv4Addr::new(10, 77, n, 1);
    let peer_ip = Ipv4Addr::new(10, 77, n, 2);
    let local_mac = [0x02, 0x77, 0, 0, n, 1];
    let peer_mac = [0x02, 0x77, 0, 0, n, 2];

    let frames = Arc::new(Mutex::new(Vec::new()));
    let name = format!("test{}", n);
    let device = TestDevice {
        name: name.clone(),
        mac: local_mac,
        frames: frames.clone(),
    };
    let iface = register_interface(
        &name,
        local_ip,
        Ipv4Addr::new(255, 255, 255, 0),
        1500,
        Box::new(device),
    );
    arp::insert(peer_ip, peer_mac);

    TestNet {
        iface,
        tx: TxLog(frames),
        local_ip,
        peer_ip,
        local_mac,
        peer_mac,
    }
}

impl TestNet {
    /// Inject a frame and run the deferred-transmit worker.
    pub fn inject(&self, frame: &[u8]) -> ProcessResult {
        let result = on_frame_received(self.iface.index, frame);
        process_deferred();
        result
    }

    /// Inject a frame without draining the deferred queue.
    pub fn inject_frame(&self, frame: &[u8]) -> ProcessResult {
        on_frame_received(self.iface.index, frame)
    }

    /// Wrap an IPv4 payload in peer-to-us Ethernet + IPv4 headers.
    fn eth_ip_frame(&self, protocol: u8, l4: &[u8]) -> Vec<u8> {
        let eth = EthHeader {
            dst: self.local_mac,
            src: self.peer_mac,
            ethertype: ETHERTYPE_IPV4,
        };

        let total_len = (IPV4_HEADER_LEN + l4.len()) as u16;
        let mut ip = [0u8; IPV4_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
        ip[8] = 64;
        ip[9] = protocol;
        ip[12..16].copy_from_slice(&self.peer_ip.octets());
        ip[16..20].copy_from_slice(&self.local_ip.octets());
        let sum = checksum::add_bytes(0, &ip);
        ip[10..12].copy_from_slice(&checksum::finalize(sum).to_be_bytes());

        let mut frame = Vec::with_capacity(ETH_HEADER_LEN + IPV4_HEADER_LEN + l4.len());
        frame.extend_from_slice(&eth.to_bytes());
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(l4);
        frame
    }

    /// A UDP datagram from the peer, checksummed.
    pub fn udp_from_peer(&self, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut segment = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(payload);

        let sum = udp::udp_checksum(self.peer_ip, self.local_ip, &segment);
        segment[6..8].copy_from_slice(&sum.to_be_bytes());

        self.eth_ip_frame(PROTO_UDP, &segment)
    }

    /// A TCP segment from the peer, checksummed.  `flags` are OR-ed onto the
    /// default data offset.
    pub fn tcp_from_peer(
        &self,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            flags: default_flags() | flags,
            window: TCP_WINDOW_SIZE,
            checksum: 0,
            urgent: 0,
        };
        let mut segment = Vec::with_capacity(20 + payload.len());
        segment.extend_from_slice(&header.to_bytes());
        segment.extend_from_slice(payload);

        let sum = checksum::add_bytes(
            checksum::pseudo_header_sum(
                self.peer_ip,
                self.local_ip,
                PROTO_TCP,
                segment.len() as u16,
            ),
            &segment,
        );
        segment[16..18].copy_from_slice(&checksum::finalize_nz(sum).to_be_bytes());

        self.eth_ip_frame(PROTO_TCP, &segment)
    }

    /// An ICMP echo request from the peer to our interface address.
    pub fn icmp_echo_from_peer(&self, ident: u16, seqno: u16, payload: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(8 + payload.len());
        message.extend_from_slice(&[ICMP_TYPE_ECHO_REQUEST, 0, 0, 0]);
        message.extend_from_slice(&ident.to_be_bytes());
        message.extend_from_slice(&seqno.to_be_bytes());
        message.extend_from_slice(payload);

        let sum = checksum::add_bytes(0, &message);
        message[2..4].copy_from_slice(&checksum::finalize(sum).to_be_bytes());

        self.eth_ip_frame(PROTO_ICMP, &message)
    }
}

// ============================================================================
// Frame Parsers
// ============================================================================

/// Split a captured frame into its validated IPv4 header and payload.
pub fn parse_ipv4_frame(frame: &[u8]) -> Option<(Ipv4Header, &[u8])> {
    let eth = EthHeader::parse(frame).ok()?;
    if eth.ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip_bytes = &frame[ETH_HEADER_LEN..];
    let header = Ipv4Header::parse(ip_bytes).ok()?;
    Some((header, &ip_bytes[header.header_len..header.total_len]))
}

/// A captured TCP segment, fully parsed.
#[derive(Debug, Clone)]
pub struct TcpFrame {
    pub ip: Ipv4Header,
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

/// Parse a captured frame as a TCP segment.
pub fn parse_tcp_frame(frame: &[u8]) -> Option<TcpFrame> {
    let (ip, l4) = parse_ipv4_frame(frame)?;
    if ip.protocol != PROTO_TCP {
        return None;
    }
    let header = TcpHeader::parse(l4).ok()?;
    Some(TcpFrame {
        ip,
        header,
        payload: l4[header.header_len()..].to_vec(),
    })
}

// ============================================================================
// Scripted TCP Peer
// ============================================================================

/// Handle to a running scripted peer; stops and joins on [`stop`](Self::stop)
/// or drop.
pub struct TcpPeer {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TcpPeer {
    /// Stop the peer and wait for its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a thread that watches the interface's transmit log and answers each
/// TCP segment with the frames `script` returns.
pub fn spawn_tcp_peer<F>(net: TestNet, mut script: F) -> TcpPeer
where
    F: FnMut(&TestNet, &TcpFrame) -> Vec<Vec<u8>> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let handle = thread::spawn(move || {
        let mut seen = 0usize;
        loop {
            let frames = net.tx.frames();
            while seen < frames.len() {
                if let Some(segment) = parse_tcp_frame(&frames[seen]) {
                    for response in script(&net, &segment) {
                        on_frame_received(net.iface.index, &response);
                        process_deferred();
                    }
                }
                seen += 1;
            }
            if stop_flag.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    TcpPeer {
        stop,
        handle: Some(handle),
    }
}
