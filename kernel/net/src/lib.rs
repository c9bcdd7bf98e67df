//! Kernel network stack.
//!
//! A layered packet pipeline (Ethernet, IPv4, then ICMP/UDP/TCP) with an
//! embedded TCP connection state machine and the socket-bound delivery path
//! that bridges interrupt-driven packet arrival and blocking reads.
//!
//! # Architecture
//!
//! ```text
//!                      +------------------+
//!                      |   NetDevice      |
//!                      |  (driver trait)  |
//!                      +--------+---------+
//!                         rx    |    tx
//!                      +--------v---------+
//!                      |    Ethernet      |            deferred-transmit
//!                      +--------+---------+            queue (worker task)
//!                               |                              ^
//!                      +--------v---------+                    |
//!                      |      IPv4        |                    |
//!                      +--------+---------+                    |
//!                               |                              |
//!              +----------------+----------------+             |
//!              |                |                |             |
//!     +--------v------+ +------v-------+ +------v------+      |
//!     |     ICMP      | |     UDP      | |     TCP     |------+
//!     |  (echo reply) | | (demux/bind) | | (conn state)|  unsolicited ACKs,
//!     +---------------+ +------+-------+ +------+------+  echo replies
//!                              |                |
//!                      +-------v----------------v------+
//!                      |   Socket ready-queues + waiters |
//!                      +--------------------------------+
//! ```
//!
//! Every packet carries per-layer offset tags so each layer can find its own
//! and earlier headers at any point without re-parsing (see [`packet`]).
//! Ingress runs to completion without suspending; anything it wants to
//! transmit is finalized onto the deferred queue and sent by the worker
//! ([`stack::process_deferred`]).  Blocking lives exclusively in the socket
//! operations, built on `conc`'s wait queues.

#![no_std]

extern crate alloc;
#[macro_use]
extern crate klog;

#[cfg(test)]
extern crate std;

pub mod arp;
pub mod checksum;
pub mod connection;
pub mod device;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod interface;
pub mod ipv4;
pub mod packet;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod udp;

#[cfg(test)]
pub(crate) mod testutil;

pub use device::{LinkStatus, MacAddress, NetDevice, NetDeviceHandle, TxError, MAC_BROADCAST};
pub use interface::{
    config_snapshot, interface_by_index, interface_count, register_interface, select_interface,
    Interface, InterfaceConfig,
};
pub use ipv4::{Ipv4Addr, Ipv4Error, Ipv4Header, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
pub use packet::{Packet, PacketOrigin, MAX_LAYER_TAGS};
pub use socket::{
    socket_table, Socket, SocketDomain, SocketError, SocketProtocol, SocketTable, SocketType,
    INVALID_SOCKET_ID,
};
pub use stack::{
    net_stats, on_frame_received, process_deferred, DropReason, NetStats, ProcessResult,
};
pub use tcp::{TCP_MAX_TRIES, TCP_TIMEOUT_MS, TCP_WINDOW_SIZE};
