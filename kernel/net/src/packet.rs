//! Network packet buffer.
//!
//! A [`Packet`] is a contiguous owned byte region shared by every layer of
//! the stack, with a single write cursor (`index`) and one offset tag per
//! layer.
//!
//! # Layer Protocol
//!
//! ```text
//! +----------+---------+-----------------+------------------+
//! | ethernet |  ipv4   | tcp/udp/icmp    |     payload      |
//! +----------+---------+-----------------+------------------+
//! ^          ^         ^                 ^
//! tag(0)     tag(1)    tag(2)            index after prepare
//! ```
//!
//! On encode, each descending layer records `tag(layer) = index`, appends its
//! header (advancing `index`), and the payload is then written *in place* at
//! `index` without advancing.  On finalize, each layer rewinds `index` by its
//! own header length, computes its checksum over the region, and hands down.
//! On decode, each ascending layer records its tag before reading, then
//! advances past its header.  Any layer can therefore locate its own and
//! earlier headers at any later point without re-parsing.
//!
//! # Ownership
//!
//! Queue boundaries deep-copy: the producer clones the packet into a socket
//! ready-queue or a connection listener-queue and keeps its own copy; the
//! consumer owns the popped clone.  No two owners ever alias the same
//! storage.

use alloc::vec;
use alloc::vec::Vec;

/// Number of per-layer offset tags carried by each packet.
pub const MAX_LAYER_TAGS: usize = 4;

/// Who provided the packet's payload bytes.
///
/// Kernel packets are allocated by the stack itself (handshake segments,
/// replies); user packets carry bytes handed in by a caller of the socket
/// API.  The flag is carried for accounting; all storage is owned either
/// way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    /// Storage allocated by the stack.
    Kernel,
    /// Payload provided through the socket API.
    User,
}

/// An owned packet buffer with an advancing write cursor and layer tags.
#[derive(Clone)]
pub struct Packet {
    /// Backing storage; its length is the full frame size.
    data: Vec<u8>,
    /// Current append/read position.
    pub index: usize,
    /// Byte offset at which each layer's header begins.
    tags: [usize; MAX_LAYER_TAGS],
    /// Provenance of the payload bytes.
    origin: PacketOrigin,
}

impl Packet {
    /// Allocate a zero-filled kernel packet of exactly `size` bytes.
    pub fn kernel(size: usize) -> Self {
        Packet {
            data: vec![0; size],
            index: 0,
            tags: [0; MAX_LAYER_TAGS],
            origin: PacketOrigin::Kernel,
        }
    }

    /// Allocate a zero-filled packet that will carry caller-provided payload.
    pub fn user(size: usize) -> Self {
        Packet {
            data: vec![0; size],
            index: 0,
            tags: [0; MAX_LAYER_TAGS],
            origin: PacketOrigin::User,
        }
    }

    /// Copy a received frame into an owned packet, cursor at the start.
    pub fn from_frame(frame: &[u8]) -> Self {
        Packet {
            data: frame.to_vec(),
            index: 0,
            tags: [0; MAX_LAYER_TAGS],
            origin: PacketOrigin::Kernel,
        }
    }

    /// Provenance of the payload bytes.
    #[inline]
    pub fn origin(&self) -> PacketOrigin {
        self.origin
    }

    /// Total frame size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes between the cursor and the end of the frame.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.index
    }

    /// The complete frame.
    #[inline]
    pub fn frame(&self) -> &[u8] {
        &self.data
    }

    /// Record the offset at which `layer`'s header begins.
    pub fn set_tag(&mut self, layer: usize, offset: usize) {
        assert!(layer < MAX_LAYER_TAGS, "layer tag out of range: {}", layer);
        assert!(
            offset <= self.data.len(),
            "tag offset {} beyond frame of {} bytes",
            offset,
            self.data.len()
        );
        self.tags[layer] = offset;
    }

    /// The offset at which `layer`'s header begins.
    #[inline]
    pub fn tag(&self, layer: usize) -> usize {
        assert!(layer < MAX_LAYER_TAGS, "layer tag out of range: {}", layer);
        self.tags[layer]
    }

    /// View of the frame starting at `offset`.
    #[inline]
    pub fn at(&self, offset: usize) -> &[u8] {
        &self.data[offset..]
    }

    /// Copy `bytes` at the cursor and advance it.
    pub fn append(&mut self, bytes: &[u8]) {
        let end = self.index + bytes.len();
        assert!(
            end <= self.data.len(),
            "append of {} bytes overflows frame ({} of {} used)",
            bytes.len(),
            self.index,
            self.data.len()
        );
        self.data[self.index..end].copy_from_slice(bytes);
        self.index = end;
    }

    /// Advance the cursor by `n` bytes (decode: skip a parsed header).
    pub fn advance(&mut self, n: usize) {
        assert!(self.index + n <= self.data.len());
        self.index += n;
    }

    /// Move the cursor back by `n` bytes (finalize: return to a header).
    pub fn rewind(&mut self, n: usize) {
        assert!(n <= self.index, "rewind {} past start (index {})", n, self.index);
        self.index -= n;
    }

    /// Mutable view of `len` bytes at the cursor, without advancing.
    ///
    /// This is how payload bytes are written after the headers are in place:
    /// the cursor stays at the payload start so finalize can rewind by the
    /// header length alone.
    pub fn payload_mut(&mut self, len: usize) -> &mut [u8] {
        let end = self.index + len;
        assert!(
            end <= self.data.len(),
            "payload of {} bytes overflows frame ({} of {} used)",
            len,
            self.index,
            self.data.len()
        );
        &mut self.data[self.index..end]
    }

    /// Overwrite bytes at an absolute offset (checksum stores).
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        assert!(end <= self.data.len());
        self.data[offset..end].copy_from_slice(bytes);
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("index", &self.index)
            .field("tags", &self.tags)
            .field("origin", &self.origin)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_advances_cursor() {
        let mut p = Packet::kernel(8);
        p.append(&[1, 2, 3]);
        assert_eq!(p.index, 3);
        assert_eq!(&p.frame()[..3], &[1, 2, 3]);
        assert_eq!(p.remaining(), 5);
    }

    #[test]
    fn test_rewind_and_payload_in_place() {
        let mut p = Packet::kernel(8);
        p.append(&[0xaa, 0xbb]);
        p.payload_mut(4).copy_from_slice(&[1, 2, 3, 4]);
        // Payload writes do not move the cursor.
        assert_eq!(p.index, 2);
        p.rewind(2);
        assert_eq!(p.index, 0);
        assert_eq!(p.frame(), &[0xaa, 0xbb, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_layer_tags_are_ordered_after_prepare() {
        // Simulate a three-layer prepare: each layer tags, then appends.
        let mut p = Packet::kernel(64);
        p.set_tag(0, p.index);
        p.append(&[0; 14]);
        p.set_tag(1, p.index);
        p.append(&[0; 20]);
        p.set_tag(2, p.index);
        p.append(&[0; 8]);
        assert!(p.tag(0) < p.tag(1));
        assert!(p.tag(1) < p.tag(2));
        assert!(p.tag(2) <= p.index);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut p = Packet::kernel(4);
        p.append(&[9, 9]);
        let mut copy = p.clone();
        copy.payload_mut(1)[0] = 7;
        // The original's storage is untouched by writes to the copy.
        assert_eq!(p.frame(), &[9, 9, 0, 0]);
        assert_eq!(copy.frame(), &[9, 9, 7, 0]);
    }

    #[test]
    fn test_origin_flags() {
        assert_eq!(Packet::kernel(1).origin(), PacketOrigin::Kernel);
        assert_eq!(Packet::user(1).origin(), PacketOrigin::User);
        assert_eq!(Packet::from_frame(&[0]).origin(), PacketOrigin::Kernel);
    }

    #[test]
    #[should_panic]
    fn test_rewind_past_start_panics() {
        let mut p = Packet::kernel(4);
        p.rewind(1);
    }
}
