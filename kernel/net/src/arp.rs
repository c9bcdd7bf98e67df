//! Neighbor cache.
//!
//! The Ethernet finalize path needs a destination MAC for every on-link IPv4
//! address.  Address resolution itself (the ARP protocol) is owned by a
//! separate subsystem; this module is the narrow cache interface the stack
//! consumes.  Entries are seeded by that subsystem or by configuration, and
//! a miss surfaces as [`SocketError::Unresolved`](crate::socket::SocketError)
//! on the egress path.

use alloc::collections::BTreeMap;
use lazy_static::lazy_static;
use spin::RwLock;

use crate::device::MacAddress;
use crate::ipv4::Ipv4Addr;

lazy_static! {
    /// Global neighbor table.
    static ref NEIGHBORS: RwLock<BTreeMap<Ipv4Addr, MacAddress>> = RwLock::new(BTreeMap::new());
}

/// Look up the MAC address for an on-link IPv4 address.
pub fn lookup(ip: Ipv4Addr) -> Option<MacAddress> {
    NEIGHBORS.read().get(&ip).copied()
}

/// Insert or replace a neighbor entry.
pub fn insert(ip: Ipv4Addr, mac: MacAddress) {
    NEIGHBORS.write().insert(ip, mac);
}

/// Remove a neighbor entry.
pub fn remove(ip: Ipv4Addr) -> Option<MacAddress> {
    NEIGHBORS.write().remove(&ip)
}

/// Number of cached entries.
pub fn len() -> usize {
    NEIGHBORS.read().len()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let ip = Ipv4Addr::new(192, 0, 2, 77);
        let mac = [0x02, 0, 0, 0, 0, 0x77];
        assert_eq!(lookup(ip), None);
        insert(ip, mac);
        assert_eq!(lookup(ip), Some(mac));
        assert_eq!(remove(ip), Some(mac));
        assert_eq!(lookup(ip), None);
    }

    #[test]
    fn test_insert_replaces() {
        let ip = Ipv4Addr::new(192, 0, 2, 78);
        insert(ip, [1; 6]);
        insert(ip, [2; 6]);
        assert_eq!(lookup(ip), Some([2; 6]));
        remove(ip);
    }
}
