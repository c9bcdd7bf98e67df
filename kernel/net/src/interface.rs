//! Network interface registry.
//!
//! Each registered interface pairs a driver ([`NetDevice`]) with its layer-3
//! configuration (address, netmask, MTU).  Outbound traffic picks its
//! interface by destination through [`select_interface`]; ingress names its
//! interface by index when handing frames to the stack.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

use crate::device::{MacAddress, NetDevice, NetDeviceHandle, TxError};
use crate::ipv4::Ipv4Addr;
use crate::stack::net_stats;

// ============================================================================
// Interface
// ============================================================================

/// A configured network interface.
pub struct Interface {
    /// Registration index; ingress identifies interfaces by it.
    pub index: usize,
    /// Human-readable name (e.g. "eth0").
    pub name: String,
    /// MAC address, read from the device at registration.
    pub mac: MacAddress,
    /// Interface IPv4 address.
    pub ip: Ipv4Addr,
    /// On-link netmask.
    pub netmask: Ipv4Addr,
    /// Maximum transmission unit.
    pub mtu: usize,
    /// The underlying driver.
    device: NetDeviceHandle,
}

impl Interface {
    /// Whether `ip` is on this interface's subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let a = self.ip.octets();
        let b = ip.octets();
        let m = self.netmask.octets();
        (0..4).all(|i| a[i] & m[i] == b[i] & m[i])
    }

    /// Hand one frame to the driver.
    pub fn transmit(&self, frame: &[u8]) -> Result<(), TxError> {
        match self.device.lock().transmit(frame) {
            Ok(()) => {
                net_stats().inc_tx_frames();
                Ok(())
            }
            Err(e) => {
                net_stats().inc_tx_errors();
                klog!(Error, "net: transmit failed on {}: {:?}", self.name, e);
                Err(e)
            }
        }
    }

    /// Whether the underlying link is up.
    pub fn link_up(&self) -> bool {
        self.device.lock().link_status().up
    }
}

impl core::fmt::Debug for Interface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Interface")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("netmask", &self.netmask)
            .field("mtu", &self.mtu)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

lazy_static! {
    /// Global interface registry.
    static ref INTERFACES: RwLock<Vec<Arc<Interface>>> = RwLock::new(Vec::new());
}

/// Register a configured interface and return it.
pub fn register_interface(
    name: &str,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    mtu: usize,
    device: Box<dyn NetDevice>,
) -> Arc<Interface> {
    let mac = device.mac_address();
    let mut interfaces = INTERFACES.write();
    let interface = Arc::new(Interface {
        index: interfaces.len(),
        name: String::from(name),
        mac,
        ip,
        netmask,
        mtu,
        device: Arc::new(Mutex::new(device)),
    });
    interfaces.push(interface.clone());
    klog!(Info, "net: registered interface {} ({})", name, ip);
    interface
}

/// Get an interface by registration index.
pub fn interface_by_index(index: usize) -> Option<Arc<Interface>> {
    INTERFACES.read().get(index).cloned()
}

/// Select the outbound interface for `target_ip`.
///
/// Prefers the interface whose subnet contains the target; falls back to the
/// first registered interface (the default route).
pub fn select_interface(target_ip: Ipv4Addr) -> Option<Arc<Interface>> {
    let interfaces = INTERFACES.read();
    interfaces
        .iter()
        .find(|i| i.contains(target_ip))
        .or_else(|| interfaces.first())
        .cloned()
}

/// Number of registered interfaces.
pub fn interface_count() -> usize {
    INTERFACES.read().len()
}

// ============================================================================
// Configuration Snapshot
// ============================================================================

/// Point-in-time view of one interface's configuration.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub index: usize,
    pub name: String,
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: usize,
    pub link_up: bool,
}

/// Snapshot the configuration of every registered interface.
pub fn config_snapshot() -> Vec<InterfaceConfig> {
    INTERFACES
        .read()
        .iter()
        .map(|i| InterfaceConfig {
            index: i.index,
            name: i.name.clone(),
            mac: i.mac,
            ip: i.ip,
            netmask: i.netmask,
            mtu: i.mtu,
            link_up: i.link_up(),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn test_select_interface_prefers_subnet_match() {
        let net = testutil::test_net();
        let selected = select_interface(net.peer_ip).unwrap();
        assert_eq!(selected.index, net.iface.index);
        assert!(selected.contains(net.peer_ip));
    }

    #[test]
    fn test_select_interface_falls_back_to_default() {
        let _net = testutil::test_net();
        // Nothing is on 198.51.100.0/24; the default (first) interface wins.
        assert!(select_interface(Ipv4Addr::new(198, 51, 100, 9)).is_some());
    }

    #[test]
    fn test_config_snapshot_contains_interface() {
        let net = testutil::test_net();
        let snapshot = config_snapshot();
        let entry = snapshot.iter().find(|c| c.index == net.iface.index).unwrap();
        assert_eq!(entry.ip, net.local_ip);
        assert_eq!(entry.mtu, 1500);
        assert!(entry.link_up);
    }
}
