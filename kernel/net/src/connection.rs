//! Transport connection table.
//!
//! Each transport keeps its active connections in a generation-checked arena:
//! sockets store an integer [`ConnHandle`] rather than a reference, and
//! dereferencing a handle after its connection was removed yields `None`.
//! Lookup by the `(remote_port, local_port)` pair serves the ingress path.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// Port accessors a connection type must expose for ingress lookup.
pub trait Endpoints {
    /// Our port.
    fn local_port(&self) -> u16;
    /// The peer's port.
    fn remote_port(&self) -> u16;
}

/// Stable handle to a table slot.
///
/// The generation is bumped every time a slot is reused, so a stale handle
/// can never resolve to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle {
    index: usize,
    generation: u64,
}

struct Slot<C> {
    generation: u64,
    conn: Option<Arc<C>>,
}

/// Arena of active connections for one transport.
pub struct ConnTable<C> {
    slots: RwLock<Vec<Slot<C>>>,
}

impl<C> ConnTable<C> {
    /// Create an empty table.
    pub const fn new() -> Self {
        ConnTable {
            slots: RwLock::new(Vec::new()),
        }
    }
}

impl<C: Endpoints> ConnTable<C> {
    /// Insert a connection, reusing a free slot when one exists.
    pub fn insert(&self, conn: Arc<C>) -> ConnHandle {
        let mut slots = self.slots.write();
        match slots.iter().position(|s| s.conn.is_none()) {
            Some(index) => {
                let slot = &mut slots[index];
                slot.generation += 1;
                slot.conn = Some(conn);
                ConnHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                slots.push(Slot {
                    generation: 1,
                    conn: Some(conn),
                });
                ConnHandle {
                    index: slots.len() - 1,
                    generation: 1,
                }
            }
        }
    }

    /// Resolve a handle; `None` once the connection was removed.
    pub fn get(&self, handle: ConnHandle) -> Option<Arc<C>> {
        let slots = self.slots.read();
        slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.conn.clone())
    }

    /// Remove a connection, returning it if the handle was still live.
    pub fn remove(&self, handle: ConnHandle) -> Option<Arc<C>> {
        let mut slots = self.slots.write();
        slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.conn.take())
    }

    /// Find the connection for an incoming segment, keyed by the peer's
    /// source port and our destination port.
    pub fn lookup(&self, remote_port: u16, local_port: u16) -> Option<Arc<C>> {
        let slots = self.slots.read();
        slots
            .iter()
            .filter_map(|s| s.conn.as_ref())
            .find(|c| c.remote_port() == remote_port && c.local_port() == local_port)
            .cloned()
    }

    /// Number of live connections.
    pub fn active(&self) -> usize {
        self.slots.read().iter().filter(|s| s.conn.is_some()).count()
    }
}

// ============================================================================
// Tests
// ============================================================================
