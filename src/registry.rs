//! Bounded table of discovered and bound sensor nodes, keyed by link-layer
//! address.
//!
//! The table is the single source of truth for what the hub knows about
//! each node: lifecycle state, the live connection handle if any, and the
//! latest telemetry gleaned from advertisements, reads and notifications.
//! One mutex guards the table; critical sections cover table access only,
//! never calls into other components or the stack.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant};
use heapless::String;

use crate::ble::adv;
use crate::ble::stack::{Addr, ConnHandle};
use crate::error::{Error, Result};

pub const MAX_NODES: usize = 32;
pub const NODE_ID_LEN: usize = 16;

/// Lifecycle of a node as seen by the hub.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeState {
    Discovered,
    Connected,
    Bound,
    Disconnected,
    Fault,
}

/// Everything tracked about one sensor node.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeRecord {
    pub addr: Addr,
    pub node_id: [u8; NODE_ID_LEN],
    pub state: NodeState,
    pub conn: Option<ConnHandle>,
    pub rssi: i8,
    pub last_seen: Instant,
    pub battery_level: u8,
    pub latest_reading: f32,
    pub fault_flags: u32,
    pub sampling_interval: u16,
    pub bound: bool,
    pub name: String<32>,
    pub firmware_version: u32,
}

impl NodeRecord {
    fn new(addr: Addr, now: Instant) -> Self {
        Self {
            addr,
            node_id: [0; NODE_ID_LEN],
            state: NodeState::Discovered,
            conn: None,
            rssi: 0,
            last_seen: now,
            battery_level: 0,
            latest_reading: 0.0,
            fault_flags: 0,
            sampling_interval: 0,
            bound: false,
            name: String::new(),
            firmware_version: 0,
        }
    }
}

/// Bounded registry of nodes. Handles returned by [`add_or_update`] are
/// stable slot indices, valid until the slot is evicted.
///
/// [`add_or_update`]: NodeRegistry::add_or_update
pub struct NodeRegistry<M: RawMutex> {
    nodes: Mutex<M, [Option<NodeRecord>; MAX_NODES]>,
}

const NO_NODE: Option<NodeRecord> = None;

fn find_by_addr(nodes: &[Option<NodeRecord>; MAX_NODES], addr: Addr) -> Option<usize> {
    nodes
        .iter()
        .position(|n| n.as_ref().map(|n| n.addr) == Some(addr))
}

impl<M: RawMutex> NodeRegistry<M> {
    pub const fn new() -> Self {
        Self {
            nodes: Mutex::new([NO_NODE; MAX_NODES]),
        }
    }

    /// Ingests one scan sighting. Allocates a slot for a new address
    /// (`ResourceExhausted` when the table is full), always refreshes
    /// rssi and last-seen, and captures the short id plus any structured
    /// advertisement fields when `adv_data` is non-empty. Returns the
    /// node's slot index.
    pub async fn add_or_update(&self, addr: Addr, rssi: i8, adv_data: &[u8]) -> Result<usize> {
        let now = Instant::now();
        let mut nodes = self.nodes.lock().await;

        let index = match find_by_addr(&nodes, addr) {
            Some(i) => i,
            None => {
                let Some(slot) = nodes.iter().position(|n| n.is_none()) else {
                    warn!("node table full, dropping {:?}", addr);
                    return Err(Error::ResourceExhausted);
                };
                nodes[slot] = Some(NodeRecord::new(addr, now));
                info!("new node {:?} in slot {}", addr, slot);
                slot
            }
        };

        if let Some(rec) = nodes[index].as_mut() {
            rec.rssi = rssi;
            rec.last_seen = now;
            if !adv_data.is_empty() {
                let n = adv_data.len().min(NODE_ID_LEN);
                rec.node_id[..n].copy_from_slice(&adv_data[..n]);
                if let Some(parsed) = adv::parse_advertisement(adv_data) {
                    rec.battery_level = parsed.battery_percent;
                    rec.latest_reading = parsed.last_reading;
                    rec.fault_flags |= parsed.fault_flags as u32;
                }
            }
        }
        Ok(index)
    }

    /// Linear lookup by address; returns a snapshot of the record.
    pub async fn get_by_addr(&self, addr: Addr) -> Option<NodeRecord> {
        let nodes = self.nodes.lock().await;
        find_by_addr(&nodes, addr).and_then(|i| nodes[i].clone())
    }

    /// Direct lookup by the slot index returned from `add_or_update`.
    pub async fn get_by_handle(&self, index: usize) -> Option<NodeRecord> {
        if index >= MAX_NODES {
            return None;
        }
        self.nodes.lock().await[index].clone()
    }

    /// Lookup by live connection handle; used by the disconnect intake.
    pub async fn get_by_conn(&self, conn: ConnHandle) -> Option<NodeRecord> {
        let nodes = self.nodes.lock().await;
        nodes
            .iter()
            .flatten()
            .find(|n| n.conn == Some(conn))
            .cloned()
    }

    /// Records a link event: `Some(handle)` moves the node to Connected,
    /// `None` to Disconnected. The bound flag is untouched either way.
    pub async fn update_connection(&self, addr: Addr, conn: Option<ConnHandle>) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            rec.conn = conn;
            rec.state = if conn.is_some() {
                NodeState::Connected
            } else {
                NodeState::Disconnected
            };
        }
        Ok(())
    }

    /// Marks the node as bound to this hub. Only legal from Discovered,
    /// Connected or (idempotently) Bound.
    pub async fn bind(&self, addr: Addr) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            match rec.state {
                NodeState::Discovered | NodeState::Connected | NodeState::Bound => {
                    rec.bound = true;
                    rec.state = NodeState::Bound;
                    info!("node {:?} bound", addr);
                }
                NodeState::Disconnected | NodeState::Fault => return Err(Error::InvalidState),
            }
        }
        Ok(())
    }

    /// Clears the bound flag; the node falls back to Connected or
    /// Discovered depending on whether a link is still up.
    pub async fn unbind(&self, addr: Addr) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            rec.bound = false;
            rec.state = if rec.conn.is_some() {
                NodeState::Connected
            } else {
                NodeState::Discovered
            };
        }
        Ok(())
    }

    pub async fn update_reading(&self, addr: Addr, reading: f32) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            rec.latest_reading = reading;
            rec.last_seen = Instant::now();
        }
        Ok(())
    }

    pub async fn update_battery(&self, addr: Addr, battery_level: u8) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            rec.battery_level = battery_level;
        }
        Ok(())
    }

    /// Accumulates fault flags OR-wise and returns the merged set. Whether
    /// the node should transition to Fault is the caller's policy, applied
    /// through [`mark_fault`].
    ///
    /// [`mark_fault`]: NodeRegistry::mark_fault
    pub async fn update_faults(&self, addr: Addr, fault_flags: u32) -> Result<u32> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        let mut merged = 0;
        if let Some(rec) = nodes[i].as_mut() {
            rec.fault_flags |= fault_flags;
            merged = rec.fault_flags;
        }
        Ok(merged)
    }

    pub async fn mark_fault(&self, addr: Addr) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            rec.state = NodeState::Fault;
            warn!("node {:?} marked faulted, flags {:#x}", addr, rec.fault_flags);
        }
        Ok(())
    }

    /// Records identity details learned after connecting (device name,
    /// firmware revision).
    pub async fn set_identity(&self, addr: Addr, name: &str, firmware_version: u32) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let i = find_by_addr(&nodes, addr).ok_or(Error::NotFound)?;
        if let Some(rec) = nodes[i].as_mut() {
            rec.name.clear();
            let n = name.len().min(rec.name.capacity());
            // Truncation on a char boundary keeps the copy infallible.
            if let Some(prefix) = name.get(..n) {
                let _ = rec.name.push_str(prefix);
            }
            rec.firmware_version = firmware_version;
        }
        Ok(())
    }

    pub async fn get_count(&self) -> usize {
        self.nodes.lock().await.iter().flatten().count()
    }

    pub async fn get_connected_count(&self) -> usize {
        self.nodes
            .lock()
            .await
            .iter()
            .flatten()
            .filter(|n| n.state == NodeState::Connected)
            .count()
    }

    /// Evicts entries that are neither bound nor connected and have not
    /// been seen within `max_age`. Returns the number of slots freed.
    pub async fn clear_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut nodes = self.nodes.lock().await;
        let mut evicted = 0;
        for slot in nodes.iter_mut() {
            if let Some(rec) = slot {
                if !rec.bound && rec.conn.is_none() && now.duration_since(rec.last_seen) >= max_age
                {
                    debug!("evicting stale node {:?}", rec.addr);
                    *slot = None;
                    evicted += 1;
                }
            }
        }
        evicted
    }
}
