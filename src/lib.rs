//! Fleet-management core for a BLE central hub.
//!
//! The hub discovers a bounded fleet of industrial sensor peripherals,
//! connects to them on demand and runs administrative jobs against them
//! (config push, diagnostics pull, firmware update, reboot) on behalf of a
//! cellular co-processor reached over a framed bridge channel.
//!
//! Four components cooperate, each owning one bounded table behind its own
//! mutex:
//!
//! - [`registry::NodeRegistry`]: discovered/bound nodes keyed by address
//! - [`ble::pool::ConnectionPool`]: concurrent link slots
//! - [`ble::gatt::GattClient`]: per-connection protocol contexts
//! - [`jobs::JobQueue`]: the job table and its cooperative dispatcher
//!
//! [`hub::Hub`] wires them to the platform BLE host through the
//! [`ble::stack`] port traits and to the bridge through [`ipc`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]

// This module must come first so the others see its macros.
pub(crate) mod fmt;

pub mod ble;
pub mod error;
pub mod hub;
pub mod ipc;
pub mod jobs;
pub mod registry;

#[cfg(test)]
mod testutil;

pub use ble::gatt::{GattClient, Notification, Role, MAX_GATT_CONTEXTS};
pub use ble::pool::{ConnectionPool, MAX_CONNECTIONS};
pub use ble::stack::{Addr, Characteristic, ConnHandle, GattStack, LinkStack, Uuid128};
pub use error::{Error, Result};
pub use hub::Hub;
pub use jobs::{Job, JobKind, JobQueue, JobState, MAX_JOBS};
pub use registry::{NodeRecord, NodeRegistry, NodeState, MAX_NODES};
