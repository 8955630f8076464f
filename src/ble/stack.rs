//! Port traits and wire-level types for the platform BLE host.
//!
//! The hub core never talks to a radio directly; connection establishment
//! and GATT primitives go through [`LinkStack`] and [`GattStack`] so the
//! firmware can bind them to its host stack and tests can script them.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Link-layer address of a peripheral, as reported by the scanner.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Addr(pub [u8; 6]);

/// Handle to an established link. Opaque outside the stack port.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

/// 128-bit attribute UUID in wire (little-endian) byte order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Uuid128(pub [u8; 16]);

impl Uuid128 {
    /// Builds a UUID on the Bluetooth base pattern
    /// `xxxxxxxx-0000-1000-8000-00805f9b34fb`.
    pub const fn from_u32(short: u32) -> Self {
        let s = short.to_le_bytes();
        Uuid128([
            0xfb, 0x34, 0x9b, 0x5f, 0x80, 0x00, 0x00, 0x80, 0x00, 0x10, 0x00, 0x00, s[0], s[1],
            s[2], s[3],
        ])
    }
}

/// Primary service exposed by every sensor node.
pub const SENSOR_SERVICE_UUID: Uuid128 = Uuid128::from_u32(0x0000_1000);

pub const READING_CHAR_UUID: Uuid128 = Uuid128::from_u32(0x0000_1001);
pub const BATTERY_CHAR_UUID: Uuid128 = Uuid128::from_u32(0x0000_1002);
pub const CONFIG_CHAR_UUID: Uuid128 = Uuid128::from_u32(0x0000_1003);
pub const CALIBRATION_CHAR_UUID: Uuid128 = Uuid128::from_u32(0x0000_1004);
pub const DIAGNOSTICS_CHAR_UUID: Uuid128 = Uuid128::from_u32(0x0000_1005);

/// Upper bound on characteristics one service enumeration may report.
pub const MAX_DISCOVERED_CHARS: usize = 16;

/// One characteristic reported by service discovery. The CCC descriptor
/// handle is present only when the peripheral actually exposes one; it is
/// discovered, never inferred from the value handle.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Characteristic {
    pub uuid: Uuid128,
    pub value_handle: u16,
    pub ccc_handle: Option<u16>,
}

/// Connection establishment and teardown primitives.
///
/// `disconnect` only requests teardown; completion arrives later through
/// the owner's connection-closed intake.
#[allow(async_fn_in_trait)]
pub trait LinkStack {
    async fn connect(&self, addr: Addr) -> Result<ConnHandle>;
    async fn disconnect(&self, conn: ConnHandle) -> Result<()>;
}

/// GATT client primitives scoped to one established connection.
///
/// `read` copies the attribute value into `buf` and returns its length.
/// `write` must resolve only once the peer has confirmed the write, not on
/// request submission. `write_ccc` flips the notification bit in the given
/// Client Characteristic Configuration descriptor.
#[allow(async_fn_in_trait)]
pub trait GattStack {
    async fn discover_characteristics(
        &self,
        conn: ConnHandle,
        service: &Uuid128,
    ) -> Result<Vec<Characteristic, MAX_DISCOVERED_CHARS>>;
    async fn read(&self, conn: ConnHandle, value_handle: u16, buf: &mut [u8]) -> Result<usize>;
    async fn write(&self, conn: ConnHandle, value_handle: u16, data: &[u8]) -> Result<()>;
    async fn write_ccc(&self, conn: ConnHandle, ccc_handle: u16, notify: bool) -> Result<()>;
}
