//! BLE central plumbing: the stack port, advertisement codecs, the
//! connection slot pool and the per-connection GATT client.

pub mod adv;
pub mod gatt;
pub mod pool;
pub mod stack;
