//! Shared test fixtures: a scriptable stack port and future drivers.

use core::cell::{Cell, RefCell};
use core::future::{pending, Future};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use heapless::Vec;

use crate::ble::stack::{
    Addr, Characteristic, ConnHandle, GattStack, LinkStack, Uuid128, BATTERY_CHAR_UUID,
    CALIBRATION_CHAR_UUID, CONFIG_CHAR_UUID, DIAGNOSTICS_CHAR_UUID, MAX_DISCOVERED_CHARS,
    READING_CHAR_UUID,
};
use crate::error::{Error, Result};
use crate::jobs::JOB_PAYLOAD_MAX;

pub use embassy_futures::block_on;

pub const CONN: ConnHandle = ConnHandle(1);

pub fn addr(n: u8) -> Addr {
    Addr([n, 0x11, 0x22, 0x33, 0x44, n])
}

/// Polls a pinned future exactly once against a no-op waker.
pub fn poll_once<F: Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    fut.poll(&mut cx)
}

/// Scripted stand-in for the platform BLE host. Counts every interaction
/// so tests can assert which calls reached the stack, and can be told to
/// fail or hang specific operations.
pub struct MockStack {
    pub chars: RefCell<Vec<Characteristic, MAX_DISCOVERED_CHARS>>,
    read_value: RefCell<Vec<u8, JOB_PAYLOAD_MAX>>,
    last_write_data: RefCell<Vec<u8, JOB_PAYLOAD_MAX>>,
    pub last_write_handle: Cell<u16>,
    pub last_ccc_handle: Cell<u16>,
    pub last_ccc_enable: Cell<bool>,

    pub connects: Cell<usize>,
    pub disconnects: Cell<usize>,
    pub discovers: Cell<usize>,
    pub reads: Cell<usize>,
    pub writes: Cell<usize>,
    pub ccc_writes: Cell<usize>,

    /// Fail the next N connects with `Stack(-5)`; `usize::MAX` fails all.
    pub fail_connects: Cell<usize>,
    pub fail_discovers: Cell<usize>,
    pub fail_writes: Cell<usize>,
    pub hang_connects: Cell<bool>,
    pub hang_reads: Cell<bool>,

    next_conn: Cell<u16>,
}

impl MockStack {
    pub const READING_VALUE: u16 = 0x0010;
    /// Deliberately not `READING_VALUE + 1`.
    pub const READING_CCC: u16 = 0x0021;

    pub fn new() -> Self {
        Self {
            chars: RefCell::new(Vec::new()),
            read_value: RefCell::new(Vec::new()),
            last_write_data: RefCell::new(Vec::new()),
            last_write_handle: Cell::new(0),
            last_ccc_handle: Cell::new(0),
            last_ccc_enable: Cell::new(false),
            connects: Cell::new(0),
            disconnects: Cell::new(0),
            discovers: Cell::new(0),
            reads: Cell::new(0),
            writes: Cell::new(0),
            ccc_writes: Cell::new(0),
            fail_connects: Cell::new(0),
            fail_discovers: Cell::new(0),
            fail_writes: Cell::new(0),
            hang_connects: Cell::new(false),
            hang_reads: Cell::new(false),
            next_conn: Cell::new(1),
        }
    }

    /// A stack scripted with the full sensor service: the five known roles
    /// plus two foreign characteristics discovery must skip. Only the
    /// Reading characteristic carries a CCC descriptor.
    pub fn with_sensor_service() -> Self {
        let stack = Self::new();
        {
            let mut chars = stack.chars.borrow_mut();
            let mut push = |uuid: Uuid128, value_handle: u16, ccc_handle: Option<u16>| {
                chars
                    .push(Characteristic {
                        uuid,
                        value_handle,
                        ccc_handle,
                    })
                    .unwrap();
            };
            push(READING_CHAR_UUID, Self::READING_VALUE, Some(Self::READING_CCC));
            push(BATTERY_CHAR_UUID, 0x0012, None);
            push(CONFIG_CHAR_UUID, 0x0014, None);
            push(CALIBRATION_CHAR_UUID, 0x0016, None);
            push(DIAGNOSTICS_CHAR_UUID, 0x0018, None);
            // foreign characteristics on the same service
            push(Uuid128::from_u32(0x0000_1999), 0x001a, Some(0x002b));
            push(Uuid128::from_u32(0x0000_2a00), 0x001c, None);
        }
        stack
    }

    pub fn set_read_value(&self, data: &[u8]) {
        let mut v = self.read_value.borrow_mut();
        v.clear();
        v.extend_from_slice(data).unwrap();
    }

    pub fn last_write(&self) -> Vec<u8, JOB_PAYLOAD_MAX> {
        self.last_write_data.borrow().clone()
    }

    fn take_failure(counter: &Cell<usize>) -> bool {
        let remaining = counter.get();
        if remaining == 0 {
            return false;
        }
        if remaining != usize::MAX {
            counter.set(remaining - 1);
        }
        true
    }
}

impl LinkStack for MockStack {
    async fn connect(&self, _addr: Addr) -> Result<ConnHandle> {
        self.connects.set(self.connects.get() + 1);
        if self.hang_connects.get() {
            pending::<()>().await;
        }
        if Self::take_failure(&self.fail_connects) {
            return Err(Error::Stack(-5));
        }
        let handle = self.next_conn.get();
        self.next_conn.set(handle + 1);
        Ok(ConnHandle(handle))
    }

    async fn disconnect(&self, _conn: ConnHandle) -> Result<()> {
        self.disconnects.set(self.disconnects.get() + 1);
        Ok(())
    }
}

impl GattStack for MockStack {
    async fn discover_characteristics(
        &self,
        _conn: ConnHandle,
        _service: &Uuid128,
    ) -> Result<Vec<Characteristic, MAX_DISCOVERED_CHARS>> {
        self.discovers.set(self.discovers.get() + 1);
        if Self::take_failure(&self.fail_discovers) {
            return Err(Error::Stack(-71));
        }
        Ok(self.chars.borrow().clone())
    }

    async fn read(&self, _conn: ConnHandle, _value_handle: u16, buf: &mut [u8]) -> Result<usize> {
        self.reads.set(self.reads.get() + 1);
        if self.hang_reads.get() {
            pending::<()>().await;
        }
        let value = self.read_value.borrow();
        let n = value.len().min(buf.len());
        buf[..n].copy_from_slice(&value[..n]);
        Ok(n)
    }

    async fn write(&self, _conn: ConnHandle, value_handle: u16, data: &[u8]) -> Result<()> {
        self.writes.set(self.writes.get() + 1);
        if Self::take_failure(&self.fail_writes) {
            return Err(Error::Stack(-71));
        }
        self.last_write_handle.set(value_handle);
        let mut last = self.last_write_data.borrow_mut();
        last.clear();
        last.extend_from_slice(data).map_err(|_| Error::InvalidArgument)?;
        Ok(())
    }

    async fn write_ccc(&self, _conn: ConnHandle, ccc_handle: u16, notify: bool) -> Result<()> {
        self.ccc_writes.set(self.ccc_writes.get() + 1);
        self.last_ccc_handle.set(ccc_handle);
        self.last_ccc_enable.set(notify);
        Ok(())
    }
}
