//! Per-connection GATT protocol state and operations.
//!
//! Each live connection gets one context from a bounded pool. A context
//! caches the attribute handles resolved by service discovery (keyed by
//! semantic role) and tracks the single operation allowed in flight per
//! connection. Contexts are released by explicit unsubscribe or, always,
//! when the link drops.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use heapless::Vec;

use crate::ble::stack::{
    ConnHandle, GattStack, Uuid128, BATTERY_CHAR_UUID, CALIBRATION_CHAR_UUID, CONFIG_CHAR_UUID,
    DIAGNOSTICS_CHAR_UUID, READING_CHAR_UUID, SENSOR_SERVICE_UUID,
};
use crate::error::{Error, Result};

pub const MAX_GATT_CONTEXTS: usize = 3;

/// Largest attribute value carried through the notification channel.
pub const GATT_VALUE_MAX: usize = 64;

const NOTIFICATION_QUEUE: usize = 8;

/// Semantic category a discovered characteristic maps to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Reading,
    Battery,
    Config,
    Calibration,
    Diagnostics,
}

impl Role {
    pub const COUNT: usize = 5;

    const fn index(self) -> usize {
        match self {
            Role::Reading => 0,
            Role::Battery => 1,
            Role::Config => 2,
            Role::Calibration => 3,
            Role::Diagnostics => 4,
        }
    }

    fn from_uuid(uuid: &Uuid128) -> Option<Role> {
        if *uuid == READING_CHAR_UUID {
            Some(Role::Reading)
        } else if *uuid == BATTERY_CHAR_UUID {
            Some(Role::Battery)
        } else if *uuid == CONFIG_CHAR_UUID {
            Some(Role::Config)
        } else if *uuid == CALIBRATION_CHAR_UUID {
            Some(Role::Calibration)
        } else if *uuid == DIAGNOSTICS_CHAR_UUID {
            Some(Role::Diagnostics)
        } else {
            None
        }
    }

    pub const fn writable(self) -> bool {
        matches!(self, Role::Config | Role::Calibration)
    }
}

/// Attribute handles cached for one resolved role. The CCC handle is only
/// present when discovery reported the descriptor.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharHandles {
    pub value: u16,
    pub ccc: Option<u16>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpKind {
    Read,
    Write,
}

struct GattContext {
    conn: ConnHandle,
    handles: [Option<CharHandles>; Role::COUNT],
    busy: Option<OpKind>,
    subscribed: bool,
}

impl GattContext {
    fn new(conn: ConnHandle) -> Self {
        Self {
            conn,
            handles: [None; Role::COUNT],
            busy: None,
            subscribed: false,
        }
    }
}

/// One notification payload delivered by a subscribed peripheral.
#[derive(Clone, Debug)]
pub struct Notification {
    pub conn: ConnHandle,
    pub data: Vec<u8, GATT_VALUE_MAX>,
}

type Contexts = [Option<GattContext>; MAX_GATT_CONTEXTS];

fn lookup(contexts: &Contexts, conn: ConnHandle) -> Option<usize> {
    contexts
        .iter()
        .position(|c| c.as_ref().map(|c| c.conn) == Some(conn))
}

fn ensure(contexts: &mut Contexts, conn: ConnHandle) -> Result<usize> {
    if let Some(i) = lookup(contexts, conn) {
        return Ok(i);
    }
    let Some(i) = contexts.iter().position(|c| c.is_none()) else {
        warn!("gatt context pool full");
        return Err(Error::ResourceExhausted);
    };
    contexts[i] = Some(GattContext::new(conn));
    Ok(i)
}

pub struct GattClient<M: RawMutex> {
    contexts: Mutex<M, Contexts>,
    notifications: Channel<M, Notification, NOTIFICATION_QUEUE>,
}

const NO_CTX: Option<GattContext> = None;

impl<M: RawMutex> GattClient<M> {
    pub const fn new() -> Self {
        Self {
            contexts: Mutex::new([NO_CTX; MAX_GATT_CONTEXTS]),
            notifications: Channel::new(),
        }
    }

    /// Idempotently tracks `conn`. Fails `ResourceExhausted` when the pool
    /// is full and the connection is not already tracked.
    pub async fn get_or_create_context(&self, conn: ConnHandle) -> Result<()> {
        let mut contexts = self.contexts.lock().await;
        ensure(&mut contexts, conn).map(|_| ())
    }

    /// Whether discovery has resolved at least one role on this connection.
    pub async fn has_handles(&self, conn: ConnHandle) -> bool {
        let contexts = self.contexts.lock().await;
        match lookup(&contexts, conn) {
            Some(i) => contexts[i]
                .as_ref()
                .is_some_and(|c| c.handles.iter().any(|h| h.is_some())),
            None => false,
        }
    }

    /// Enumerates the sensor service and caches the handles of every
    /// characteristic matching a known role; characteristics outside the
    /// role set are skipped. Resolves exactly once, with the number of
    /// roles cached, or with the stack's error if enumeration aborts
    /// (previously cached handles stay intact).
    pub async fn discover<G: GattStack>(&self, stack: &G, conn: ConnHandle) -> Result<u8> {
        {
            let mut contexts = self.contexts.lock().await;
            ensure(&mut contexts, conn)?;
        }

        // Enumeration runs without the context lock held.
        let chars = stack
            .discover_characteristics(conn, &SENSOR_SERVICE_UUID)
            .await?;

        let mut contexts = self.contexts.lock().await;
        // The link may have dropped while enumeration was in flight.
        let Some(i) = lookup(&contexts, conn) else {
            return Err(Error::NotFound);
        };
        let Some(ctx) = contexts[i].as_mut() else {
            return Err(Error::NotFound);
        };
        let mut matched: u8 = 0;
        for ch in chars.iter() {
            if let Some(role) = Role::from_uuid(&ch.uuid) {
                ctx.handles[role.index()] = Some(CharHandles {
                    value: ch.value_handle,
                    ccc: ch.ccc_handle,
                });
                matched += 1;
                debug!("cached {:?} at handle {}", role, ch.value_handle);
            }
        }
        info!("discovery complete on {:?}, {} roles", conn, matched);
        Ok(matched)
    }

    /// Reads one attribute value into `buf`, returning its length.
    /// `NotFound` when the role is unresolved (no stack interaction);
    /// `Busy` while another read or write is outstanding on this
    /// connection.
    pub async fn read<G: GattStack>(
        &self,
        stack: &G,
        conn: ConnHandle,
        role: Role,
        buf: &mut [u8],
    ) -> Result<usize> {
        let handle = self.begin_op(conn, role, OpKind::Read).await?;
        let res = stack.read(conn, handle, buf).await;
        self.end_op(conn).await;
        res
    }

    /// Writes an attribute value. The role must be Config or Calibration
    /// (`NotFound` otherwise). Resolves only once the stack reports the
    /// peer's write confirmation; same `Busy` rule as [`read`].
    ///
    /// [`read`]: GattClient::read
    pub async fn write<G: GattStack>(
        &self,
        stack: &G,
        conn: ConnHandle,
        role: Role,
        data: &[u8],
    ) -> Result<()> {
        if !role.writable() {
            return Err(Error::NotFound);
        }
        let handle = self.begin_op(conn, role, OpKind::Write).await?;
        let res = stack.write(conn, handle, data).await;
        self.end_op(conn).await;
        res
    }

    /// Enables notifications on the Reading characteristic. Fails
    /// `NotFound` for any other role, when the role is unresolved, or when
    /// discovery reported no CCC descriptor for it.
    pub async fn subscribe<G: GattStack>(
        &self,
        stack: &G,
        conn: ConnHandle,
        role: Role,
    ) -> Result<()> {
        if role != Role::Reading {
            return Err(Error::NotFound);
        }
        let ccc = {
            let mut contexts = self.contexts.lock().await;
            let i = ensure(&mut contexts, conn)?;
            let Some(ctx) = contexts[i].as_ref() else {
                return Err(Error::NotFound);
            };
            let Some(handles) = ctx.handles[role.index()] else {
                return Err(Error::NotFound);
            };
            // The descriptor handle comes from discovery only.
            let Some(ccc) = handles.ccc else {
                warn!("no CCC descriptor discovered for {:?}", role);
                return Err(Error::NotFound);
            };
            ccc
        };

        stack.write_ccc(conn, ccc, true).await?;

        let mut contexts = self.contexts.lock().await;
        let Some(i) = lookup(&contexts, conn) else {
            return Err(Error::NotFound);
        };
        match contexts[i].as_mut() {
            Some(ctx) => {
                ctx.subscribed = true;
                info!("subscribed on {:?}", conn);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Intake for a delivered notification. Returns whether the payload
    /// was accepted into the channel (the connection is tracked and
    /// subscribed, and the queue had room).
    pub async fn on_notification(&self, conn: ConnHandle, data: &[u8]) -> bool {
        {
            let contexts = self.contexts.lock().await;
            let subscribed = lookup(&contexts, conn)
                .and_then(|i| contexts[i].as_ref())
                .is_some_and(|c| c.subscribed);
            if !subscribed {
                return false;
            }
        }
        let Ok(payload) = Vec::from_slice(data) else {
            warn!("notification payload too large, dropped");
            return false;
        };
        // Dropped rather than blocking when the consumer falls behind.
        let accepted = self
            .notifications
            .try_send(Notification {
                conn,
                data: payload,
            })
            .is_ok();
        if !accepted {
            warn!("notification queue full, payload dropped");
        }
        accepted
    }

    /// Next notification accepted by [`on_notification`], in delivery
    /// order across all subscribed connections.
    ///
    /// [`on_notification`]: GattClient::on_notification
    pub async fn next_notification(&self) -> Notification {
        self.notifications.receive().await
    }

    /// Requests notification termination and releases the connection's
    /// context. A failed disable write is logged but does not keep the
    /// context alive; the link is usually already gone.
    pub async fn unsubscribe<G: GattStack>(&self, stack: &G, conn: ConnHandle) -> Result<()> {
        let ccc = {
            let contexts = self.contexts.lock().await;
            let Some(i) = lookup(&contexts, conn) else {
                return Err(Error::NotFound);
            };
            contexts[i].as_ref().and_then(|ctx| {
                if ctx.subscribed {
                    ctx.handles[Role::Reading.index()].and_then(|h| h.ccc)
                } else {
                    None
                }
            })
        };

        if let Some(ccc) = ccc {
            if let Err(e) = stack.write_ccc(conn, ccc, false).await {
                warn!("notification disable failed on {:?}: {:?}", conn, e);
            }
        }
        self.release(conn).await;
        Ok(())
    }

    /// Link-layer intake for a closed connection: releases any context
    /// still allocated to it. Idempotent.
    pub async fn on_connection_closed(&self, conn: ConnHandle) -> bool {
        self.release(conn).await
    }

    async fn release(&self, conn: ConnHandle) -> bool {
        let mut contexts = self.contexts.lock().await;
        match lookup(&contexts, conn) {
            Some(i) => {
                contexts[i] = None;
                debug!("context released for {:?}", conn);
                true
            }
            None => false,
        }
    }

    async fn begin_op(&self, conn: ConnHandle, role: Role, kind: OpKind) -> Result<u16> {
        let mut contexts = self.contexts.lock().await;
        let i = ensure(&mut contexts, conn)?;
        let Some(ctx) = contexts[i].as_mut() else {
            return Err(Error::NotFound);
        };
        let Some(handles) = ctx.handles[role.index()] else {
            return Err(Error::NotFound);
        };
        if ctx.busy.is_some() {
            return Err(Error::Busy);
        }
        ctx.busy = Some(kind);
        Ok(handles.value)
    }

    async fn end_op(&self, conn: ConnHandle) {
        let mut contexts = self.contexts.lock().await;
        if let Some(i) = lookup(&contexts, conn) {
            if let Some(ctx) = contexts[i].as_mut() {
                ctx.busy = None;
            }
        }
    }
}
