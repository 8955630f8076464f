//! Bounded pool of concurrent link slots.
//!
//! A slot is reserved before the link-establishment request goes out and
//! is released on the same call path when the request fails or times out,
//! so pool capacity can never leak to a failed connect. Slot transitions
//! are strictly Free → Reserved → Active → Free.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration};

use crate::ble::stack::{Addr, ConnHandle, LinkStack};
use crate::error::{Error, Result};

pub const MAX_CONNECTIONS: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum SlotState {
    Free,
    Reserved,
    Active,
}

#[derive(Clone, Copy)]
struct Slot {
    state: SlotState,
    conn: Option<ConnHandle>,
}

const FREE: Slot = Slot {
    state: SlotState::Free,
    conn: None,
};

pub struct ConnectionPool<M: RawMutex> {
    slots: Mutex<M, [Slot; MAX_CONNECTIONS]>,
}

impl<M: RawMutex> ConnectionPool<M> {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([FREE; MAX_CONNECTIONS]),
        }
    }

    /// Establishes a link to `addr`. Fails `ResourceExhausted` immediately,
    /// without blocking, when every slot is reserved or active. The
    /// deadline is enforced here around the stack call; the stack's own
    /// timeout is not trusted to fire.
    pub async fn connect<L: LinkStack>(
        &self,
        link: &L,
        addr: Addr,
        timeout: Duration,
    ) -> Result<ConnHandle> {
        let slot = {
            let mut slots = self.slots.lock().await;
            let Some(i) = slots.iter().position(|s| s.state == SlotState::Free) else {
                warn!("no free connection slots");
                return Err(Error::ResourceExhausted);
            };
            slots[i].state = SlotState::Reserved;
            i
        };

        // Link establishment runs outside the lock.
        match with_timeout(timeout, link.connect(addr)).await {
            Ok(Ok(conn)) => {
                let mut slots = self.slots.lock().await;
                slots[slot] = Slot {
                    state: SlotState::Active,
                    conn: Some(conn),
                };
                info!("link up {:?} in slot {}", conn, slot);
                Ok(conn)
            }
            Ok(Err(e)) => {
                self.release(slot).await;
                warn!("connect to {:?} failed: {:?}", addr, e);
                Err(e)
            }
            Err(_) => {
                self.release(slot).await;
                warn!("connect to {:?} timed out", addr);
                Err(Error::Timeout)
            }
        }
    }

    /// Requests link teardown. Completion is asynchronous and arrives via
    /// [`on_connection_closed`].
    ///
    /// [`on_connection_closed`]: ConnectionPool::on_connection_closed
    pub async fn disconnect<L: LinkStack>(&self, link: &L, conn: ConnHandle) -> Result<()> {
        link.disconnect(conn).await
    }

    /// Link-layer intake for a closed connection: frees the owning slot.
    /// Idempotent; duplicate or unknown handles are ignored and reported
    /// as `false`.
    pub async fn on_connection_closed(&self, conn: ConnHandle) -> bool {
        let mut slots = self.slots.lock().await;
        for (i, s) in slots.iter_mut().enumerate() {
            if s.conn == Some(conn) {
                debug!("slot {} freed for {:?}", i, conn);
                *s = FREE;
                return true;
            }
        }
        false
    }

    pub async fn get_active_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .iter()
            .filter(|s| s.state == SlotState::Active)
            .count()
    }

    /// Slots reserved by connect attempts still in flight.
    pub async fn get_reserved_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .iter()
            .filter(|s| s.state == SlotState::Reserved)
            .count()
    }

    async fn release(&self, slot: usize) {
        let mut slots = self.slots.lock().await;
        slots[slot] = FREE;
    }
}

#[cfg(test)]
mod tests {
    use core::pin::pin;
    use core::task::Poll;

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::testutil::{addr, block_on, poll_once, MockStack};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn pool() -> ConnectionPool<NoopRawMutex> {
        ConnectionPool::new()
    }

    #[test]
    fn connect_activates_a_slot() {
        let stack = MockStack::new();
        let pool = pool();
        block_on(async {
            let conn = pool.connect(&stack, addr(1), TIMEOUT).await.unwrap();
            assert_eq!(pool.get_active_count().await, 1);
            assert!(pool.on_connection_closed(conn).await);
            assert_eq!(pool.get_active_count().await, 0);
            // duplicate close events are silently ignored
            assert!(!pool.on_connection_closed(conn).await);
        });
    }

    #[test]
    fn fourth_concurrent_connect_fails_without_blocking() {
        let stack = MockStack::new();
        stack.hang_connects.set(true);
        let pool = pool();

        let mut c1 = pin!(pool.connect(&stack, addr(1), TIMEOUT));
        let mut c2 = pin!(pool.connect(&stack, addr(2), TIMEOUT));
        let mut c3 = pin!(pool.connect(&stack, addr(3), TIMEOUT));
        assert!(poll_once(c1.as_mut()).is_pending());
        assert!(poll_once(c2.as_mut()).is_pending());
        assert!(poll_once(c3.as_mut()).is_pending());
        assert_eq!(block_on(pool.get_reserved_count()), MAX_CONNECTIONS);

        // the pool is exhausted: the fourth attempt fails immediately
        let mut c4 = pin!(pool.connect(&stack, addr(4), TIMEOUT));
        assert_eq!(
            poll_once(c4.as_mut()),
            Poll::Ready(Err(Error::ResourceExhausted))
        );
    }

    #[test]
    fn failed_connect_releases_its_slot() {
        let stack = MockStack::new();
        stack.fail_connects.set(1);
        let pool = pool();
        block_on(async {
            assert!(matches!(
                pool.connect(&stack, addr(1), TIMEOUT).await,
                Err(Error::Stack(_))
            ));
            assert_eq!(pool.get_active_count().await, 0);
            assert_eq!(pool.get_reserved_count().await, 0);
            // the freed slot is immediately usable again
            pool.connect(&stack, addr(1), TIMEOUT).await.unwrap();
            assert_eq!(pool.get_active_count().await, 1);
        });
    }

    #[test]
    fn close_frees_capacity_for_a_new_link() {
        let stack = MockStack::new();
        let pool = pool();
        block_on(async {
            let mut conns = heapless::Vec::<ConnHandle, MAX_CONNECTIONS>::new();
            for i in 0..MAX_CONNECTIONS as u8 {
                conns
                    .push(pool.connect(&stack, addr(i), TIMEOUT).await.unwrap())
                    .unwrap();
            }
            assert_eq!(
                pool.connect(&stack, addr(9), TIMEOUT).await,
                Err(Error::ResourceExhausted)
            );
            assert!(pool.on_connection_closed(conns[0]).await);
            pool.connect(&stack, addr(9), TIMEOUT).await.unwrap();
            assert_eq!(pool.get_active_count().await, MAX_CONNECTIONS);
        });
    }
}
