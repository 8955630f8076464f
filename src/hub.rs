//! Orchestrator owning the fleet tables and fanning wire events into them.
//!
//! The hub holds explicitly constructed instances of the registry, the
//! connection pool, the GATT client and the job queue; nothing here is
//! process-wide state. Scan reports, link closures and notifications come
//! in through the `handle_*`/`on_*` intakes, job traffic flows to and from
//! the bridge process as typed [`ipc::Message`]s.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};

use crate::ble::adv;
use crate::ble::gatt::{GattClient, Notification, Role};
use crate::ble::pool::ConnectionPool;
use crate::ble::stack::{Addr, ConnHandle, GattStack, LinkStack};
use crate::error::Result;
use crate::ipc;
use crate::jobs::{Job, JobKind, JobQueue, JobState};
use crate::registry::NodeRegistry;

/// Outbound bridge messages buffered until the bridge drains them.
const BRIDGE_QUEUE: usize = 8;

/// A node is marked faulted once this many distinct fault bits accumulate.
pub const FAULT_FLAG_LIMIT: u32 = 3;

/// Discovered-but-idle nodes are evicted after this long unseen.
const NODE_STALE_AGE: Duration = Duration::from_secs(300);

/// Cadence of the stale sweep inside [`Hub::run`].
const SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Idle pacing between dispatch polls inside [`Hub::run`].
const DISPATCH_IDLE_PERIOD: Duration = Duration::from_millis(500);

pub struct Hub<M: RawMutex, S> {
    stack: S,
    registry: NodeRegistry<M>,
    pool: ConnectionPool<M>,
    gatt: GattClient<M>,
    jobs: JobQueue<M>,
    bridge_tx: Channel<M, ipc::Message, BRIDGE_QUEUE>,
}

impl<M, S> Hub<M, S>
where
    M: RawMutex,
    S: LinkStack + GattStack,
{
    pub fn new(stack: S) -> Self {
        Self {
            stack,
            registry: NodeRegistry::new(),
            pool: ConnectionPool::new(),
            gatt: GattClient::new(),
            jobs: JobQueue::new(),
            bridge_tx: Channel::new(),
        }
    }

    pub fn registry(&self) -> &NodeRegistry<M> {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    pub fn gatt(&self) -> &GattClient<M> {
        &self.gatt
    }

    /// Scanner intake: one discovered-peer event. First sightings are
    /// announced to the bridge.
    pub async fn handle_scan_report(&self, addr: Addr, rssi: i8, adv_data: &[u8]) -> Result<usize> {
        let known = self.registry.get_by_addr(addr).await.is_some();
        let index = self.registry.add_or_update(addr, rssi, adv_data).await?;
        if !known {
            let parsed = adv::parse_advertisement(adv_data);
            self.emit(ipc::Message::NodeDiscovered(ipc::NodeDiscovered {
                addr,
                rssi,
                battery_percent: parsed.map_or(0, |a| a.battery_percent),
                last_reading: parsed.map_or(0.0, |a| a.last_reading),
                fault_flags: parsed.map_or(0, |a| a.fault_flags),
            }));
        }
        Ok(index)
    }

    pub async fn enqueue_job(&self, kind: JobKind, target: Addr, payload: &[u8]) -> Result<u32> {
        self.jobs.enqueue(kind, target, payload).await
    }

    pub async fn cancel_job(&self, job_id: u32) -> Result<()> {
        self.jobs.cancel(job_id).await
    }

    pub async fn job_status(&self, job_id: u32) -> Option<Job> {
        self.jobs.get(job_id).await
    }

    pub async fn take_job_result(&self, job_id: u32) -> Option<Job> {
        self.jobs.take_result(job_id).await
    }

    pub async fn pending_jobs(&self) -> usize {
        self.jobs.get_pending_count().await
    }

    /// One cooperative dispatch step. When the stepped job settles, its
    /// result is announced to the bridge.
    pub async fn dispatch_step(&self) -> Option<u32> {
        let id = self
            .jobs
            .dispatch_step(&self.registry, &self.pool, &self.gatt, &self.stack)
            .await?;
        if let Some(job) = self.jobs.get(id).await {
            if matches!(job.state, JobState::Completed | JobState::Failed) {
                self.emit(ipc::Message::JobResult(ipc::JobResult {
                    job_id: id,
                    state: job.state,
                    result_code: job.result_code,
                }));
            }
        }
        Some(id)
    }

    /// Link-layer intake: a connection closed. Frees the pool slot,
    /// releases any GATT context and moves the node to Disconnected.
    pub async fn on_connection_closed(&self, conn: ConnHandle) {
        self.gatt.on_connection_closed(conn).await;
        self.pool.on_connection_closed(conn).await;
        if let Some(node) = self.registry.get_by_conn(conn).await {
            let _ = self.registry.update_connection(node.addr, None).await;
            info!("node {:?} disconnected", node.addr);
        }
    }

    /// Notification intake: routes the payload through the GATT client
    /// and, when it parses as a reading, into the registry and out to the
    /// bridge as telemetry.
    pub async fn on_notification(&self, conn: ConnHandle, data: &[u8]) {
        if !self.gatt.on_notification(conn, data).await {
            return;
        }
        let Some(node) = self.registry.get_by_conn(conn).await else {
            return;
        };
        if let Some(reading) = adv::parse_reading(data) {
            let _ = self.registry.update_reading(node.addr, reading.value).await;
            self.emit(ipc::Message::NodeTelemetry(ipc::NodeTelemetry {
                addr: node.addr,
                timestamp: reading.timestamp,
                value: reading.value,
                quality: reading.quality,
                battery_percent: node.battery_level,
                fault_flags: node.fault_flags,
                rssi: node.rssi,
            }));
        }
    }

    /// Accumulates fault flags for a node and applies the hub's fault
    /// policy: past [`FAULT_FLAG_LIMIT`] distinct bits the node is marked
    /// faulted.
    pub async fn report_faults(&self, addr: Addr, fault_flags: u32) -> Result<()> {
        let merged = self.registry.update_faults(addr, fault_flags).await?;
        if merged.count_ones() >= FAULT_FLAG_LIMIT {
            self.registry.mark_fault(addr).await?;
        }
        Ok(())
    }

    /// Awaitable consumption of subscribed readings, in delivery order.
    pub async fn next_notification(&self) -> Notification {
        self.gatt.next_notification().await
    }

    /// Next outbound message for the bridge process to frame and relay.
    pub async fn next_bridge_msg(&self) -> ipc::Message {
        self.bridge_tx.receive().await
    }

    pub fn try_next_bridge_msg(&self) -> Option<ipc::Message> {
        self.bridge_tx.try_receive().ok()
    }

    /// Bridge intake: one validated frame from the co-processor. Job
    /// requests are queued and acknowledged; twin updates materialize as
    /// config push jobs.
    pub async fn handle_bridge_frame(&self, raw: &[u8]) -> Result<()> {
        let msg = ipc::Message::decode(raw)?;
        match msg {
            ipc::Message::JobRequest(req) => {
                let (job_id, state, result_code) =
                    match self.enqueue_job(req.kind, req.target, &req.payload).await {
                        Ok(id) => (id, JobState::Queued, 0),
                        Err(e) => {
                            warn!("bridge job request rejected: {:?}", e);
                            (0, JobState::Failed, e.code())
                        }
                    };
                self.emit(ipc::Message::JobResult(ipc::JobResult {
                    job_id,
                    state,
                    result_code,
                }));
            }
            ipc::Message::TwinUpdate(update) => {
                let res = self
                    .enqueue_job(JobKind::PushConfig, update.target, &update.config)
                    .await;
                if let Err(e) = res {
                    warn!("twin update for {:?} dropped: {:?}", update.target, e);
                }
            }
            other => {
                // Outbound-only traffic echoed back at us is ignored.
                warn!("unexpected inbound bridge message {:?}", other.msg_type());
            }
        }
        Ok(())
    }

    /// Firmware-style forever loop: drain the queue, sweep stale nodes,
    /// idle-pace in between. Never required by hosted callers, which drive
    /// [`dispatch_step`] themselves.
    ///
    /// [`dispatch_step`]: Hub::dispatch_step
    pub async fn run(&self) -> ! {
        info!("hub core started");
        let mut last_sweep = Instant::now();
        loop {
            let stepped = self.dispatch_step().await.is_some();
            if !stepped {
                Timer::after(DISPATCH_IDLE_PERIOD).await;
            }
            if last_sweep.elapsed() >= SWEEP_PERIOD {
                let evicted = self.registry.clear_stale(NODE_STALE_AGE).await;
                if evicted > 0 {
                    info!("evicted {} stale nodes", evicted);
                }
                last_sweep = Instant::now();
            }
        }
    }

    fn emit(&self, msg: ipc::Message) {
        if self.bridge_tx.try_send(msg).is_err() {
            warn!("bridge queue full, message dropped");
        }
    }

    /// Binds a node to this hub. The surrounding commissioning flow
    /// (identity exchange, persistence) lives with the storage shim.
    pub async fn bind_node(&self, addr: Addr) -> Result<()> {
        self.registry.bind(addr).await
    }

    pub async fn unbind_node(&self, addr: Addr) -> Result<()> {
        self.registry.unbind(addr).await
    }

    /// Explicit teardown of a node's link, e.g. after commissioning ends.
    pub async fn disconnect_node(&self, addr: Addr) -> Result<()> {
        let node = self
            .registry
            .get_by_addr(addr)
            .await
            .ok_or(crate::error::Error::NotFound)?;
        let conn = node.conn.ok_or(crate::error::Error::InvalidState)?;
        self.pool.disconnect(&self.stack, conn).await
    }

    /// Subscribes to a connected node's reading stream.
    pub async fn subscribe_readings(&self, addr: Addr) -> Result<()> {
        let node = self
            .registry
            .get_by_addr(addr)
            .await
            .ok_or(crate::error::Error::NotFound)?;
        let conn = node.conn.ok_or(crate::error::Error::InvalidState)?;
        self.gatt.get_or_create_context(conn).await?;
        if !self.gatt.has_handles(conn).await {
            self.gatt.discover(&self.stack, conn).await?;
        }
        self.gatt.subscribe(&self.stack, conn, Role::Reading).await
    }
}
