//! Bounded queue of administrative jobs and the cooperative dispatcher.
//!
//! Jobs target a node by address and are executed one at a time by
//! [`dispatch_step`], which drives the registry, connection pool and GATT
//! client in sequence. The job-table lock is never held across a call into
//! any of those collaborators.
//!
//! Terminal jobs leave the slot table immediately and land in a small
//! results ring keyed by their persistent id, so a settled slot is
//! reusable at once while the result stays readable until acknowledged.
//!
//! [`dispatch_step`]: JobQueue::dispatch_step

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant};
use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::ble::gatt::{GattClient, Role};
use crate::ble::pool::ConnectionPool;
use crate::ble::stack::{Addr, GattStack, LinkStack};
use crate::error::{Error, Result};
use crate::registry::{NodeRegistry, NodeState};

pub const MAX_JOBS: usize = 16;

/// Payload bound; sized so a full job request still fits one bridge frame.
pub const JOB_PAYLOAD_MAX: usize = 192;

/// Transient failures are retried this many times before a job settles.
pub const JOB_MAX_RETRIES: u8 = 3;

const RESULT_RING: usize = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Command byte understood by the node's Config characteristic.
pub const CMD_REBOOT: u8 = 0x08;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobKind {
    PushConfig,
    PullDiagnostics,
    UpdateFirmware,
    RebootNode,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One administrative job. `result` carries read-back data for
/// PullDiagnostics; `result_code` is 0 on success, an errno-flavored code
/// otherwise.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u32,
    pub kind: JobKind,
    pub target: Addr,
    pub payload: Vec<u8, JOB_PAYLOAD_MAX>,
    pub state: JobState,
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub retry_count: u8,
    pub result_code: i32,
    pub result: Vec<u8, JOB_PAYLOAD_MAX>,
}

struct JobTable {
    slots: [Option<Job>; MAX_JOBS],
    results: Vec<Job, RESULT_RING>,
    next_id: u32,
}

const NO_JOB: Option<Job> = None;

impl JobTable {
    const fn new() -> Self {
        Self {
            slots: [NO_JOB; MAX_JOBS],
            results: Vec::new(),
            next_id: 1,
        }
    }

    fn slot_of(&self, job_id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|j| j.id) == Some(job_id))
    }

    /// Moves a settled job out of its slot into the results ring, evicting
    /// the oldest resident when full.
    fn settle(&mut self, slot: usize) {
        if let Some(job) = self.slots[slot].take() {
            if self.results.is_full() {
                self.results.remove(0);
            }
            let _ = self.results.push(job);
        }
    }
}

pub struct JobQueue<M: RawMutex> {
    table: Mutex<M, JobTable>,
}

impl<M: RawMutex> JobQueue<M> {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(JobTable::new()),
        }
    }

    /// Queues a job. Ids are monotonic and never reused while the job is
    /// resident in the table or the results ring.
    pub async fn enqueue(&self, kind: JobKind, target: Addr, payload: &[u8]) -> Result<u32> {
        if payload.len() > JOB_PAYLOAD_MAX {
            return Err(Error::InvalidArgument);
        }
        let mut t = self.table.lock().await;
        let Some(slot) = t.slots.iter().position(|s| s.is_none()) else {
            warn!("job table full");
            return Err(Error::ResourceExhausted);
        };
        let id = t.next_id;
        t.next_id = t.next_id.wrapping_add(1);
        t.slots[slot] = Some(Job {
            id,
            kind,
            target,
            payload: Vec::from_slice(payload).map_err(|_| Error::InvalidArgument)?,
            state: JobState::Queued,
            queued_at: Instant::now(),
            started_at: None,
            ended_at: None,
            retry_count: 0,
            result_code: 0,
            result: Vec::new(),
        });
        info!("job {} queued ({:?} -> {:?})", id, kind, target);
        Ok(id)
    }

    /// Runs at most one Queued job to a settled or retryable state and
    /// returns its id; `None` when nothing is queued. Cooperative: meant
    /// to be invoked repeatedly by the owner's scheduling loop. The job
    /// lock is released before any registry/pool/GATT call and reacquired
    /// only to record the outcome.
    pub async fn dispatch_step<S>(
        &self,
        registry: &NodeRegistry<M>,
        pool: &ConnectionPool<M>,
        gatt: &GattClient<M>,
        stack: &S,
    ) -> Option<u32>
    where
        S: LinkStack + GattStack,
    {
        let (id, kind, target, payload) = {
            let mut t = self.table.lock().await;
            let slot = t
                .slots
                .iter()
                .position(|s| s.as_ref().map(|j| j.state) == Some(JobState::Queued))?;
            let Some(job) = t.slots[slot].as_mut() else {
                return None;
            };
            job.state = JobState::Running;
            job.started_at = Some(Instant::now());
            (job.id, job.kind, job.target, job.payload.clone())
        };
        info!("job {} running ({:?})", id, kind);

        let outcome = execute(registry, pool, gatt, stack, kind, target, &payload).await;

        let mut t = self.table.lock().await;
        let Some(slot) = t.slot_of(id) else {
            // Running jobs cannot be cancelled, so the slot must still be
            // here; tolerate its absence anyway.
            error!("job {} vanished while running", id);
            return Some(id);
        };
        if let Some(job) = t.slots[slot].as_mut() {
            match outcome {
                Ok(result) => {
                    job.state = JobState::Completed;
                    job.result_code = 0;
                    job.result = result;
                    job.ended_at = Some(Instant::now());
                    info!("job {} completed", id);
                    t.settle(slot);
                }
                Err(e) if e.is_transient() && job.retry_count < JOB_MAX_RETRIES => {
                    job.retry_count += 1;
                    job.state = JobState::Queued;
                    job.started_at = None;
                    warn!("job {} retry {} after {:?}", id, job.retry_count, e);
                }
                Err(e) => {
                    job.state = JobState::Failed;
                    job.result_code = e.code();
                    job.ended_at = Some(Instant::now());
                    warn!("job {} failed: {:?}", id, e);
                    t.settle(slot);
                }
            }
        }
        Some(id)
    }

    /// Cancels a job that has not started. `InvalidState` once it is
    /// Running or terminal, `NotFound` for unknown ids.
    pub async fn cancel(&self, job_id: u32) -> Result<()> {
        let mut t = self.table.lock().await;
        match t.slot_of(job_id) {
            Some(slot) => {
                let queued =
                    t.slots[slot].as_ref().map(|j| j.state) == Some(JobState::Queued);
                if queued {
                    t.slots[slot] = None;
                    info!("job {} cancelled", job_id);
                    Ok(())
                } else {
                    Err(Error::InvalidState)
                }
            }
            None if t.results.iter().any(|j| j.id == job_id) => Err(Error::InvalidState),
            None => Err(Error::NotFound),
        }
    }

    /// Snapshot of a job, live or settled-but-unacknowledged.
    pub async fn get(&self, job_id: u32) -> Option<Job> {
        let t = self.table.lock().await;
        if let Some(slot) = t.slot_of(job_id) {
            return t.slots[slot].clone();
        }
        t.results.iter().find(|j| j.id == job_id).cloned()
    }

    /// Acknowledges a terminal job, removing it from the results ring.
    pub async fn take_result(&self, job_id: u32) -> Option<Job> {
        let mut t = self.table.lock().await;
        let i = t.results.iter().position(|j| j.id == job_id)?;
        Some(t.results.remove(i))
    }

    pub async fn get_pending_count(&self) -> usize {
        self.table
            .lock()
            .await
            .slots
            .iter()
            .flatten()
            .filter(|j| j.state == JobState::Queued)
            .count()
    }
}

/// One job's orchestration: ensure a link to the target, ensure discovery,
/// then the GATT operation matching the job kind.
async fn execute<M, S>(
    registry: &NodeRegistry<M>,
    pool: &ConnectionPool<M>,
    gatt: &GattClient<M>,
    stack: &S,
    kind: JobKind,
    target: Addr,
    payload: &[u8],
) -> Result<Vec<u8, JOB_PAYLOAD_MAX>>
where
    M: RawMutex,
    S: LinkStack + GattStack,
{
    let node = registry.get_by_addr(target).await.ok_or(Error::NotFound)?;

    // Reuse the live link when the registry still shows one.
    let conn = match (node.conn, node.state) {
        (Some(conn), NodeState::Connected | NodeState::Bound) => conn,
        _ => {
            let conn = pool.connect(stack, target, CONNECT_TIMEOUT).await?;
            registry.update_connection(target, Some(conn)).await?;
            conn
        }
    };

    gatt.get_or_create_context(conn).await?;
    if !gatt.has_handles(conn).await {
        gatt.discover(stack, conn).await?;
    }

    let mut result = Vec::new();
    match kind {
        JobKind::PushConfig => gatt.write(stack, conn, Role::Config, payload).await?,
        JobKind::PullDiagnostics => {
            let mut buf = [0u8; JOB_PAYLOAD_MAX];
            let n = gatt.read(stack, conn, Role::Diagnostics, &mut buf).await?;
            result
                .extend_from_slice(&buf[..n])
                .map_err(|_| Error::InvalidArgument)?;
        }
        JobKind::UpdateFirmware => gatt.write(stack, conn, Role::Config, payload).await?,
        JobKind::RebootNode => {
            // Bare reboot writes the single command byte.
            if payload.is_empty() {
                gatt.write(stack, conn, Role::Config, &[CMD_REBOOT]).await?
            } else {
                gatt.write(stack, conn, Role::Config, payload).await?
            }
        }
    }
    Ok(result)
}
