//! Bounded pool of long-lived worker processes.
//!
//! ## Lease Discipline
//!
//! A slot is either idle (in the pool) or leased (owned by exactly one
//! [`Lease`]). Idle plus leased slots never exceed the capacity; capacity for
//! a slot being spawned is reserved before the lock is released. Callers that
//! find the pool full wait in a strict FIFO queue.
//!
//! A slot whose connection breaks is evicted rather than returned. The freed
//! capacity is backfilled by a later lease, not eagerly.
//!
//! ```text
//! dispatch(call)
//!     │
//!     ├── stage payloads (inline or shared memory)
//!     ├── lease()  ── may spawn a worker or wait in the FIFO queue
//!     │
//!     └── dispatcher thread
//!             ├── send JobRequest, wait for JobResponse
//!             ├── undelivered: evict, retry once on a fresh lease
//!             ├── release() on success / evict() on a broken channel
//!             └── deliver one result through the job's ResponseSender
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::config::PoolConfig;
use crate::error::{RPolarsErr, RResult, Rctx, WithRctx};
use crate::handle::{Handle, ResponseSender, oneshot};
use crate::ipc::ProcessLauncher;
use crate::ipc::protocol::{Job, JobOutcome, JobOutput, JobRequest, JobResponse};
use crate::transfer::{
    Column, Scalar, SegmentGuard, SerializedCallable, discard_column, stage_column, unstage_column,
};

/// Creates the connections behind pool slots.
pub trait Launcher: Send + Sync + 'static {
    type Conn: WorkerConn;

    /// Start one worker and return a connection to it.
    fn launch(&self) -> RResult<Self::Conn>;
}

/// The pool's side of one worker's job channel.
pub trait WorkerConn: Send + 'static {
    fn pid(&self) -> u32;

    /// Send one request and wait for its response.
    ///
    /// Any error means the channel is broken and the worker must be evicted.
    fn call(&mut self, request: &JobRequest) -> Result<JobResponse, CallError>;
}

/// A failed round trip on a job channel.
#[derive(Debug)]
pub enum CallError {
    /// The request never reached the worker, so it may be sent elsewhere.
    Undelivered(RPolarsErr),
    /// The request was sent but no response came back.
    Lost(RPolarsErr),
}

impl CallError {
    pub fn into_err(self) -> RPolarsErr {
        match self {
            Self::Undelivered(err) | Self::Lost(err) => err,
        }
    }
}

/// Liveness of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Leased,
    Dead,
}

/// One managed worker.
pub struct Slot<C> {
    id: u64,
    conn: C,
    state: SlotState,
}

impl<C: WorkerConn> Slot<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.conn.pid()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Snapshot of the pool's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub idle: usize,
    /// Leased slots, including ones still being spawned.
    pub leased: usize,
    /// Callers blocked in `lease`.
    pub waiting: usize,
}

struct SlotTable<C> {
    idle: VecDeque<Slot<C>>,
    leased: usize,
    /// FIFO of lease tickets; only the front ticket may claim a slot.
    waiters: VecDeque<u64>,
    next_ticket: u64,
    next_slot_id: u64,
    shut_down: bool,
}

struct PoolInner<L: Launcher> {
    launcher: L,
    capacity: usize,
    shm_threshold: usize,
    table: Mutex<SlotTable<L::Conn>>,
    changed: Condvar,
    next_job_id: AtomicU64,
}

/// Bounded pool of worker processes.
///
/// Cheap to clone: clones share one slot table. Construct it once and pass
/// it to every caller that needs background host evaluation.
pub struct WorkerPool<L: Launcher = ProcessLauncher> {
    inner: Arc<PoolInner<L>>,
}

impl<L: Launcher> Clone for WorkerPool<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WorkerPool<ProcessLauncher> {
    /// Create a pool of `rpolars-worker` processes.
    pub fn new(config: PoolConfig) -> RResult<Self> {
        config.validate()?;
        let capacity = config.capacity;
        let shm_threshold = config.shm_threshold;
        Ok(Self::with_launcher(
            ProcessLauncher::new(config),
            capacity,
            shm_threshold,
        ))
    }
}

impl<L: Launcher> WorkerPool<L> {
    /// Create a pool whose slots come from `launcher`.
    pub fn with_launcher(launcher: L, capacity: usize, shm_threshold: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                capacity: capacity.max(1),
                shm_threshold,
                table: Mutex::new(SlotTable {
                    idle: VecDeque::with_capacity(capacity),
                    leased: 0,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                    next_slot_id: 0,
                    shut_down: false,
                }),
                changed: Condvar::new(),
                next_job_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn status(&self) -> PoolStatus {
        let table = self.inner.table.lock();
        PoolStatus {
            capacity: self.inner.capacity,
            idle: table.idle.len(),
            leased: table.leased,
            waiting: table.waiters.len(),
        }
    }

    /// Claim a slot, spawning a worker if below capacity, otherwise waiting
    /// in FIFO order for one to be released or evicted.
    pub fn lease(&self) -> RResult<Lease<L>> {
        let inner = &*self.inner;
        let mut table = inner.table.lock();
        let ticket = table.next_ticket;
        table.next_ticket += 1;
        table.waiters.push_back(ticket);

        loop {
            if table.shut_down {
                table.waiters.retain(|&t| t != ticket);
                inner.changed.notify_all();
                return Err(RPolarsErr::transport("worker pool is shut down"));
            }

            if table.waiters.front() == Some(&ticket) {
                if let Some(mut slot) = table.idle.pop_front() {
                    table.waiters.pop_front();
                    table.leased += 1;
                    slot.state = SlotState::Leased;
                    inner.changed.notify_all();
                    tracing::debug!("Leased idle worker {} (slot {})", slot.pid(), slot.id);
                    return Ok(Lease::new(self.clone(), slot));
                }

                if table.idle.len() + table.leased < inner.capacity {
                    table.waiters.pop_front();
                    // Reserve capacity for the slot about to be spawned.
                    table.leased += 1;
                    let id = table.next_slot_id;
                    table.next_slot_id += 1;
                    inner.changed.notify_all();
                    drop(table);
                    return self.spawn_reserved(id);
                }
            }

            inner.changed.wait(&mut table);
        }
    }

    fn spawn_reserved(&self, id: u64) -> RResult<Lease<L>> {
        match self.inner.launcher.launch() {
            Ok(conn) => {
                tracing::debug!("Spawned worker {} (slot {})", conn.pid(), id);
                Ok(Lease::new(
                    self.clone(),
                    Slot {
                        id,
                        conn,
                        state: SlotState::Leased,
                    },
                ))
            }
            Err(err) => {
                let mut table = self.inner.table.lock();
                table.leased -= 1;
                self.inner.changed.notify_all();
                Err(err.push(Rctx::Transport("starting a worker process".to_string())))
            }
        }
    }

    fn give_back(&self, mut slot: Slot<L::Conn>) {
        let mut table = self.inner.table.lock();
        table.leased -= 1;
        if slot.state == SlotState::Dead || table.shut_down {
            drop(table);
            self.inner.changed.notify_all();
            tracing::warn!("Evicting worker {} (slot {})", slot.pid(), slot.id);
            // Dropping the connection reaps the process.
            drop(slot);
            return;
        }
        slot.state = SlotState::Idle;
        table.idle.push_back(slot);
        self.inner.changed.notify_all();
    }

    /// Make sure at least `count` workers (up to capacity) are running.
    pub fn warm(&self, count: usize) -> RResult<()> {
        let leases = (0..count.min(self.inner.capacity))
            .map(|_| self.lease())
            .collect::<RResult<Vec<_>>>()
            .when("warming up the worker pool")?;
        for lease in leases {
            lease.release();
        }
        Ok(())
    }

    /// Stop all idle workers and refuse further leases. Leased workers are
    /// evicted when their jobs finish.
    pub fn shutdown(&self) {
        let idle = {
            let mut table = self.inner.table.lock();
            table.shut_down = true;
            self.inner.changed.notify_all();
            std::mem::take(&mut table.idle)
        };
        tracing::debug!("Shutting down {} idle workers", idle.len());
        drop(idle);
    }

    /// Send `call` to a worker in the background.
    pub fn dispatch<T: FromJobOutput>(&self, call: HostCall) -> RResult<Handle<T>> {
        self.dispatch_with(call, T::from_output)
    }

    /// Send `call` to a worker; `convert` turns the raw output into `T`.
    ///
    /// Blocks only while waiting for a lease.
    pub fn dispatch_with<T: Send + 'static>(
        &self,
        call: HostCall,
        convert: fn(JobOutput) -> RResult<T>,
    ) -> RResult<Handle<T>> {
        let (job, segments) = call.stage(self.inner.shm_threshold)?;
        let job_id = self.inner.next_job_id.fetch_add(1, Ordering::Relaxed);
        let lease = self
            .lease()
            .with_ctx(|| Rctx::When(format!("dispatching job {job_id}")))?;

        let (reply, handle) = oneshot();
        let pending = PendingJob {
            request: JobRequest { job_id, job },
            segments,
            reply,
            convert,
        };

        std::thread::Builder::new()
            .name(format!("rpolars-bg-job-{job_id}"))
            .spawn(move || pending.run(lease))
            .map_err(|e| RPolarsErr::lift(e).push(Rctx::When("starting a dispatcher thread".into())))?;

        Ok(handle)
    }
}

/// Exclusive claim on one slot.
///
/// Return it with [`release`](Self::release). A lease dropped without being
/// released evicts its slot.
pub struct Lease<L: Launcher> {
    pool: WorkerPool<L>,
    slot: Option<Slot<L::Conn>>,
}

impl<L: Launcher> Lease<L> {
    fn new(pool: WorkerPool<L>, slot: Slot<L::Conn>) -> Self {
        Self {
            pool,
            slot: Some(slot),
        }
    }

    fn slot(&self) -> &Slot<L::Conn> {
        self.slot.as_ref().expect("lease holds its slot until consumed")
    }

    pub fn pid(&self) -> u32 {
        self.slot().pid()
    }

    pub fn slot_id(&self) -> u64 {
        self.slot().id
    }

    pub fn state(&self) -> SlotState {
        self.slot().state
    }

    /// Round-trip one request. A broken channel marks the slot dead.
    pub fn call(&mut self, request: &JobRequest) -> Result<JobResponse, CallError> {
        let slot = self.slot.as_mut().expect("lease holds its slot until consumed");
        let result = slot.conn.call(request);
        if result.is_err() {
            slot.state = SlotState::Dead;
        }
        result
    }

    /// Return the slot to the pool (or evict it if it died).
    pub fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }

    /// Drop the slot and free its capacity.
    pub fn evict(mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.state = SlotState::Dead;
            self.pool.give_back(slot);
        }
    }
}

impl<L: Launcher> Drop for Lease<L> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.state = SlotState::Dead;
            self.pool.give_back(slot);
        }
    }
}

/// Host work before it is staged for a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    MapColumn {
        callable: SerializedCallable,
        column: Column,
    },
    CallScalar {
        callable: SerializedCallable,
        arg: Scalar,
    },
}

impl HostCall {
    /// Turn into a wire job; returned segments must outlive the response.
    fn stage(self, shm_threshold: usize) -> RResult<(Job, Vec<SegmentGuard>)> {
        match self {
            Self::MapColumn { callable, column } => {
                let (payload, segment) = stage_column(&column, shm_threshold)?;
                Ok((
                    Job::MapColumn {
                        callable,
                        column: payload,
                    },
                    segment.into_iter().collect(),
                ))
            }
            Self::CallScalar { callable, arg } => {
                Ok((Job::CallScalar { callable, arg }, Vec::new()))
            }
        }
    }
}

/// Conversion from a worker's raw output.
pub trait FromJobOutput: Sized + Send + 'static {
    fn from_output(output: JobOutput) -> RResult<Self>;
}

impl FromJobOutput for Column {
    fn from_output(output: JobOutput) -> RResult<Self> {
        match output {
            // Output segments belong to whoever reads the response.
            JobOutput::Column(payload) => unstage_column(&payload, true),
            JobOutput::Scalar(value) => Err(RPolarsErr::new(Rctx::TypeMismatch {
                expected: "column".to_string(),
                actual: format!("scalar {value}"),
            })),
        }
    }
}

impl FromJobOutput for Scalar {
    fn from_output(output: JobOutput) -> RResult<Self> {
        match output {
            JobOutput::Scalar(value) => Ok(value),
            JobOutput::Column(payload) => {
                let column = unstage_column(&payload, true)?;
                Err(RPolarsErr::new(Rctx::TypeMismatch {
                    expected: "scalar".to_string(),
                    actual: column.to_string(),
                }))
            }
        }
    }
}

/// A dispatched job with its single-use response sender.
struct PendingJob<T> {
    request: JobRequest,
    /// Input segments, kept alive until the worker has answered.
    segments: Vec<SegmentGuard>,
    reply: ResponseSender<T>,
    convert: fn(JobOutput) -> RResult<T>,
}

impl<T> PendingJob<T> {
    fn run<L: Launcher>(self, lease: Lease<L>) {
        let job_id = self.request.job_id;
        let convert = self.convert;
        let pool = lease.pool.clone();

        let result = match self.deliver(lease) {
            Err(CallError::Undelivered(err)) => {
                tracing::warn!(
                    "Job {} was not delivered ({}), retrying on another worker",
                    job_id,
                    err.root()
                );
                match pool.lease() {
                    Ok(lease) => match self.deliver(lease) {
                        Err(CallError::Undelivered(err)) => Err(err.push(Rctx::Transport(
                            format!("job {job_id} could not be delivered to a worker"),
                        ))),
                        other => other.map_err(CallError::into_err),
                    },
                    Err(retry_err) => {
                        tracing::debug!("Retry lease for job {} failed:\n{}", job_id, retry_err);
                        Err(err.push(Rctx::Transport(format!(
                            "job {job_id} could not be delivered to a worker"
                        ))))
                    }
                }
            }
            other => other.map_err(CallError::into_err),
        }
        .and_then(|outcome| RResult::<JobOutput>::from(outcome).and_then(convert));
        drop(self.segments);

        if !self.reply.send(result) {
            tracing::debug!("Handle for job {} was dropped before its result arrived", job_id);
        }
    }

    /// Send the request on `lease` and settle the slot.
    fn deliver<L: Launcher>(&self, mut lease: Lease<L>) -> Result<JobOutcome, CallError> {
        let job_id = self.request.job_id;
        let pid = lease.pid();
        tracing::debug!("Job {} ({}) sent to worker {}", job_id, self.request.job.name(), pid);

        match lease.call(&self.request) {
            Ok(response) if response.job_id == job_id => {
                lease.release();
                Ok(response.outcome)
            }
            Ok(response) => {
                tracing::error!(
                    "Worker {} answered job {} while job {} was in flight",
                    pid,
                    response.job_id,
                    job_id
                );
                lease.evict();
                // Nobody else will read this response; free its segments.
                if let JobOutcome::Ok(JobOutput::Column(payload)) = &response.outcome {
                    discard_column(payload);
                }
                Err(CallError::Lost(RPolarsErr::transport(format!(
                    "worker process {pid} answered job {} instead of job {job_id}",
                    response.job_id
                ))))
            }
            Err(CallError::Undelivered(err)) => {
                lease.evict();
                Err(CallError::Undelivered(err.push(Rctx::Transport(format!(
                    "sending job {job_id} to worker process {pid}"
                )))))
            }
            Err(CallError::Lost(err)) => {
                lease.evict();
                Err(CallError::Lost(err.push(Rctx::Transport(format!(
                    "worker process {pid} broke its connection during job {job_id}"
                )))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RctxKind;
    use crate::host::{BuiltinHost, Callable};
    use crate::ipc::serve::execute_job;
    use crate::transfer::{ColumnPayload, ColumnValues, SharedSegment};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Knobs shared by a fake launcher and every connection it makes.
    #[derive(Default)]
    struct FakeShared {
        live: AtomicUsize,
        /// Answer with the wrong job id.
        skew_ids: AtomicBool,
        /// Last column payload a fake worker answered with.
        last_output: Mutex<Option<ColumnPayload>>,
    }

    /// In-process stand-in for a worker process.
    struct FakeConn {
        pid: u32,
        /// Set to simulate a worker that died while idle.
        dead: Arc<AtomicBool>,
        shared: Arc<FakeShared>,
    }

    impl WorkerConn for FakeConn {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn call(&mut self, request: &JobRequest) -> Result<JobResponse, CallError> {
            if self.dead.load(Ordering::SeqCst) {
                return Err(CallError::Undelivered(RPolarsErr::lift(
                    "Broken pipe (os error 32)",
                )));
            }
            let callable = match &request.job {
                Job::MapColumn { callable, .. } | Job::CallScalar { callable, .. } => callable,
            };
            if let Ok(Callable::Exit { .. }) = Callable::parse(callable) {
                return Err(CallError::Lost(RPolarsErr::lift("connection reset by peer")));
            }

            let outcome = execute_job(&BuiltinHost, request.job.clone());
            if let Ok(JobOutput::Column(payload)) = &outcome {
                *self.shared.last_output.lock() = Some(payload.clone());
            }
            let job_id = if self.shared.skew_ids.load(Ordering::SeqCst) {
                request.job_id + 100
            } else {
                request.job_id
            };
            Ok(JobResponse {
                job_id,
                outcome: JobOutcome::from(outcome),
            })
        }
    }

    impl Drop for FakeConn {
        fn drop(&mut self) {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        spawned: AtomicU64,
        fail: AtomicBool,
        /// New connections start out dead.
        born_dead: AtomicBool,
        shared: Arc<FakeShared>,
        /// Death switch of every connection made, in launch order.
        switches: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl FakeLauncher {
        fn live(&self) -> usize {
            self.shared.live.load(Ordering::SeqCst)
        }

        fn kill(&self, nth: usize) {
            self.switches.lock()[nth].store(true, Ordering::SeqCst);
        }
    }

    impl Launcher for FakeLauncher {
        type Conn = FakeConn;

        fn launch(&self) -> RResult<FakeConn> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RPolarsErr::lift("fork failed"));
            }
            let pid = 1000 + self.spawned.fetch_add(1, Ordering::SeqCst) as u32;
            let dead = Arc::new(AtomicBool::new(self.born_dead.load(Ordering::SeqCst)));
            self.switches.lock().push(Arc::clone(&dead));
            self.shared.live.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                pid,
                dead,
                shared: Arc::clone(&self.shared),
            })
        }
    }

    fn fake_pool(capacity: usize) -> WorkerPool<FakeLauncher> {
        WorkerPool::with_launcher(FakeLauncher::default(), capacity, usize::MAX)
    }

    fn scalar_call(callable: Callable, arg: Scalar) -> HostCall {
        HostCall::CallScalar {
            callable: callable.to_serialized(),
            arg,
        }
    }

    #[test]
    fn test_lease_reuses_idle_slot() {
        let pool = fake_pool(2);
        let lease = pool.lease().unwrap();
        let pid = lease.pid();
        lease.release();

        let lease = pool.lease().unwrap();
        assert_eq!(lease.pid(), pid);
        assert_eq!(pool.status().leased, 1);
        assert_eq!(pool.status().idle, 0);
        lease.release();
        assert_eq!(pool.status().idle, 1);
    }

    #[test]
    fn test_lease_spawns_up_to_capacity() {
        let pool = fake_pool(2);
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_ne!(a.pid(), b.pid());
        assert_eq!(pool.status().leased, 2);

        // A third lease must wait until one is returned.
        let pool2 = pool.clone();
        let waiter = std::thread::spawn(move || pool2.lease().map(|l| l.pid()));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.status().waiting, 1);

        let pid_a = a.pid();
        a.release();
        assert_eq!(waiter.join().unwrap().unwrap(), pid_a);
        b.release();
    }

    #[test]
    fn test_waiters_served_in_fifo_order() {
        let pool = fake_pool(1);
        let held = pool.lease().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut threads = Vec::new();
        for i in 0..4 {
            let worker_pool = pool.clone();
            let order = Arc::clone(&order);
            threads.push(std::thread::spawn(move || {
                let lease = worker_pool.lease().unwrap();
                order.lock().push(i);
                std::thread::sleep(Duration::from_millis(5));
                lease.release();
            }));
            // Make sure waiter i is queued before waiter i + 1.
            while pool.status().waiting < i + 1 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        held.release();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_evicted_slot_frees_capacity() {
        let pool = fake_pool(1);
        let lease = pool.lease().unwrap();
        let pid = lease.pid();
        lease.evict();
        assert_eq!(pool.status().leased, 0);
        assert_eq!(pool.status().idle, 0);

        let lease = pool.lease().unwrap();
        assert_ne!(lease.pid(), pid);
    }

    #[test]
    fn test_dropped_lease_evicts() {
        let pool = fake_pool(1);
        drop(pool.lease().unwrap());
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().leased, 0);
    }

    #[test]
    fn test_spawn_failure_releases_reservation() {
        let pool = fake_pool(1);
        pool.inner.launcher.fail.store(true, Ordering::SeqCst);
        let err = match pool.lease() {
            Ok(_) => panic!("lease succeeded with a failing launcher"),
            Err(e) => e,
        };
        assert_eq!(err.last_pushed().kind(), RctxKind::Transport);
        assert_eq!(pool.status().leased, 0);

        pool.inner.launcher.fail.store(false, Ordering::SeqCst);
        pool.lease().unwrap().release();
    }

    #[test]
    fn test_dispatch_scalar() {
        let pool = fake_pool(1);
        let mut handle: Handle<Scalar> = pool
            .dispatch(scalar_call(Callable::Scale { factor: 2.0 }, Scalar::Float64(1.5)))
            .unwrap();
        assert_eq!(handle.join().unwrap(), Scalar::Float64(3.0));
    }

    #[test]
    fn test_broken_channel_evicts_and_appends_transport_frame() {
        let pool = fake_pool(2);
        pool.warm(2).unwrap();
        assert_eq!(pool.status().idle, 2);

        let mut handle: Handle<Scalar> = pool
            .dispatch(scalar_call(Callable::Exit { code: 1 }, Scalar::Null))
            .unwrap();
        let err = handle.join().unwrap_err();

        assert_eq!(err.root(), &Rctx::Foreign("connection reset by peer".into()));
        assert_eq!(err.last_pushed().kind(), RctxKind::Transport);
        let status = pool.status();
        assert_eq!(status.idle + status.leased, 1);
        assert_eq!(pool.inner.launcher.live(), 1);
    }

    #[test]
    fn test_output_type_mismatch() {
        let pool = fake_pool(1);
        let mut handle: Handle<Column> = pool
            .dispatch(scalar_call(Callable::Identity, Scalar::Int64(1)))
            .unwrap();
        let err = handle.join().unwrap_err();
        assert_eq!(err.root().kind(), RctxKind::TypeMismatch);
    }

    #[test]
    fn test_shutdown_refuses_leases() {
        let pool = fake_pool(1);
        pool.warm(1).unwrap();
        pool.shutdown();
        assert_eq!(pool.status().idle, 0);
        assert!(pool.lease().is_err());
        assert_eq!(pool.status().waiting, 0);
    }

    #[test]
    fn test_worker_dead_while_idle_is_replaced() {
        let pool = fake_pool(1);
        pool.warm(1).unwrap();
        pool.inner.launcher.kill(0);

        let mut handle: Handle<Scalar> = pool
            .dispatch(scalar_call(Callable::Identity, Scalar::Int64(7)))
            .unwrap();
        assert_eq!(handle.join().unwrap(), Scalar::Int64(7));

        assert_eq!(pool.inner.launcher.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.inner.launcher.live(), 1);
        assert_eq!(pool.status().idle, 1);
    }

    #[test]
    fn test_undeliverable_job_is_retried_once() {
        let pool = fake_pool(1);
        pool.inner.launcher.born_dead.store(true, Ordering::SeqCst);

        let mut handle: Handle<Scalar> = pool
            .dispatch(scalar_call(Callable::Identity, Scalar::Null))
            .unwrap();
        let err = handle.join().unwrap_err();

        assert_eq!(err.root(), &Rctx::Foreign("Broken pipe (os error 32)".into()));
        let Rctx::Transport(message) = err.last_pushed() else {
            panic!("expected a transport frame, got {:?}", err.last_pushed());
        };
        assert!(message.contains("could not be delivered"));
        assert_eq!(pool.inner.launcher.spawned.load(Ordering::SeqCst), 2);
        let status = pool.status();
        assert_eq!(status.idle + status.leased, 0);
    }

    #[test]
    fn test_mismatched_response_frees_output_segment() {
        let pool = WorkerPool::with_launcher(FakeLauncher::default(), 1, 0);
        pool.inner.launcher.shared.skew_ids.store(true, Ordering::SeqCst);

        let column = Column::new("c", ColumnValues::Int64(vec![Some(1), Some(2)]));
        let mut handle: Handle<Column> = pool
            .dispatch(HostCall::MapColumn {
                callable: Callable::Identity.to_serialized(),
                column,
            })
            .unwrap();
        let err = handle.join().unwrap_err();
        assert!(err.is_transport());

        let output = pool.inner.launcher.shared.last_output.lock().take();
        let Some(ColumnPayload::Shared(desc)) = output else {
            panic!("expected the fake worker to answer through shared memory");
        };
        assert!(SharedSegment::open(&desc).is_err());
        assert_eq!(pool.status().idle + pool.status().leased, 0);
    }

    mod capacity {
        use super::*;
        use proptest::prelude::*;

        fn run_load(capacity: usize, jobs: usize, pause_ms: u64) {
            let pool = fake_pool(capacity);
            let peak = Arc::new(AtomicUsize::new(0));
            let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

            let observer = {
                let pool = pool.clone();
                let peak = Arc::clone(&peak);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        let status = pool.status();
                        peak.fetch_max(status.leased + status.idle, Ordering::SeqCst);
                        peak.fetch_max(pool.inner.launcher.live(), Ordering::SeqCst);
                        std::thread::yield_now();
                    }
                })
            };

            let callers: Vec<_> = (0..jobs)
                .map(|i| {
                    let pool = pool.clone();
                    std::thread::spawn(move || {
                        let callable = Callable::Sleep { ms: pause_ms };
                        let mut handle: Handle<Scalar> = pool
                            .dispatch(scalar_call(callable, Scalar::Int64(i as i64)))
                            .unwrap();
                        handle.join().unwrap()
                    })
                })
                .collect();

            for (i, caller) in callers.into_iter().enumerate() {
                assert_eq!(caller.join().unwrap(), Scalar::Int64(i as i64));
            }
            stop.store(true, Ordering::SeqCst);
            observer.join().unwrap();

            assert!(peak.load(Ordering::SeqCst) <= capacity);
            assert!(pool.inner.launcher.spawned.load(Ordering::SeqCst) as usize <= capacity);
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(8))]

            #[test]
            fn leased_never_exceeds_capacity(
                capacity in prop::sample::select(vec![1usize, 2, 8]),
                jobs in 1usize..24,
                pause_ms in 0u64..4,
            ) {
                run_load(capacity, jobs, pause_ms);
            }
        }
    }
}
