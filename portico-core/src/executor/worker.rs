use std::{
    cmp,
    collections::{BinaryHeap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use monoio::utils::bind_to_cpu_set;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::{runtime::RuntimeWrapper, Cadence, Job, PoolFactory, PoolSpec, RepeatingJob, WorkerPool};
use crate::{config::RuntimeConfig, AnyResult, Error, Result};

enum Work {
    Once(Job),
    Repeat {
        job: RepeatingJob,
        cadence: Cadence,
        slot: Instant,
    },
}

/// Work waiting for its due time; ordered so the heap pops the earliest first.
struct Timed {
    due: Instant,
    seq: u64,
    work: Work,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

enum Next {
    Run(Work),
    Wait(Option<Instant>),
    Exit,
}

/// The queue every worker of a pool pulls from.
struct Queue {
    ready: VecDeque<Job>,
    timed: BinaryHeap<Timed>,
    seq: u64,
    closed: bool,
    idle: Vec<bool>,
}

impl Queue {
    fn new(workers: usize) -> Self {
        Self {
            ready: VecDeque::new(),
            timed: BinaryHeap::new(),
            seq: 0,
            closed: false,
            idle: vec![false; workers],
        }
    }

    fn push_timed(&mut self, due: Instant, work: Work) {
        let seq = self.seq;
        self.seq += 1;
        self.timed.push(Timed { due, seq, work });
    }

    /// Marks the first idle worker busy and returns it.
    fn claim_idle(&mut self) -> Option<usize> {
        let id = self.idle.iter().position(|idle| *idle)?;
        self.idle[id] = false;
        Some(id)
    }

    fn next(&mut self, worker: usize, now: Instant) -> Next {
        if let Some(job) = self.ready.pop_front() {
            self.idle[worker] = false;
            return Next::Run(Work::Once(job));
        }
        if self.timed.peek().is_some_and(|t| t.due <= now) {
            if let Some(timed) = self.timed.pop() {
                self.idle[worker] = false;
                return Next::Run(timed.work);
            }
        }
        if self.closed && self.timed.is_empty() {
            return Next::Exit;
        }
        self.idle[worker] = true;
        Next::Wait(self.timed.peek().map(|t| t.due))
    }

    /// Removes periodic work, or every pending job when `everything` is set.
    fn retire(&mut self, everything: bool) -> Vec<Work> {
        if everything {
            let mut retired: Vec<Work> = self.ready.drain(..).map(Work::Once).collect();
            retired.extend(self.timed.drain().map(|t| t.work));
            return retired;
        }
        let (periodic, once): (Vec<Timed>, Vec<Timed>) = std::mem::take(&mut self.timed)
            .into_iter()
            .partition(|t| matches!(t.work, Work::Repeat { .. }));
        self.timed = once.into_iter().collect();
        periodic.into_iter().map(|t| t.work).collect()
    }
}

struct PoolState {
    queue: Mutex<Queue>,
    doorbells: Vec<UnboundedSender<()>>,
    shutdown: AtomicBool,
    halted: AtomicBool,
    live_workers: Mutex<usize>,
    terminated: Condvar,
}

impl PoolState {
    fn ring(&self, worker: usize) {
        // A worker that already stopped has nothing left to pick up.
        let _ = self.doorbells[worker].unbounded_send(());
    }

    /// Closes the queue; returns whether it was open.
    fn close(&self, halt: bool) -> bool {
        if halt {
            self.halted.store(true, Ordering::Release);
        }
        self.shutdown.store(true, Ordering::Release);
        let (was_open, retired) = {
            let mut queue = self.queue.lock();
            let was_open = !queue.closed;
            queue.closed = true;
            (was_open, queue.retire(halt))
        };
        // Dropping work that never started cancels its handle.
        if !retired.is_empty() {
            debug!("dropped {} pending job(s)", retired.len());
        }
        drop(retired);
        for worker in 0..self.doorbells.len() {
            self.ring(worker);
        }
        was_open
    }
}

/// Worker pool where every worker thread runs its own `monoio` runtime.
///
/// All workers of a pool pull from one shared queue, so a job waits only
/// while every worker is busy. Delayed and periodic jobs sit in a shared
/// deadline heap and are run by whichever worker is free when they fall due;
/// idle workers sleep on their runtime timer and are woken through a
/// per-worker doorbell channel when work arrives.
///
/// # Shutdown
///
/// - [`shutdown`](WorkerPool::shutdown) closes the queue: queued jobs and
///   delayed one-shot jobs still run, periodic jobs are dropped.
/// - [`shutdown_now`](WorkerPool::shutdown_now) additionally halts the workers,
///   every job that has not started is dropped and its handle cancelled.
pub struct MonoioPool {
    uri: String,
    threads: usize,
    schedulable: bool,
    state: Arc<PoolState>,
}

impl MonoioPool {
    /// Spawns the worker threads of a new pool.
    pub fn spawn(spec: &PoolSpec, runtime_config: &RuntimeConfig) -> Result<Self> {
        ensure_contract!(
            spec.threads > 0,
            "pool {} needs at least one thread",
            spec.uri
        );
        let cores = if runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        let (doorbells, receivers): (Vec<_>, Vec<_>) =
            (0..spec.threads).map(|_| unbounded()).unzip();
        let state = Arc::new(PoolState {
            queue: Mutex::new(Queue::new(spec.threads)),
            doorbells,
            shutdown: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            live_workers: Mutex::new(spec.threads),
            terminated: Condvar::new(),
        });
        for (worker_id, doorbell) in receivers.into_iter().enumerate() {
            let worker = PoolWorker {
                id: worker_id,
                pool_uri: spec.uri.clone(),
                state: state.clone(),
            };
            let runtime_config = runtime_config.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{}-worker-{worker_id}", spec.uri))
                .spawn(move || {
                    let _live = LiveGuard(worker.state.clone());
                    // bind thread to cpu core
                    if let Some(cores) = cores {
                        let core = worker_id % cores;
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind thread {worker_id} to core {core} failed: {e}");
                        }
                    }
                    match RuntimeWrapper::new(&runtime_config) {
                        Ok(mut runtime) => runtime.block_on(worker.run(doorbell)),
                        Err(e) => error!(
                            "pool {} worker {worker_id} failed to build its runtime: {e}",
                            worker.pool_uri
                        ),
                    }
                });
            if let Err(e) = spawned {
                // Threads never started will never report termination.
                *state.live_workers.lock() -= spec.threads - worker_id;
                state.close(true);
                return Err(Error::PoolCreation {
                    uri: spec.uri.clone(),
                    cause: e.into(),
                });
            }
        }
        info!(
            "pool {} started with {} worker(s){}",
            spec.uri,
            spec.threads,
            if spec.schedulable { ", schedulable" } else { "" }
        );
        Ok(Self {
            uri: spec.uri.clone(),
            threads: spec.threads,
            schedulable: spec.schedulable,
            state,
        })
    }

    fn submit(&self, work: Work, delay: Option<Duration>) -> Result<()> {
        let idle = {
            let mut queue = self.state.queue.lock();
            if queue.closed {
                return Err(Error::rejected(&self.uri, "pool is shut down"));
            }
            match (work, delay) {
                (Work::Once(job), None) => queue.ready.push_back(job),
                (work, delay) => {
                    let due = Instant::now() + delay.unwrap_or_default();
                    let work = match work {
                        Work::Repeat { job, cadence, .. } => Work::Repeat {
                            job,
                            cadence,
                            slot: due,
                        },
                        once => once,
                    };
                    queue.push_timed(due, work);
                }
            }
            queue.claim_idle()
        };
        if let Some(worker) = idle {
            self.state.ring(worker);
        }
        Ok(())
    }

    fn ensure_schedulable(&self) -> Result<()> {
        ensure_contract!(
            self.schedulable,
            "pool {} is not schedulable",
            self.uri
        );
        Ok(())
    }
}

impl Drop for MonoioPool {
    fn drop(&mut self) {
        self.state.close(false);
    }
}

impl WorkerPool for MonoioPool {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn threads(&self) -> usize {
        self.threads
    }

    fn is_schedulable(&self) -> bool {
        self.schedulable
    }

    fn execute(&self, job: Job) -> Result<()> {
        self.submit(Work::Once(job), None)
    }

    fn schedule(&self, job: Job, delay: Duration) -> Result<()> {
        self.ensure_schedulable()?;
        self.submit(Work::Once(job), Some(delay))
    }

    fn schedule_repeating(
        &self,
        job: RepeatingJob,
        initial_delay: Duration,
        cadence: Cadence,
    ) -> Result<()> {
        self.ensure_schedulable()?;
        let period = match cadence {
            Cadence::FixedRate(p) | Cadence::FixedDelay(p) => p,
        };
        ensure_contract!(
            !period.is_zero(),
            "periodic jobs on pool {} need a non-zero period",
            self.uri
        );
        let work = Work::Repeat {
            job,
            cadence,
            slot: Instant::now(),
        };
        self.submit(work, Some(initial_delay))
    }

    fn shutdown(&self) {
        if self.state.close(false) {
            info!("pool {} is shutting down", self.uri);
        }
    }

    fn shutdown_now(&self) {
        if self.state.close(true) {
            info!("pool {} is shutting down now", self.uri);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::Acquire)
    }

    fn is_terminated(&self) -> bool {
        *self.state.live_workers.lock() == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.state.live_workers.lock();
        while *live > 0 {
            if self
                .state
                .terminated
                .wait_until(&mut live, deadline)
                .timed_out()
            {
                return *live == 0;
            }
        }
        true
    }
}

struct LiveGuard(Arc<PoolState>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut live = self.0.live_workers.lock();
        *live -= 1;
        if *live == 0 {
            self.0.terminated.notify_all();
        }
    }
}

struct PoolWorker {
    id: usize,
    pool_uri: String,
    state: Arc<PoolState>,
}

impl PoolWorker {
    /// Pulls work until the queue is closed and drained, or the pool is halted.
    async fn run(&self, mut doorbell: UnboundedReceiver<()>) {
        loop {
            if self.state.halted.load(Ordering::Acquire) {
                break;
            }
            let next = self.state.queue.lock().next(self.id, Instant::now());
            match next {
                Next::Run(Work::Once(job)) => job.run(),
                Next::Run(Work::Repeat { job, cadence, slot }) => self.tick(job, cadence, slot),
                Next::Wait(Some(due)) => {
                    let pause = due.saturating_duration_since(Instant::now());
                    monoio::select! {
                        _ = doorbell.next() => {}
                        _ = monoio::time::sleep(pause) => {}
                    }
                }
                Next::Wait(None) => {
                    doorbell.next().await;
                }
                Next::Exit => break,
            }
        }
        debug!("pool {} worker {} stopped", self.pool_uri, self.id);
    }

    /// Runs one execution of a periodic job and queues its next one.
    fn tick(&self, mut job: RepeatingJob, cadence: Cadence, slot: Instant) {
        if self.state.shutdown.load(Ordering::Acquire) || !job.tick() {
            debug!("periodic job on pool {} ended", self.pool_uri);
            return;
        }
        let now = Instant::now();
        let slot = match cadence {
            Cadence::FixedRate(period) => {
                let mut next = slot + period;
                // Slots missed by an overrunning execution are skipped.
                while next <= now {
                    next += period;
                }
                next
            }
            Cadence::FixedDelay(delay) => now + delay,
        };
        let mut queue = self.state.queue.lock();
        if queue.closed {
            drop(queue);
            debug!("periodic job on pool {} ended", self.pool_uri);
            return;
        }
        queue.push_timed(
            slot,
            Work::Repeat {
                job,
                cadence,
                slot,
            },
        );
    }
}

/// Default [`PoolFactory`]: builds [`MonoioPool`]s with a shared runtime config.
#[derive(Debug, Clone, Default)]
pub struct MonoioPoolFactory {
    runtime_config: RuntimeConfig,
}

impl MonoioPoolFactory {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self { runtime_config }
    }
}

impl PoolFactory for MonoioPoolFactory {
    fn make_pool(&self, spec: &PoolSpec) -> AnyResult<Arc<dyn WorkerPool>> {
        Ok(Arc::new(MonoioPool::spawn(spec, &self.runtime_config)?))
    }
}
