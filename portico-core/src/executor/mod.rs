//! Executor pools owned by components.
//!
//! A component that is not passive owns one or more named pools. Each pool is a
//! fixed set of worker threads (see [`MonoioPool`]) that execute [`Job`]s, either
//! immediately, after a delay, or periodically when the pool is schedulable.
//!
//! # Key Components
//!
//! - [`WorkerPool`]: the pool contract the component relies on; any implementation
//!   can be plugged in through a [`PoolFactory`].
//! - [`MonoioPool`]: the default pool, one `monoio` runtime per worker thread.
//! - [`ExecutorServiceManager`]: binds a pool to the URI and stable index under which
//!   a component addresses it.
//! - [`TaskHandle`]: the cancellable handle returned for every submission.
use std::{fmt, sync::Arc, time::Duration};

use crate::{config::RuntimeConfig, AnyResult, Result};

mod handle;
mod manager;
mod runtime;
mod worker;

pub use handle::TaskHandle;
pub(crate) use handle::run_guarded;
pub use manager::ExecutorServiceManager;
pub(crate) use manager::ExecutorTable;
pub use worker::{MonoioPool, MonoioPoolFactory};

/// URI of the plain pool created automatically for active components.
pub const STANDARD_POOL_URI: &str = "portico.standard-pool";
/// URI of the schedulable pool created automatically for active components.
pub const STANDARD_SCHEDULABLE_POOL_URI: &str = "portico.standard-schedulable-pool";

/// A one-shot unit of work handed to a pool.
///
/// Dropping a job instead of running it cancels the handle it reports to.
pub struct Job(Box<dyn FnOnce() + Send>);

impl Job {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn run(self) {
        (self.0)()
    }
}

/// A periodic unit of work; each tick returns whether the schedule continues.
pub struct RepeatingJob(Box<dyn FnMut() -> bool + Send>);

impl RepeatingJob {
    pub fn new(f: impl FnMut() -> bool + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn tick(&mut self) -> bool {
        (self.0)()
    }
}

/// Cadence of a periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Executions start on a fixed period grid; missed slots are skipped.
    FixedRate(Duration),
    /// The delay runs from the end of one execution to the start of the next.
    FixedDelay(Duration),
}

/// The worker pool contract a component dispatches onto.
pub trait WorkerPool: Send + Sync {
    fn uri(&self) -> &str;
    fn threads(&self) -> usize;
    fn is_schedulable(&self) -> bool;

    fn execute(&self, job: Job) -> Result<()>;
    fn schedule(&self, job: Job, delay: Duration) -> Result<()>;
    fn schedule_repeating(
        &self,
        job: RepeatingJob,
        initial_delay: Duration,
        cadence: Cadence,
    ) -> Result<()>;

    /// Stops accepting work; queued and delayed one-shot jobs still run.
    fn shutdown(&self);
    /// Stops accepting work and drops every job that has not started.
    fn shutdown_now(&self);
    fn is_shutdown(&self) -> bool;
    fn is_terminated(&self) -> bool;
    /// Returns whether the pool terminated within `timeout`.
    fn await_termination(&self, timeout: Duration) -> bool;
}

/// What a pool is asked to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub uri: String,
    pub threads: usize,
    pub schedulable: bool,
}

/// Builds pools; the runtime context carries the default one.
pub trait PoolFactory: Send + Sync {
    fn make_pool(&self, spec: &PoolSpec) -> AnyResult<Arc<dyn WorkerPool>>;
}

impl<F> PoolFactory for F
where
    F: Fn(&PoolSpec) -> AnyResult<Arc<dyn WorkerPool>> + Send + Sync,
{
    fn make_pool(&self, spec: &PoolSpec) -> AnyResult<Arc<dyn WorkerPool>> {
        self(spec)
    }
}

pub(crate) fn default_pool_factory(config: &RuntimeConfig) -> Arc<dyn PoolFactory> {
    Arc::new(MonoioPoolFactory::new(config.clone()))
}

/// Selects the pool a dispatch call targets.
///
/// Indices are the fast path; URIs are looked up in the component's table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PoolRef {
    #[default]
    Default,
    Uri(String),
    Index(usize),
}

impl From<usize> for PoolRef {
    fn from(value: usize) -> Self {
        PoolRef::Index(value)
    }
}

impl From<&str> for PoolRef {
    fn from(value: &str) -> Self {
        PoolRef::Uri(value.to_string())
    }
}

impl From<String> for PoolRef {
    fn from(value: String) -> Self {
        PoolRef::Uri(value)
    }
}

impl From<&PoolRef> for PoolRef {
    fn from(value: &PoolRef) -> Self {
        value.clone()
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRef::Default => f.write_str("<default>"),
            PoolRef::Uri(uri) => f.write_str(uri),
            PoolRef::Index(index) => write!(f, "#{index}"),
        }
    }
}
