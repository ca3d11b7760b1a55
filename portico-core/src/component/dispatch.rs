//! Executor pools of a component and the task/request dispatch engine.
//!
//! Tasks produce no value, requests do. Every operation exists in a default
//! form, which picks the standard pool (or the standard schedulable pool for
//! scheduled work), and in an `_on` form taking a [`PoolRef`]. Passive
//! components run tasks and requests inline on the caller's thread.
//!
//! Dispatching before the component is started, on an unknown pool, or
//! scheduling on a pool that is not schedulable are contract violations. A
//! pool refusing work because it is shutting down yields
//! [`Error::Rejected`](crate::Error::Rejected).
use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use super::{Component, ComponentState};
use crate::{
    executor::{
        run_guarded, Cadence, ExecutorServiceManager, Job, PoolFactory, PoolRef, PoolSpec,
        RepeatingJob, TaskHandle, WorkerPool, STANDARD_POOL_URI, STANDARD_SCHEDULABLE_POOL_URI,
    },
    AnyResult, Error, Result,
};

impl Component {
    // Executor services

    /// Creates a pool with the context's pool factory and returns its index.
    pub fn create_new_executor_service(
        &self,
        uri: &str,
        threads: usize,
        schedulable: bool,
    ) -> Result<usize> {
        let factory = self.context().pool_factory().clone();
        self.create_new_executor_service_with(uri, threads, schedulable, factory.as_ref())
    }

    /// Creates a pool with a custom factory and returns its index.
    pub fn create_new_executor_service_with(
        &self,
        uri: &str,
        threads: usize,
        schedulable: bool,
        factory: &dyn PoolFactory,
    ) -> Result<usize> {
        let state = self.raw_state();
        ensure_contract!(
            state < ComponentState::ShuttingDown,
            "component {} cannot create executor services while {state}",
            self.uri()
        );
        ensure_contract!(!uri.is_empty(), "executor service uri must not be empty");
        ensure_contract!(
            threads > 0,
            "executor service {uri} needs at least one thread"
        );
        let mut executors = self.inner.executors.write();
        ensure_contract!(
            !executors.contains(uri),
            "component {} already has an executor service {uri}",
            self.uri()
        );
        let spec = PoolSpec {
            uri: uri.to_string(),
            threads,
            schedulable,
        };
        let pool = factory
            .make_pool(&spec)
            .map_err(|cause| Error::PoolCreation {
                uri: uri.to_string(),
                cause,
            })?;
        if pool.uri() != uri || pool.is_schedulable() != schedulable {
            pool.shutdown_now();
            return Err(contract_violation!(
                "pool factory built {} (schedulable: {}) when asked for {uri} (schedulable: {schedulable})",
                pool.uri(),
                pool.is_schedulable()
            ));
        }
        let index = executors.insert(pool)?;
        info!(
            "component {}: executor service {uri} #{index} with {threads} thread(s)",
            self.uri()
        );
        Ok(index)
    }

    pub fn executor_service_index(&self, uri: &str) -> Result<usize> {
        self.inner.executors.read().index_of(uri).ok_or_else(|| {
            contract_violation!("component {} has no executor service {uri}", self.uri())
        })
    }

    pub fn valid_executor_service_uri(&self, uri: &str) -> bool {
        self.inner.executors.read().index_of(uri).is_some()
    }

    pub fn valid_executor_service_index(&self, index: usize) -> bool {
        index < self.inner.executors.read().len()
    }

    pub fn executor_service(&self, pool: impl Into<PoolRef>) -> Option<Arc<ExecutorServiceManager>> {
        let pool = pool.into();
        let executors = self.inner.executors.read();
        match pool {
            PoolRef::Default => executors
                .index_of(STANDARD_POOL_URI)
                .or_else(|| executors.index_of(STANDARD_SCHEDULABLE_POOL_URI))
                .and_then(|i| executors.get(i))
                .cloned(),
            _ => executors.lookup(&pool).cloned(),
        }
    }

    pub fn is_schedulable_executor_service(&self, pool: impl Into<PoolRef>) -> Result<bool> {
        let pool = pool.into();
        self.executor_service(pool.clone())
            .map(|m| m.is_schedulable())
            .ok_or_else(|| {
                contract_violation!("component {} has no executor service {pool}", self.uri())
            })
    }

    pub fn executor_services(&self) -> Vec<Arc<ExecutorServiceManager>> {
        self.inner.executors.read().iter().cloned().collect()
    }

    pub fn total_threads(&self) -> usize {
        self.inner.executors.read().total_threads()
    }

    /// Holds only when all the component's pools together run one thread.
    pub fn has_serialised_execution(&self) -> bool {
        self.total_threads() == 1
    }

    // Targets

    fn ensure_started(&self, what: &str) -> Result<()> {
        let state = self.raw_state();
        ensure_contract!(
            state == ComponentState::Started,
            "component {} cannot {what} while {state}",
            self.uri()
        );
        Ok(())
    }

    /// The pool running immediate work; `None` means inline on the caller.
    fn immediate_target(&self, pool: &PoolRef) -> Result<Option<Arc<dyn WorkerPool>>> {
        if *pool == PoolRef::Default && self.is_passive() {
            return Ok(None);
        }
        match self.executor_service(pool.clone()) {
            Some(manager) => Ok(Some(manager.pool().clone())),
            None if *pool == PoolRef::Default => Ok(None),
            None => Err(contract_violation!(
                "component {} has no executor service {pool}",
                self.uri()
            )),
        }
    }

    fn schedulable_target(&self, pool: &PoolRef) -> Result<Arc<dyn WorkerPool>> {
        let manager = match pool {
            PoolRef::Default => self.executor_service(STANDARD_SCHEDULABLE_POOL_URI),
            _ => self.executor_service(pool.clone()),
        };
        let Some(manager) = manager else {
            return Err(contract_violation!(
                "component {} has no schedulable executor service {pool}",
                self.uri()
            ));
        };
        ensure_contract!(
            manager.is_schedulable(),
            "executor service {} of component {} is not schedulable",
            manager.uri(),
            self.uri()
        );
        Ok(manager.pool().clone())
    }

    /// Wraps `f` into a job reporting to the returned handle.
    fn one_shot<T, F>(&self, f: F) -> (TaskHandle<T>, Job)
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        let (handle, completer) = TaskHandle::pair();
        let owner = self.downgrade();
        let job = Job::new(move || {
            if !completer.begin() {
                return;
            }
            let result = match owner.upgrade() {
                Some(component) => run_guarded(|| f(&component)),
                None => Err(anyhow::anyhow!("component dropped before the work ran")),
            };
            completer.complete(result);
        });
        (handle, job)
    }

    fn submit<T, F>(&self, pool: PoolRef, what: &str, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.ensure_started(what)?;
        match self.immediate_target(&pool)? {
            None => Ok(TaskHandle::completed(run_guarded(|| f(self)))),
            Some(target) => {
                let (handle, job) = self.one_shot(f);
                target.execute(job)?;
                Ok(handle)
            }
        }
    }

    fn submit_delayed<T, F>(
        &self,
        pool: PoolRef,
        delay: Duration,
        what: &str,
        f: F,
    ) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.ensure_started(what)?;
        let target = self.schedulable_target(&pool)?;
        let (handle, job) = self.one_shot(f);
        target.schedule(job, delay)?;
        Ok(handle)
    }

    /// Periodic work; the first failure ends the schedule and completes the handle with it.
    fn submit_periodic<F>(
        &self,
        pool: PoolRef,
        initial_delay: Duration,
        cadence: Cadence,
        f: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnMut(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.ensure_started("schedule a periodic task")?;
        let target = self.schedulable_target(&pool)?;
        let (handle, completer) = TaskHandle::pair();
        let mut completer = Some(completer);
        let owner = self.downgrade();
        let uri = self.uri().to_string();
        let mut f = f;
        let job = RepeatingJob::new(move || {
            if !completer.as_ref().is_some_and(|c| c.begin()) {
                return false;
            }
            let Some(component) = owner.upgrade() else {
                return false;
            };
            if component.raw_state() >= ComponentState::ShuttingDown {
                return false;
            }
            match run_guarded(|| f(&component)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("periodic task of {uri} failed, no further runs: {e:#}");
                    if let Some(completer) = completer.take() {
                        completer.complete(Err(e));
                    }
                    false
                }
            }
        });
        target.schedule_repeating(job, initial_delay, cadence)?;
        Ok(handle)
    }

    // Tasks

    /// Runs a fire-and-forget task; inline on a passive component.
    pub fn run_task<F>(&self, f: F) -> Result<TaskHandle<()>>
    where
        F: FnOnce(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.run_task_on(PoolRef::Default, f)
    }

    pub fn run_task_on<F>(&self, pool: impl Into<PoolRef>, f: F) -> Result<TaskHandle<()>>
    where
        F: FnOnce(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.submit(pool.into(), "run a task", f)
    }

    pub fn schedule_task<F>(&self, delay: Duration, f: F) -> Result<TaskHandle<()>>
    where
        F: FnOnce(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.schedule_task_on(PoolRef::Default, delay, f)
    }

    pub fn schedule_task_on<F>(
        &self,
        pool: impl Into<PoolRef>,
        delay: Duration,
        f: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnOnce(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.submit_delayed(pool.into(), delay, "schedule a task", f)
    }

    /// Runs `f` every `period`; an overrunning run delays the next one, missed slots are skipped.
    pub fn schedule_task_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnMut(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.schedule_task_at_fixed_rate_on(PoolRef::Default, initial_delay, period, f)
    }

    pub fn schedule_task_at_fixed_rate_on<F>(
        &self,
        pool: impl Into<PoolRef>,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnMut(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.submit_periodic(pool.into(), initial_delay, Cadence::FixedRate(period), f)
    }

    /// Runs `f` repeatedly, waiting `delay` between the end of a run and the next start.
    pub fn schedule_task_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnMut(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.schedule_task_with_fixed_delay_on(PoolRef::Default, initial_delay, delay, f)
    }

    pub fn schedule_task_with_fixed_delay_on<F>(
        &self,
        pool: impl Into<PoolRef>,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> Result<TaskHandle<()>>
    where
        F: FnMut(&Component) -> AnyResult<()> + Send + 'static,
    {
        self.submit_periodic(pool.into(), initial_delay, Cadence::FixedDelay(delay), f)
    }

    // Requests

    /// Submits a request and hands back its handle.
    pub fn submit_request<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.submit_request_on(PoolRef::Default, f)
    }

    pub fn submit_request_on<T, F>(&self, pool: impl Into<PoolRef>, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.submit(pool.into(), "handle a request", f)
    }

    /// Runs a request and blocks the caller until its result is available.
    pub fn handle_request_sync<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.handle_request_sync_on(PoolRef::Default, f)
    }

    pub fn handle_request_sync_on<T, F>(&self, pool: impl Into<PoolRef>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.submit(pool.into(), "handle a request", f)?.get()
    }

    /// Submits a request and discards its result.
    pub fn handle_request_async<T, F>(&self, f: F) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.handle_request_async_on(PoolRef::Default, f)
    }

    pub fn handle_request_async_on<T, F>(&self, pool: impl Into<PoolRef>, f: F) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.submit(pool.into(), "handle a request", f).map(drop)
    }

    /// Runs a request after `delay` and blocks the caller until its result is available.
    pub fn schedule_request_sync<T, F>(&self, delay: Duration, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.schedule_request_sync_on(PoolRef::Default, delay, f)
    }

    pub fn schedule_request_sync_on<T, F>(
        &self,
        pool: impl Into<PoolRef>,
        delay: Duration,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.submit_delayed(pool.into(), delay, "schedule a request", f)?
            .get()
    }

    pub fn schedule_request_async<T, F>(&self, delay: Duration, f: F) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.schedule_request_async_on(PoolRef::Default, delay, f)
    }

    pub fn schedule_request_async_on<T, F>(
        &self,
        pool: impl Into<PoolRef>,
        delay: Duration,
        f: F,
    ) -> Result<()>
    where
        T: Send + 'static,
        F: FnOnce(&Component) -> AnyResult<T> + Send + 'static,
    {
        self.submit_delayed(pool.into(), delay, "schedule a request", f)
            .map(drop)
    }
}
