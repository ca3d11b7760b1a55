use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{introspection::introspection_port_uri, Component, ComponentState};
use crate::{
    executor::{run_guarded, TaskHandle},
    AnyError, Error, Result,
};

impl Component {
    /// Current state; `Shutdown` and `Terminated` are re-derived from the pools.
    pub fn state(&self) -> ComponentState {
        self.refresh_state()
    }

    pub fn is_started(&self) -> bool {
        self.raw_state() == ComponentState::Started
    }

    pub fn is_finalised(&self) -> bool {
        self.raw_state() == ComponentState::Finalised
    }

    pub fn is_shutdown(&self) -> bool {
        self.refresh_state() >= ComponentState::Shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.refresh_state() == ComponentState::Terminated
    }

    fn refresh_state(&self) -> ComponentState {
        let mut state = self.inner.state.lock();
        if matches!(
            *state,
            ComponentState::ShuttingDown | ComponentState::Shutdown
        ) {
            let executors = self.inner.executors.read();
            let children = self.inner.subcomponents.read();
            let terminated = executors.iter().all(|m| m.pool().is_terminated())
                && children.iter().all(|c| c.is_terminated());
            let shut_down = executors.iter().all(|m| m.pool().is_shutdown())
                && children.iter().all(|c| c.is_shutdown());
            if terminated {
                *state = ComponentState::Terminated;
                info!("component {} terminated", self.uri());
            } else if shut_down {
                *state = ComponentState::Shutdown;
            }
        }
        *state
    }

    fn ensure_state(&self, expected: ComponentState, what: &str) -> Result<()> {
        let state = self.raw_state();
        ensure_contract!(
            state == expected,
            "component {} cannot {what} while {state}, it must be {expected}",
            self.uri()
        );
        Ok(())
    }

    /// Moves from `from` to `to`, failing if another caller moved first.
    fn advance(&self, from: ComponentState, to: ComponentState) -> Result<()> {
        let mut state = self.inner.state.lock();
        ensure_contract!(
            *state == from,
            "component {} cannot go from {} to {to}",
            self.uri(),
            *state
        );
        *state = to;
        Ok(())
    }

    fn start_failure(&self, cause: impl Into<AnyError>) -> Error {
        let err = Error::Start {
            uri: self.uri().to_string(),
            cause: cause.into(),
        };
        warn!("{err}");
        err
    }

    /// Starts the sub-components, then this component.
    ///
    /// Plug-ins given to the builder are installed and the start callback
    /// runs once the component is started; their failures are reported as
    /// [`Error::Start`] but leave the component started.
    pub fn start(&self) -> Result<()> {
        self.ensure_state(ComponentState::Initialised, "start")?;
        for child in self.subcomponents() {
            if let Err(e) = child.start() {
                let cause = anyhow::Error::new(e).context(format!("sub-component {}", child.uri()));
                return Err(self.start_failure(cause));
            }
        }
        self.advance(ComponentState::Initialised, ComponentState::Started)?;
        info!("component {} started", self.uri());

        let plugins = std::mem::take(&mut *self.inner.pending_plugins.lock());
        for plugin in plugins {
            self.install_plugin(plugin)
                .map_err(|e| self.start_failure(e))?;
        }
        if let Some(on_start) = self.inner.callbacks.on_start.clone() {
            run_guarded(|| on_start(self)).map_err(|e| self.start_failure(e))?;
        }
        Ok(())
    }

    /// Runs the execute callback as a task on the default pool.
    pub fn execute(&self) -> Result<TaskHandle<()>> {
        self.ensure_state(ComponentState::Started, "execute")?;
        match self.inner.callbacks.on_execute.clone() {
            Some(on_execute) => self.run_task(move |owner| on_execute(owner)),
            None => Ok(TaskHandle::completed(Ok(()))),
        }
    }

    /// Finalises the sub-components, the plug-ins and the self-description port.
    ///
    /// Failures of callbacks and plug-ins are logged; finalisation always
    /// completes once its precondition holds.
    pub fn finalise(&self) -> Result<()> {
        self.ensure_state(ComponentState::Started, "finalise")?;
        for child in self.subcomponents() {
            if child.is_started() {
                if let Err(e) = child.finalise() {
                    warn!(
                        "component {}: sub-component {} failed to finalise: {e}",
                        self.uri(),
                        child.uri()
                    );
                }
            }
        }
        if let Some(on_finalise) = self.inner.callbacks.on_finalise.clone() {
            if let Err(e) = run_guarded(|| on_finalise(self)) {
                warn!("component {}: finalise callback failed: {e:#}", self.uri());
            }
        }

        let plugins = std::mem::take(&mut *self.inner.plugins.write());
        for plugin in plugins.iter().rev() {
            if let Err(e) = plugin.finalise(self) {
                warn!("plug-in {} failed to finalise: {e:#}", plugin.uri());
            }
            if let Err(e) = plugin.uninstall(self) {
                warn!("plug-in {} failed to uninstall: {e:#}", plugin.uri());
            }
        }

        let introspection = introspection_port_uri(self.uri());
        let retired = self.inner.ports.write().remove(&introspection);
        if let Some(handle) = retired {
            handle.dismantle();
        }

        self.advance(ComponentState::Started, ComponentState::Finalised)?;
        info!("component {} finalised", self.uri());
        Ok(())
    }

    /// Lets queued work drain, then stops every pool.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_with(false)
    }

    /// Stops every pool at once; work that has not started is cancelled.
    pub fn shutdown_now(&self) -> Result<()> {
        self.shutdown_with(true)
    }

    fn shutdown_with(&self, now: bool) -> Result<()> {
        self.ensure_state(ComponentState::Finalised, "shut down")?;
        for child in self.subcomponents() {
            let outcome = match child.raw_state() {
                ComponentState::Initialised => Ok(()),
                _ if now => child.shutdown_now(),
                _ => child.shutdown(),
            };
            if let Err(e) = outcome {
                warn!(
                    "component {}: sub-component {} failed to shut down: {e}",
                    self.uri(),
                    child.uri()
                );
            }
        }
        self.advance(ComponentState::Finalised, ComponentState::ShuttingDown)?;
        info!(
            "component {} shutting down{}",
            self.uri(),
            if now { " now" } else { "" }
        );

        for handle in self.take_ports() {
            handle.dismantle();
        }
        for manager in self.executor_services() {
            if now {
                manager.pool().shutdown_now();
            } else {
                manager.pool().shutdown();
            }
        }
        self.refresh_state();
        Ok(())
    }

    /// Blocks until every pool terminated or `timeout` elapsed; returns whether terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for manager in self.executor_services() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            manager.pool().await_termination(remaining);
        }
        for child in self.subcomponents() {
            child.await_termination(deadline.saturating_duration_since(Instant::now()));
        }
        self.is_terminated()
    }
}
