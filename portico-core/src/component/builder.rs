use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::{
    introspection::{introspection_port_uri, IntrospectionService, INTROSPECTION_INTERFACE},
    Callback, Callbacks, Component, ComponentInner, ComponentState, PortTable,
};
use crate::{
    config::{ComponentConfig, PoolConfig},
    context::RuntimeContext,
    executor::{ExecutorTable, STANDARD_POOL_URI, STANDARD_SCHEDULABLE_POOL_URI},
    interface::InterfaceId,
    plugin::Plugin,
    port::{InboundPort, Port},
    service::{HookChain, RequestHook, ServiceHandler},
    AnyResult, Result,
};

/// Declarative construction of a [`Component`].
///
/// Everything given here is evaluated once, in [`ComponentBuilder::build`]:
/// interfaces are declared, pools are created, services are composed with
/// the hooks and the self-description port is published. Plug-ins given
/// here are installed when the component starts.
pub struct ComponentBuilder {
    context: Arc<RuntimeContext>,
    uri: Option<String>,
    plain_threads: usize,
    schedulable_threads: usize,
    required: Vec<InterfaceId>,
    offered: Vec<InterfaceId>,
    services: HashMap<InterfaceId, Arc<dyn ServiceHandler>>,
    pools: Vec<PoolConfig>,
    hooks: HookChain,
    plugins: Vec<Arc<dyn Plugin>>,
    callbacks: Callbacks,
}

impl ComponentBuilder {
    pub(crate) fn new(context: Arc<RuntimeContext>) -> Self {
        Self {
            context,
            uri: None,
            plain_threads: 0,
            schedulable_threads: 0,
            required: Vec::new(),
            offered: Vec::new(),
            services: HashMap::new(),
            pools: Vec::new(),
            hooks: HookChain::default(),
            plugins: Vec::new(),
            callbacks: Callbacks::default(),
        }
    }

    /// Applies a configuration section; later calls still override it.
    pub fn configure(mut self, config: &ComponentConfig) -> Self {
        if let Some(uri) = &config.uri {
            self.uri = Some(uri.clone());
        }
        self.plain_threads = config.plain_threads;
        self.schedulable_threads = config.schedulable_threads;
        self.required
            .extend(config.required.iter().map(|i| InterfaceId::from(i.as_str())));
        self.offered
            .extend(config.offered.iter().map(|i| InterfaceId::from(i.as_str())));
        self.pools.extend(config.pools.iter().cloned());
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Zero threads on both counts makes the component passive.
    pub fn threads(mut self, plain: usize, schedulable: usize) -> Self {
        self.plain_threads = plain;
        self.schedulable_threads = schedulable;
        self
    }

    pub fn requires(mut self, interface: impl Into<InterfaceId>) -> Self {
        self.required.push(interface.into());
        self
    }

    pub fn offers(mut self, interface: impl Into<InterfaceId>, service: impl ServiceHandler) -> Self {
        let interface = interface.into();
        self.offered.push(interface.clone());
        self.services.insert(interface, Arc::new(service));
        self
    }

    /// An extra pool created with the component.
    pub fn executor(mut self, uri: impl Into<String>, threads: usize, schedulable: bool) -> Self {
        self.pools.push(PoolConfig {
            uri: uri.into(),
            threads,
            schedulable,
        });
        self
    }

    pub fn hook(mut self, hook: impl RequestHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&Component) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.callbacks.on_start = Some(Arc::new(f) as Callback);
        self
    }

    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&Component) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.callbacks.on_execute = Some(Arc::new(f) as Callback);
        self
    }

    pub fn on_finalise<F>(mut self, f: F) -> Self
    where
        F: Fn(&Component) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.callbacks.on_finalise = Some(Arc::new(f) as Callback);
        self
    }

    pub fn build(self) -> Result<Component> {
        let uri = self
            .uri
            .unwrap_or_else(|| format!("component-{:016x}", rand::random::<u64>()));
        ensure_contract!(!uri.is_empty(), "component uri must not be empty");
        let passive = self.plain_threads == 0 && self.schedulable_threads == 0;

        let introspection = InterfaceId::from(INTROSPECTION_INTERFACE);
        let mut offered: BTreeSet<InterfaceId> = BTreeSet::new();
        offered.insert(introspection.clone());
        let mut required = BTreeSet::new();
        for interface in self.required {
            ensure_contract!(
                required.insert(interface.clone()),
                "component {uri} requires {interface} twice"
            );
        }
        for interface in self.offered {
            ensure_contract!(
                offered.insert(interface.clone()),
                "component {uri} offers {interface} twice"
            );
        }

        let component = Component {
            inner: Arc::new(ComponentInner {
                uri,
                context: self.context,
                passive,
                state: Mutex::new(ComponentState::Initialised),
                required: RwLock::new(required),
                offered: RwLock::new(offered),
                services: RwLock::new(HashMap::new()),
                hooks: self.hooks,
                ports: RwLock::new(PortTable::default()),
                executors: RwLock::new(ExecutorTable::default()),
                plugins: RwLock::new(Vec::new()),
                pending_plugins: Mutex::new(self.plugins),
                subcomponents: RwLock::new(Vec::new()),
                callbacks: self.callbacks,
            }),
        };

        let mut pools = Vec::new();
        if self.plain_threads > 0 {
            pools.push(PoolConfig {
                uri: STANDARD_POOL_URI.to_string(),
                threads: self.plain_threads,
                schedulable: false,
            });
        }
        if self.schedulable_threads > 0 {
            pools.push(PoolConfig {
                uri: STANDARD_SCHEDULABLE_POOL_URI.to_string(),
                threads: self.schedulable_threads,
                schedulable: true,
            });
        }
        pools.extend(self.pools);

        let assembled = component.assemble(&pools, self.services, introspection);
        if let Err(e) = assembled {
            warn!("component {} failed to build: {e}", component.uri());
            component.abort();
            return Err(e);
        }
        info!(
            "component {} built ({})",
            component.uri(),
            if passive { "passive" } else { "active" }
        );
        Ok(component)
    }
}

impl Component {
    fn assemble(
        &self,
        pools: &[PoolConfig],
        services: HashMap<InterfaceId, Arc<dyn ServiceHandler>>,
        introspection: InterfaceId,
    ) -> Result<()> {
        for pool in pools {
            self.create_new_executor_service(&pool.uri, pool.threads, pool.schedulable)?;
        }
        for (interface, service) in services {
            self.install_service(interface, service);
        }
        self.install_service(introspection.clone(), Arc::new(IntrospectionService));
        let port =
            InboundPort::create_with_uri(self, introspection_port_uri(self.uri()), introspection)?;
        port.publish()
    }

    /// Releases whatever a failed build already acquired.
    fn abort(&self) {
        for handle in self.take_ports() {
            handle.dismantle();
        }
        for manager in self.inner.executors.read().iter() {
            manager.pool().shutdown_now();
        }
        *self.inner.state.lock() = ComponentState::Terminated;
    }
}
