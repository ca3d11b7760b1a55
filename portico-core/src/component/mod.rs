//! Components: the units that own ports, interfaces and executor pools.
//!
//! A [`Component`] is a cheap handle; clones refer to the same component.
//! Ports, pool jobs and plug-ins only hold weak references to it, so the
//! component lives as long as whoever assembled it keeps a handle.
//!
//! # Lifecycle
//!
//! `Initialised -> Started -> Finalised -> ShuttingDown -> Shutdown -> Terminated`
//!
//! Every transition checks its source state and never goes back. The last
//! two states are derived lazily from the status of the component's pools.
//!
//! # Concurrency
//!
//! A component built with no threads is passive: all dispatched work runs
//! on the caller's thread. Otherwise it owns a standard pool and/or a
//! standard schedulable pool, plus any pools created later, and dispatch
//! operations pick one by URI, by index or by default.
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    context::RuntimeContext,
    executor::{ExecutorTable, PoolRef},
    interface::{Call, InterfaceId},
    plugin::Plugin,
    port::{PortHandle, PortKind},
    service::{compose, HandlerParams, HookChain, RequestScope, ServiceHandler},
    AnyResult, Result,
};

mod builder;
mod dispatch;
mod introspection;
mod lifecycle;
mod state;

pub use builder::ComponentBuilder;
pub use introspection::{
    introspection_port_uri, ComponentDescription, ExecutorDescription, PortDescription,
    INTROSPECTION_INTERFACE,
};
pub use state::ComponentState;

pub(crate) type Callback = Arc<dyn Fn(&Component) -> AnyResult<()> + Send + Sync>;

#[derive(Default, Clone)]
pub(crate) struct Callbacks {
    pub(crate) on_start: Option<Callback>,
    pub(crate) on_execute: Option<Callback>,
    pub(crate) on_finalise: Option<Callback>,
}

#[derive(Default)]
struct PortTable {
    by_uri: HashMap<String, PortHandle>,
    by_interface: HashMap<InterfaceId, BTreeSet<String>>,
}

impl PortTable {
    fn insert(&mut self, handle: PortHandle) {
        let port = handle.port();
        self.by_interface
            .entry(port.interface().clone())
            .or_default()
            .insert(port.uri().to_string());
        self.by_uri.insert(port.uri().to_string(), handle);
    }

    fn remove(&mut self, uri: &str) -> Option<PortHandle> {
        let handle = self.by_uri.remove(uri)?;
        let interface = handle.port().interface().clone();
        if let Some(uris) = self.by_interface.get_mut(&interface) {
            uris.remove(uri);
            if uris.is_empty() {
                self.by_interface.remove(&interface);
            }
        }
        Some(handle)
    }

    fn uses(&self, interface: &InterfaceId) -> bool {
        self.by_interface.contains_key(interface)
    }
}

pub(crate) struct ComponentInner {
    uri: String,
    context: Arc<RuntimeContext>,
    passive: bool,
    state: Mutex<ComponentState>,
    required: RwLock<BTreeSet<InterfaceId>>,
    offered: RwLock<BTreeSet<InterfaceId>>,
    services: RwLock<HashMap<InterfaceId, Arc<dyn ServiceHandler>>>,
    hooks: HookChain,
    ports: RwLock<PortTable>,
    executors: RwLock<ExecutorTable>,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    pending_plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    subcomponents: RwLock<Vec<Component>>,
    callbacks: Callbacks,
}

#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

/// A non-owning reference held by ports and queued jobs.
#[derive(Clone)]
pub(crate) struct WeakComponent(Weak<ComponentInner>);

impl WeakComponent {
    pub(crate) fn upgrade(&self) -> Option<Component> {
        self.0.upgrade().map(|inner| Component { inner })
    }
}

impl Component {
    pub fn builder(context: &Arc<RuntimeContext>) -> ComponentBuilder {
        ComponentBuilder::new(context.clone())
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.inner.context
    }

    /// Whether the component was built without threads.
    pub fn is_passive(&self) -> bool {
        self.inner.passive
    }

    pub fn ptr_eq(&self, other: &Component) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakComponent {
        WeakComponent(Arc::downgrade(&self.inner))
    }

    fn raw_state(&self) -> ComponentState {
        *self.inner.state.lock()
    }

    fn ensure_not_terminated(&self) -> Result<()> {
        ensure_contract!(
            self.raw_state() != ComponentState::Terminated,
            "component {} is terminated",
            self.uri()
        );
        Ok(())
    }

    // Interfaces

    pub fn add_required_interface(&self, interface: impl Into<InterfaceId>) -> Result<()> {
        self.ensure_not_terminated()?;
        let interface = interface.into();
        ensure_contract!(
            self.inner.required.write().insert(interface.clone()),
            "component {} already requires {interface}",
            self.uri()
        );
        debug!("component {} requires {interface}", self.uri());
        Ok(())
    }

    pub fn remove_required_interface(&self, interface: &InterfaceId) -> Result<()> {
        self.ensure_not_terminated()?;
        self.ensure_unused(interface)?;
        ensure_contract!(
            self.inner.required.write().remove(interface),
            "component {} does not require {interface}",
            self.uri()
        );
        Ok(())
    }

    /// Declares an offered interface; calls on it fail until a service is installed.
    pub fn add_offered_interface(&self, interface: impl Into<InterfaceId>) -> Result<()> {
        self.ensure_not_terminated()?;
        let interface = interface.into();
        ensure_contract!(
            self.inner.offered.write().insert(interface.clone()),
            "component {} already offers {interface}",
            self.uri()
        );
        debug!("component {} offers {interface}", self.uri());
        Ok(())
    }

    /// Declares an offered interface together with the service implementing it.
    pub fn add_offered_service(
        &self,
        interface: impl Into<InterfaceId>,
        service: impl ServiceHandler,
    ) -> Result<()> {
        let interface = interface.into();
        self.add_offered_interface(interface.clone())?;
        self.install_service(interface, Arc::new(service));
        Ok(())
    }

    pub fn remove_offered_interface(&self, interface: &InterfaceId) -> Result<()> {
        self.ensure_not_terminated()?;
        self.ensure_unused(interface)?;
        ensure_contract!(
            self.inner.offered.write().remove(interface),
            "component {} does not offer {interface}",
            self.uri()
        );
        self.inner.services.write().remove(interface);
        Ok(())
    }

    pub(crate) fn install_service(&self, interface: InterfaceId, service: Arc<dyn ServiceHandler>) {
        let params = HandlerParams {
            scope: RequestScope {
                component: Arc::from(self.uri()),
                interface: interface.clone(),
            },
            hooks: self.inner.hooks.clone(),
        };
        self.inner
            .services
            .write()
            .insert(interface, compose(params, service));
    }

    fn ensure_unused(&self, interface: &InterfaceId) -> Result<()> {
        ensure_contract!(
            !self.inner.ports.read().uses(interface),
            "interface {interface} of component {} still backs a port",
            self.uri()
        );
        Ok(())
    }

    pub fn is_required_interface(&self, interface: &InterfaceId) -> Result<bool> {
        self.ensure_not_terminated()?;
        Ok(self.inner.required.read().contains(interface))
    }

    pub fn is_offered_interface(&self, interface: &InterfaceId) -> Result<bool> {
        self.ensure_not_terminated()?;
        Ok(self.inner.offered.read().contains(interface))
    }

    pub fn required_interfaces(&self) -> Result<Vec<InterfaceId>> {
        self.ensure_not_terminated()?;
        Ok(self.inner.required.read().iter().cloned().collect())
    }

    pub fn offered_interfaces(&self) -> Result<Vec<InterfaceId>> {
        self.ensure_not_terminated()?;
        Ok(self.inner.offered.read().iter().cloned().collect())
    }

    /// Required and offered interfaces together.
    pub fn interfaces(&self) -> Result<Vec<InterfaceId>> {
        let mut all: BTreeSet<InterfaceId> = self.required_interfaces()?.into_iter().collect();
        all.extend(self.offered_interfaces()?);
        Ok(all.into_iter().collect())
    }

    // Ports

    pub(crate) fn check_port_creation(
        &self,
        interface: &InterfaceId,
        kind: PortKind,
        pool: &PoolRef,
    ) -> Result<()> {
        let state = self.raw_state();
        ensure_contract!(
            state < ComponentState::ShuttingDown,
            "component {} cannot create ports while {state}",
            self.uri()
        );
        let required = self.inner.required.read().contains(interface);
        let offered = self.inner.offered.read().contains(interface);
        let declared = match kind {
            PortKind::Outbound => required,
            PortKind::Inbound => offered,
            PortKind::TwoWay => required || offered,
        };
        ensure_contract!(
            declared,
            "component {} does not declare {interface} for a {kind:?} port",
            self.uri()
        );
        if *pool != PoolRef::Default {
            ensure_contract!(
                self.inner.executors.read().lookup(pool).is_some(),
                "component {} has no executor service {pool}",
                self.uri()
            );
        }
        Ok(())
    }

    pub(crate) fn register_port(&self, handle: PortHandle) -> Result<()> {
        let mut ports = self.inner.ports.write();
        let uri = handle.port().uri().to_string();
        ensure_contract!(
            !ports.by_uri.contains_key(&uri),
            "component {} already owns a port {uri}",
            self.uri()
        );
        ports.insert(handle);
        debug!("component {}: port {uri} created", self.uri());
        Ok(())
    }

    pub fn find_port_from_uri(&self, uri: &str) -> Result<Option<PortHandle>> {
        self.ensure_not_terminated()?;
        Ok(self.inner.ports.read().by_uri.get(uri).cloned())
    }

    pub fn find_port_uris_from_interface(&self, interface: &InterfaceId) -> Result<Vec<String>> {
        self.ensure_not_terminated()?;
        Ok(self
            .inner
            .ports
            .read()
            .by_interface
            .get(interface)
            .map(|uris| uris.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn find_inbound_port_uris_from_interface(
        &self,
        interface: &InterfaceId,
    ) -> Result<Vec<String>> {
        let ports = self.ports()?;
        Ok(ports
            .into_iter()
            .filter(|h| h.as_inbound().is_some() && h.port().interface() == interface)
            .map(|h| h.port().uri().to_string())
            .collect())
    }

    pub fn is_port_existing(&self, uri: &str) -> Result<bool> {
        self.ensure_not_terminated()?;
        Ok(self.inner.ports.read().by_uri.contains_key(uri))
    }

    pub fn ports(&self) -> Result<Vec<PortHandle>> {
        self.ensure_not_terminated()?;
        let mut ports: Vec<_> = self.inner.ports.read().by_uri.values().cloned().collect();
        ports.sort_by(|a, b| a.port().uri().cmp(b.port().uri()));
        Ok(ports)
    }

    /// The port `uri`; a missing port is a contract violation.
    pub fn port(&self, uri: &str) -> Result<PortHandle> {
        self.find_port_from_uri(uri)?.ok_or_else(|| {
            contract_violation!("component {} has no port {uri}", self.uri())
        })
    }

    /// Removes a port for good; it must be unpublished and disconnected first.
    pub fn destroy_port(&self, uri: &str) -> Result<()> {
        let handle = self.port(uri)?;
        let port = handle.port();
        ensure_contract!(
            !port.connected(),
            "port {uri} must be disconnected before it is destroyed"
        );
        ensure_contract!(
            !port.is_published(),
            "port {uri} must be unpublished before it is destroyed"
        );
        self.inner.ports.write().remove(uri);
        handle.destroy();
        info!("component {}: port {uri} destroyed", self.uri());
        Ok(())
    }

    pub fn do_port_connection(
        &self,
        port_uri: &str,
        peer_uri: &str,
        connector: impl Into<crate::connector::ConnectorSpec>,
    ) -> Result<()> {
        let handle = self.port(port_uri)?;
        let Some(port) = handle.connectable() else {
            return Err(contract_violation!(
                "inbound port {port_uri} cannot initiate a connection"
            ));
        };
        port.do_connection(peer_uri, connector.into())
    }

    pub fn do_port_disconnection(&self, port_uri: &str) -> Result<()> {
        let handle = self.port(port_uri)?;
        let Some(port) = handle.connectable() else {
            return Err(contract_violation!(
                "inbound port {port_uri} cannot initiate a disconnection"
            ));
        };
        port.do_disconnection()
    }

    fn take_ports(&self) -> Vec<PortHandle> {
        let mut ports = self.inner.ports.write();
        ports.by_interface.clear();
        ports.by_uri.drain().map(|(_, h)| h).collect()
    }

    // Calls

    fn service_for(&self, interface: &InterfaceId) -> Result<Arc<dyn ServiceHandler>> {
        match self.inner.services.read().get(interface) {
            Some(service) => Ok(service.clone()),
            None => Err(contract_violation!(
                "component {} has no service for {interface}",
                self.uri()
            )),
        }
    }

    /// Serves a call arriving on one of this component's ports.
    pub(crate) fn serve_call(
        &self,
        pool: &PoolRef,
        interface: &InterfaceId,
        call: Call,
    ) -> Result<Value> {
        let service = self.service_for(interface)?;
        self.handle_request_sync_on(pool.clone(), move |owner| service.handle(owner, call))
    }

    pub(crate) fn serve_call_async(
        &self,
        pool: &PoolRef,
        interface: &InterfaceId,
        call: Call,
    ) -> Result<()> {
        let service = self.service_for(interface)?;
        self.handle_request_async_on(pool.clone(), move |owner| service.handle(owner, call))
    }

    // Plug-ins

    /// Installs a plug-in; the component must be started.
    pub fn install_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let state = self.raw_state();
        ensure_contract!(
            state == ComponentState::Started,
            "component {} cannot install plug-in {} while {state}",
            self.uri(),
            plugin.uri()
        );
        ensure_contract!(
            !self.is_installed(plugin.uri()),
            "plug-in {} is already installed on {}",
            plugin.uri(),
            self.uri()
        );
        plugin.install(self).map_err(crate::Error::Execution)?;
        info!("component {}: plug-in {} installed", self.uri(), plugin.uri());
        self.inner.plugins.write().push(plugin);
        Ok(())
    }

    pub fn uninstall_plugin(&self, uri: &str) -> Result<()> {
        let plugin = {
            let mut plugins = self.inner.plugins.write();
            let Some(position) = plugins.iter().position(|p| p.uri() == uri) else {
                return Err(contract_violation!(
                    "plug-in {uri} is not installed on {}",
                    self.uri()
                ));
            };
            plugins.remove(position)
        };
        plugin.uninstall(self).map_err(crate::Error::Execution)?;
        info!("component {}: plug-in {uri} uninstalled", self.uri());
        Ok(())
    }

    pub fn is_installed(&self, uri: &str) -> bool {
        self.inner.plugins.read().iter().any(|p| p.uri() == uri)
    }

    pub fn get_plugin(&self, uri: &str) -> Option<Arc<dyn Plugin>> {
        self.inner
            .plugins
            .read()
            .iter()
            .find(|p| p.uri() == uri)
            .cloned()
    }

    pub fn plugin_uris(&self) -> Vec<String> {
        self.inner
            .plugins
            .read()
            .iter()
            .map(|p| p.uri().to_string())
            .collect()
    }

    // Sub-components

    /// Adds an inner component started, finalised and shut down with this one.
    pub fn add_subcomponent(&self, child: Component) -> Result<()> {
        let state = self.raw_state();
        ensure_contract!(
            state == ComponentState::Initialised,
            "component {} cannot adopt sub-components while {state}",
            self.uri()
        );
        ensure_contract!(
            child.raw_state() == ComponentState::Initialised,
            "sub-component {} must be initialised",
            child.uri()
        );
        ensure_contract!(
            !child.ptr_eq(self) && !child.contains(self),
            "component {} cannot contain itself through {}",
            self.uri(),
            child.uri()
        );
        let mut children = self.inner.subcomponents.write();
        ensure_contract!(
            !children.iter().any(|c| c.ptr_eq(&child)),
            "component {} already contains {}",
            self.uri(),
            child.uri()
        );
        debug!("component {}: sub-component {} added", self.uri(), child.uri());
        children.push(child);
        Ok(())
    }

    pub fn subcomponents(&self) -> Vec<Component> {
        self.inner.subcomponents.read().clone()
    }

    /// Whether `other` is somewhere below this component.
    fn contains(&self, other: &Component) -> bool {
        let mut pending = self.subcomponents();
        while let Some(next) = pending.pop() {
            if next.ptr_eq(other) {
                return true;
            }
            pending.extend(next.subcomponents());
        }
        false
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("uri", &self.inner.uri)
            .field("state", &self.raw_state())
            .field("passive", &self.inner.passive)
            .finish()
    }
}
