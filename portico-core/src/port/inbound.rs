use std::{collections::BTreeSet, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{create, delegate_to_core, Port, PortCore, PortEndpoint, PortHandle, PortKind};
use crate::{
    component::Component,
    connector::ConnectorSpec,
    executor::PoolRef,
    interface::{Call, InterfaceId},
    Result,
};

/// The offered side of a one-way connection.
///
/// An inbound port may serve several clients at once. It counts as
/// connected while at least one client is attached, and cannot be
/// unpublished or destroyed in that state.
pub struct InboundPort {
    pub(crate) core: PortCore,
    clients: Mutex<BTreeSet<String>>,
}

impl InboundPort {
    /// Creates a port with a generated URI; `interface` must be offered by `owner`.
    pub fn create(owner: &Component, interface: impl Into<InterfaceId>) -> Result<Arc<Self>> {
        Self::build(owner, None, interface.into(), PoolRef::Default)
    }

    pub fn create_with_uri(
        owner: &Component,
        uri: impl Into<String>,
        interface: impl Into<InterfaceId>,
    ) -> Result<Arc<Self>> {
        Self::build(owner, Some(uri.into()), interface.into(), PoolRef::Default)
    }

    /// Creates a port whose calls are served on the given pool of `owner`.
    pub fn create_on_pool(
        owner: &Component,
        uri: Option<String>,
        interface: impl Into<InterfaceId>,
        pool: impl Into<PoolRef>,
    ) -> Result<Arc<Self>> {
        Self::build(owner, uri, interface.into(), pool.into())
    }

    fn build(
        owner: &Component,
        uri: Option<String>,
        interface: InterfaceId,
        pool: PoolRef,
    ) -> Result<Arc<Self>> {
        create(
            owner,
            uri,
            interface,
            PortKind::Inbound,
            pool,
            |core| InboundPort {
                core,
                clients: Mutex::new(BTreeSet::new()),
            },
            PortHandle::Inbound,
        )
    }

    pub fn uri(&self) -> &str {
        self.core.uri()
    }

    pub fn interface(&self) -> &InterfaceId {
        self.core.interface()
    }

    pub fn kind(&self) -> PortKind {
        PortKind::Inbound
    }

    pub fn client_uris(&self) -> Vec<String> {
        self.clients.lock().iter().cloned().collect()
    }

    /// Forgets every attached client, warning about each one.
    pub(crate) fn detach_all(&self) {
        let clients = std::mem::take(&mut *self.clients.lock());
        for client in clients {
            warn!(
                "port {}: client {client} still attached, detaching it",
                self.core.uri()
            );
        }
    }
}

impl Port for InboundPort {
    delegate_to_core!();

    fn unpublish(&self) -> Result<()> {
        ensure_contract!(
            !self.connected(),
            "port {} cannot be unpublished while clients {:?} are attached",
            self.core.uri(),
            self.client_uris()
        );
        self.core.unpublish()
    }

    fn connected(&self) -> bool {
        !self.clients.lock().is_empty()
    }

    fn is_remotely_connected(&self) -> bool {
        false
    }
}

impl PortEndpoint for InboundPort {
    fn uri(&self) -> &str {
        self.core.uri()
    }

    fn interface(&self) -> &InterfaceId {
        self.core.interface()
    }

    fn kind(&self) -> PortKind {
        PortKind::Inbound
    }

    fn deliver(&self, call: Call) -> Result<Value> {
        self.core.serve(call)
    }

    fn deliver_async(&self, call: Call) -> Result<()> {
        self.core.serve_async(call)
    }

    fn obey_connection(&self, peer_uri: &str, _connector: ConnectorSpec) -> Result<()> {
        Err(contract_violation!(
            "inbound port {} never takes part in connection negotiation (peer {peer_uri})",
            self.core.uri()
        ))
    }

    fn obey_disconnection(&self) -> Result<()> {
        Err(contract_violation!(
            "inbound port {} never takes part in disconnection negotiation",
            self.core.uri()
        ))
    }

    fn attach_client(&self, client_uri: &str) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.ensure_published()?;
        ensure_contract!(
            self.clients.lock().insert(client_uri.to_string()),
            "client {client_uri} is already attached to port {}",
            self.core.uri()
        );
        debug!("port {}: client {client_uri} attached", self.core.uri());
        Ok(())
    }

    fn detach_client(&self, client_uri: &str) -> Result<()> {
        ensure_contract!(
            self.clients.lock().remove(client_uri),
            "client {client_uri} is not attached to port {}",
            self.core.uri()
        );
        debug!("port {}: client {client_uri} detached", self.core.uri());
        Ok(())
    }
}
