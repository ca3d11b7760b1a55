use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use super::{
    create, delegate_to_core, Connectable, Port, PortCore, PortEndpoint, PortHandle, PortKind,
    RequestRelay,
};
use crate::{
    component::Component,
    connector::{Connector, ConnectorKind, ConnectorSpec},
    executor::PoolRef,
    interface::{Call, InterfaceId},
    Result,
};

struct Link {
    server_uri: String,
    connector: Arc<dyn Connector>,
    remote: bool,
}

/// The required side of a one-way connection.
pub struct OutboundPort {
    pub(crate) core: PortCore,
    link: Mutex<Option<Link>>,
}

impl OutboundPort {
    /// Creates a port with a generated URI; `interface` must be required by `owner`.
    pub fn create(owner: &Component, interface: impl Into<InterfaceId>) -> Result<Arc<Self>> {
        Self::build(owner, None, interface.into())
    }

    pub fn create_with_uri(
        owner: &Component,
        uri: impl Into<String>,
        interface: impl Into<InterfaceId>,
    ) -> Result<Arc<Self>> {
        Self::build(owner, Some(uri.into()), interface.into())
    }

    fn build(owner: &Component, uri: Option<String>, interface: InterfaceId) -> Result<Arc<Self>> {
        create(
            owner,
            uri,
            interface,
            PortKind::Outbound,
            PoolRef::Default,
            |core| OutboundPort {
                core,
                link: Mutex::new(None),
            },
            PortHandle::Outbound,
        )
    }

    pub fn uri(&self) -> &str {
        self.core.uri()
    }

    pub fn interface(&self) -> &InterfaceId {
        self.core.interface()
    }

    pub fn kind(&self) -> PortKind {
        PortKind::Outbound
    }

    fn connector(&self) -> Result<Arc<dyn Connector>> {
        match self.link.lock().as_ref() {
            Some(link) => Ok(link.connector.clone()),
            None => Err(contract_violation!(
                "port {} is not connected",
                self.core.uri()
            )),
        }
    }
}

impl Port for OutboundPort {
    delegate_to_core!();

    fn unpublish(&self) -> Result<()> {
        ensure_contract!(
            !self.connected(),
            "port {} cannot be unpublished while connected",
            self.core.uri()
        );
        self.core.unpublish()
    }

    fn connected(&self) -> bool {
        self.link.lock().is_some()
    }

    fn is_remotely_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|l| l.remote)
    }
}

impl Connectable for OutboundPort {
    fn do_connection(&self, server_uri: &str, connector: ConnectorSpec) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.ensure_published()?;
        let mut link = self.link.lock();
        ensure_contract!(
            link.is_none(),
            "port {} is already connected",
            self.core.uri()
        );
        let connector = self.core.context().make_connector(&connector)?;
        ensure_contract!(
            connector.kind() == ConnectorKind::OneWay,
            "port {} needs a one-way connector, {} is two-way",
            self.core.uri(),
            connector.type_name()
        );
        let server = self.core.context().resolve(server_uri)?;
        self.core.check_peer(server.endpoint.as_ref(), PortKind::Inbound)?;
        connector.connect(server.endpoint, self.core.endpoint()?)?;
        info!(
            "port {} connected to {server_uri} through {}{}",
            self.core.uri(),
            connector.type_name(),
            if server.remote { " (remote)" } else { "" }
        );
        *link = Some(Link {
            server_uri: server_uri.to_string(),
            connector,
            remote: server.remote,
        });
        Ok(())
    }

    fn do_disconnection(&self) -> Result<()> {
        let Some(link) = self.link.lock().take() else {
            return Err(contract_violation!(
                "port {} is not connected",
                self.core.uri()
            ));
        };
        if let Err(e) = link.connector.disconnect() {
            warn!(
                "port {}: connector failed to release {}: {e}",
                self.core.uri(),
                link.server_uri
            );
        }
        info!(
            "port {} disconnected from {}",
            self.core.uri(),
            link.server_uri
        );
        Ok(())
    }

    fn server_port_uri(&self) -> Option<String> {
        self.link.lock().as_ref().map(|l| l.server_uri.clone())
    }

    fn client_port_uri(&self) -> Option<String> {
        self.link
            .lock()
            .as_ref()
            .map(|_| self.core.uri().to_string())
    }
}

impl RequestRelay for OutboundPort {
    fn call(&self, call: Call) -> Result<Value> {
        self.connector()?.relay(self.core.uri(), call)
    }

    fn call_async(&self, call: Call) -> Result<()> {
        self.connector()?.relay_async(self.core.uri(), call)
    }
}

impl PortEndpoint for OutboundPort {
    fn uri(&self) -> &str {
        self.core.uri()
    }

    fn interface(&self) -> &InterfaceId {
        self.core.interface()
    }

    fn kind(&self) -> PortKind {
        PortKind::Outbound
    }

    fn deliver(&self, call: Call) -> Result<Value> {
        Err(contract_violation!(
            "outbound port {} does not serve calls ({})",
            self.core.uri(),
            call.operation
        ))
    }

    fn deliver_async(&self, call: Call) -> Result<()> {
        self.deliver(call).map(|_| ())
    }

    fn obey_connection(&self, peer_uri: &str, _connector: ConnectorSpec) -> Result<()> {
        Err(contract_violation!(
            "outbound port {} cannot obey a connection from {peer_uri}",
            self.core.uri()
        ))
    }

    fn obey_disconnection(&self) -> Result<()> {
        Err(contract_violation!(
            "outbound port {} cannot obey a disconnection",
            self.core.uri()
        ))
    }

    fn attach_client(&self, client_uri: &str) -> Result<()> {
        Err(contract_violation!(
            "outbound port {} cannot accept client {client_uri}",
            self.core.uri()
        ))
    }

    fn detach_client(&self, client_uri: &str) -> Result<()> {
        self.attach_client(client_uri)
    }
}
