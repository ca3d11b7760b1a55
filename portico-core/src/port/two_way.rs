use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
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

/// Which end of a two-way connection a port is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoWayRole {
    /// The end that initiated the connection.
    Client,
    Server,
}

struct Link {
    role: TwoWayRole,
    peer_uri: String,
    connector: Arc<dyn Connector>,
    remote: bool,
}

/// Connection state of a two-way port.
///
/// `Negotiating` reserves the port while a connection is set up without its
/// lock held, since setup reaches into the peer port.
enum Slot {
    Free,
    Negotiating,
    Linked(Link),
}

impl Slot {
    fn link(&self) -> Option<&Link> {
        match self {
            Slot::Linked(link) => Some(link),
            _ => None,
        }
    }

    fn take_link(&mut self) -> Option<Link> {
        match std::mem::replace(self, Slot::Free) {
            Slot::Linked(link) => Some(link),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// A symmetric port: once connected, either end may call the other.
pub struct TwoWayPort {
    pub(crate) core: PortCore,
    link: Mutex<Slot>,
}

impl TwoWayPort {
    /// Creates a port with a generated URI; `interface` must be declared by `owner`.
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

    /// Creates a port whose incoming calls are served on the given pool of `owner`.
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
            PortKind::TwoWay,
            pool,
            |core| TwoWayPort {
                core,
                link: Mutex::new(Slot::Free),
            },
            PortHandle::TwoWay,
        )
    }

    pub fn uri(&self) -> &str {
        self.core.uri()
    }

    pub fn interface(&self) -> &InterfaceId {
        self.core.interface()
    }

    pub fn kind(&self) -> PortKind {
        PortKind::TwoWay
    }

    pub fn role(&self) -> Option<TwoWayRole> {
        self.link.lock().link().map(|l| l.role)
    }

    pub fn peer_port_uri(&self) -> Option<String> {
        self.link.lock().link().map(|l| l.peer_uri.clone())
    }

    fn connector(&self) -> Result<Arc<dyn Connector>> {
        match self.link.lock().link() {
            Some(link) => Ok(link.connector.clone()),
            None => Err(contract_violation!(
                "port {} is not connected",
                self.core.uri()
            )),
        }
    }

    fn check_connector(&self, connector: &dyn Connector) -> Result<()> {
        ensure_contract!(
            connector.kind() == ConnectorKind::TwoWay,
            "port {} needs a two-way connector, {} is one-way",
            self.core.uri(),
            connector.type_name()
        );
        Ok(())
    }

    /// Claims the port for a connection attempt.
    fn reserve(&self) -> Result<()> {
        let mut slot = self.link.lock();
        match *slot {
            Slot::Free => {
                *slot = Slot::Negotiating;
                Ok(())
            }
            Slot::Negotiating => Err(contract_violation!(
                "port {} is already being connected",
                self.core.uri()
            )),
            Slot::Linked(_) => Err(contract_violation!(
                "port {} is already connected",
                self.core.uri()
            )),
        }
    }

    /// Ends a connection attempt started by [`TwoWayPort::reserve`].
    fn settle(&self, outcome: Result<Link>) -> Result<()> {
        let mut slot = self.link.lock();
        match outcome {
            Ok(link) => {
                *slot = Slot::Linked(link);
                Ok(())
            }
            Err(e) => {
                *slot = Slot::Free;
                Err(e)
            }
        }
    }

    fn connect_as_client(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<Link> {
        let connector = self.core.context().make_connector(&connector)?;
        self.check_connector(connector.as_ref())?;
        let peer = self.core.context().resolve(peer_uri)?;
        self.core.check_peer(peer.endpoint.as_ref(), PortKind::TwoWay)?;
        connector.connect(peer.endpoint, self.core.endpoint()?)?;
        if let Err(e) = connector.obey_connection(&connector) {
            if let Err(undo) = connector.disconnect() {
                warn!("port {}: rollback failed: {undo}", self.core.uri());
            }
            return Err(e);
        }
        info!(
            "port {} connected as client to {peer_uri} through {}{}",
            self.core.uri(),
            connector.type_name(),
            if peer.remote { " (remote)" } else { "" }
        );
        Ok(Link {
            role: TwoWayRole::Client,
            peer_uri: peer_uri.to_string(),
            connector,
            remote: peer.remote,
        })
    }

    fn connect_as_server(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<Link> {
        let connector = self.core.context().make_connector(&connector)?;
        self.check_connector(connector.as_ref())?;
        let peer = self.core.context().resolve(peer_uri)?;
        if !connector.connected() {
            self.core.check_peer(peer.endpoint.as_ref(), PortKind::TwoWay)?;
            connector.connect(self.core.endpoint()?, peer.endpoint)?;
        }
        info!(
            "port {} connected as server to {peer_uri}{}",
            self.core.uri(),
            if peer.remote { " (remote)" } else { "" }
        );
        Ok(Link {
            role: TwoWayRole::Server,
            peer_uri: peer_uri.to_string(),
            connector,
            remote: peer.remote,
        })
    }

    fn uri_for(&self, role: TwoWayRole) -> Option<String> {
        self.link.lock().link().map(|l| {
            if l.role == role {
                self.core.uri().to_string()
            } else {
                l.peer_uri.clone()
            }
        })
    }
}

impl Port for TwoWayPort {
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
        self.link.lock().link().is_some()
    }

    fn is_remotely_connected(&self) -> bool {
        self.link.lock().link().is_some_and(|l| l.remote)
    }
}

impl Connectable for TwoWayPort {
    /// Connects as the client and has the peer complete its side in the same step.
    fn do_connection(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.ensure_published()?;
        self.reserve()?;
        self.settle(self.connect_as_client(peer_uri, connector))
    }

    /// Either end may disconnect; the peer is asked to drop its side first.
    fn do_disconnection(&self) -> Result<()> {
        let Some(link) = self.link.lock().take_link() else {
            return Err(contract_violation!(
                "port {} is not connected",
                self.core.uri()
            ));
        };
        if let Err(e) = link.connector.obey_disconnection(self.core.uri()) {
            warn!(
                "port {}: peer {} failed to disconnect: {e}",
                self.core.uri(),
                link.peer_uri
            );
        }
        if let Err(e) = link.connector.disconnect() {
            warn!("port {}: connector release failed: {e}", self.core.uri());
        }
        info!(
            "port {} disconnected from {}",
            self.core.uri(),
            link.peer_uri
        );
        Ok(())
    }

    fn server_port_uri(&self) -> Option<String> {
        self.uri_for(TwoWayRole::Server)
    }

    fn client_port_uri(&self) -> Option<String> {
        self.uri_for(TwoWayRole::Client)
    }
}

impl RequestRelay for TwoWayPort {
    fn call(&self, call: Call) -> Result<Value> {
        self.connector()?.relay(self.core.uri(), call)
    }

    fn call_async(&self, call: Call) -> Result<()> {
        self.connector()?.relay_async(self.core.uri(), call)
    }
}

impl PortEndpoint for TwoWayPort {
    fn uri(&self) -> &str {
        self.core.uri()
    }

    fn interface(&self) -> &InterfaceId {
        self.core.interface()
    }

    fn kind(&self) -> PortKind {
        PortKind::TwoWay
    }

    fn deliver(&self, call: Call) -> Result<Value> {
        self.core.serve(call)
    }

    fn deliver_async(&self, call: Call) -> Result<()> {
        self.core.serve_async(call)
    }

    /// Server side of a connection initiated by `peer_uri`.
    ///
    /// A local peer shares its already connected connector. A remote peer
    /// sends a connector type instead, so this side builds and connects its
    /// own connector towards a reference on the client port.
    fn obey_connection(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.ensure_published()?;
        self.reserve()?;
        self.settle(self.connect_as_server(peer_uri, connector))
    }

    fn obey_disconnection(&self) -> Result<()> {
        let Some(link) = self.link.lock().take_link() else {
            return Err(contract_violation!(
                "port {} is not connected",
                self.core.uri()
            ));
        };
        // A remote peer cannot release this host's connector.
        if link.remote {
            if let Err(e) = link.connector.disconnect() {
                warn!("port {}: connector release failed: {e}", self.core.uri());
            }
        }
        info!(
            "port {} released by its peer {}",
            self.core.uri(),
            link.peer_uri
        );
        Ok(())
    }

    fn attach_client(&self, client_uri: &str) -> Result<()> {
        Err(contract_violation!(
            "two-way port {} does not track one-way clients ({client_uri})",
            self.core.uri()
        ))
    }

    fn detach_client(&self, client_uri: &str) -> Result<()> {
        self.attach_client(client_uri)
    }
}
