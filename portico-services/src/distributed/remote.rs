use std::{fmt, sync::Weak};

use portico_core::{
    connector::ConnectorSpec,
    interface::{Call, InterfaceId},
    port::{PortEndpoint, PortKind},
    Error, Result,
};
use serde_json::Value;
use tracing::trace;

use super::{
    wire::{self, Frame, Reply},
    DistributedDirectory,
};

/// Stand-in for a port owned by another host.
///
/// Connectors hold it like any local endpoint; every operation is encoded,
/// replayed on the owning host and its outcome decoded, errors included.
pub struct RemoteEndpoint {
    uri: String,
    interface: InterfaceId,
    kind: PortKind,
    host: String,
    directory: Weak<DistributedDirectory>,
}

impl RemoteEndpoint {
    pub(crate) fn new(
        uri: String,
        interface: InterfaceId,
        kind: PortKind,
        host: String,
        directory: Weak<DistributedDirectory>,
    ) -> Self {
        Self {
            uri,
            interface,
            kind,
            host,
            directory,
        }
    }

    /// The host owning the port.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn exchange(&self, frame: Frame) -> Result<Value> {
        let Some(directory) = self.directory.upgrade() else {
            return Err(Error::Unresolved(self.uri.clone()));
        };
        let bytes = wire::encode(&frame)?;
        trace!("{} bytes to {} on host {}", bytes.len(), self.uri, self.host);
        let reply = directory.dispatch(&bytes);
        wire::decode::<Reply>(&reply)?.into()
    }

    fn exchange_unit(&self, frame: Frame) -> Result<()> {
        self.exchange(frame).map(|_| ())
    }
}

impl PortEndpoint for RemoteEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn interface(&self) -> &InterfaceId {
        &self.interface
    }

    fn kind(&self) -> PortKind {
        self.kind
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn deliver(&self, call: Call) -> Result<Value> {
        self.exchange(Frame::Deliver {
            port: self.uri.clone(),
            call,
        })
    }

    fn deliver_async(&self, call: Call) -> Result<()> {
        self.exchange_unit(Frame::DeliverAsync {
            port: self.uri.clone(),
            call,
        })
    }

    /// Connector instances cannot travel; the peer host builds one of the same type.
    fn obey_connection(&self, peer_uri: &str, connector: ConnectorSpec) -> Result<()> {
        self.exchange_unit(Frame::ObeyConnection {
            port: self.uri.clone(),
            peer: peer_uri.to_string(),
            connector: connector.type_name().to_string(),
        })
    }

    fn obey_disconnection(&self) -> Result<()> {
        self.exchange_unit(Frame::ObeyDisconnection {
            port: self.uri.clone(),
        })
    }

    fn attach_client(&self, client_uri: &str) -> Result<()> {
        self.exchange_unit(Frame::AttachClient {
            port: self.uri.clone(),
            client: client_uri.to_string(),
        })
    }

    fn detach_client(&self, client_uri: &str) -> Result<()> {
        self.exchange_unit(Frame::DetachClient {
            port: self.uri.clone(),
            client: client_uri.to_string(),
        })
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("uri", &self.uri)
            .field("interface", &self.interface)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .finish()
    }
}
